//! Orchestration of the whole module chain.
//!
//! A [`BusManager`] owns the transport and the fixed table of [`BatteryModule`]s. After
//! one of the discovery routines ran it is ticked periodically; every tick polls all
//! existing modules, recomputes the [`PackState`], decides on balancing and publishes the
//! results into a [`ParamStore`].

use crate::module::BatteryModule;
use crate::pack::PackState;
use crate::params::{Param, ParamStore, CELL_VOLTAGE_SLOTS};
use crate::protocol::*;
use crate::transport::{Clock, Transport, Uart};
use std::time::Duration;

/// Wait after each discovery probe before reading the answer.
pub const DISCOVERY_SETTLE: Duration = Duration::from_millis(20);
/// Gap between two discovery probes.
pub const DISCOVERY_GAP: Duration = Duration::from_millis(5);
/// Wait after the address reset broadcast.
pub const RESET_SETTLE: Duration = Duration::from_millis(100);
pub const RESET_ATTEMPTS: usize = 3;
/// Wait after assigning an address before reading the acknowledgement.
pub const SET_ADDRESS_SETTLE: Duration = Duration::from_millis(3);
/// Upper bound of presence probes during one renumbering.
pub const ADDRESSING_PROBES: usize = 3 * MAX_MODULES;
/// Minimum spread between highest and lowest cell before balancing is worth it, V.
pub const BALANCE_MIN_SPREAD: f32 = 0.04;

/// Conversion settle time before the modules are read, longer on small packs.
pub fn conversion_settle_delay(module_count: usize) -> Duration {
    if module_count < 8 {
        Duration::from_millis(200)
    } else {
        Duration::from_millis(50)
    }
}

/// Lifecycle of the bus. `Discovering` only lasts for the duration of
/// [`BusManager::discover_sequential`] or [`BusManager::renumber_and_setup`], both of which
/// always end in `Polling`, even when no board answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Uninitialized,
    Discovering,
    Polling,
}

/// Outcome of [`BusManager::balance_decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceAction {
    Balance,
    Stop,
}

#[derive(Debug)]
pub struct BusManager<U, C> {
    transport: Transport<U, C>,
    modules: Vec<BatteryModule>,
    found_modules: usize,
    pack: PackState,
    state: BusState,
}

impl<U: Uart, C: Clock> BusManager<U, C> {
    pub fn new(transport: Transport<U, C>) -> Self {
        Self {
            transport,
            modules: Address::all().map(BatteryModule::new).collect(),
            found_modules: 0,
            pack: PackState::default(),
            state: BusState::Uninitialized,
        }
    }

    pub fn transport(&self) -> &Transport<U, C> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport<U, C> {
        &mut self.transport
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn found_modules(&self) -> usize {
        self.found_modules
    }

    /// Aggregates of the last poll cycle.
    pub fn pack(&self) -> &PackState {
        &self.pack
    }

    pub fn module(&self, address: Address) -> &BatteryModule {
        &self.modules[address.index()]
    }

    pub fn modules(&self) -> impl Iterator<Item = &BatteryModule> {
        self.modules.iter()
    }

    /// Modules currently marked as existing, in address order.
    pub fn existing_modules(&self) -> impl Iterator<Item = &BatteryModule> {
        self.modules.iter().filter(|m| m.exists())
    }

    /// Marks every module absent and drops its cached readings, which may belong to a
    /// different board once addresses are handed out again.
    fn forget_modules(&mut self) {
        for module in self.modules.iter_mut() {
            module.set_exists(false);
            module.clear();
        }
        self.found_modules = 0;
    }

    /// Probes every address in turn and marks the boards that answer.
    pub fn discover_sequential(&mut self) {
        self.state = BusState::Discovering;
        self.forget_modules();

        for address in Address::all() {
            self.transport.send(&DeviceStatus::request(address), false);
            self.transport.delay(DISCOVERY_SETTLE);
            let rx_buffer = self.transport.receive(DeviceStatus::probe_reply_size());
            if DeviceStatus::is_present(&rx_buffer, address) {
                log::info!("Found module {address}");
                self.modules[address.index()].set_exists(true);
                self.found_modules += 1;
            }
            self.transport.delay(DISCOVERY_GAP);
        }
        log::info!("Discovery finished, {} modules found", self.found_modules);
        self.state = BusState::Polling;
    }

    /// Resets the addresses of all boards and hands out new ones in chain order.
    pub fn renumber_and_setup(&mut self) {
        self.state = BusState::Discovering;
        self.forget_modules();

        let reset = ResetAddresses::request();
        let mut acknowledged = false;
        for attempt in 1..=RESET_ATTEMPTS {
            self.transport.send(&reset, true);
            self.transport.delay(RESET_SETTLE);
            let rx_buffer = self.transport.receive(ResetAddresses::reply_size());
            if ResetAddresses::is_acknowledged(&rx_buffer) {
                acknowledged = true;
                break;
            }
            log::debug!("Address reset not acknowledged, try {attempt} of {RESET_ATTEMPTS}");
        }
        if !acknowledged {
            log::warn!("Address reset was never acknowledged, addressing anyway");
        }

        self.setup_boards();
        log::info!("Renumbering finished, {} modules found", self.found_modules);
        self.state = BusState::Polling;
    }

    fn setup_boards(&mut self) {
        for _ in 0..ADDRESSING_PROBES {
            let rx_buffer = self.transport.exchange(
                &UnaddressedProbe::request(),
                false,
                UnaddressedProbe::reply_size(),
            );
            if !UnaddressedProbe::is_answered(&rx_buffer) {
                return;
            }
            let Some(slot) = self.modules.iter().position(|m| !m.exists()) else {
                log::warn!("Unaddressed board present but all {MAX_MODULES} addresses are taken");
                return;
            };
            let address = self.modules[slot].address();
            self.transport.send(&SetAddress::request(address), true);
            self.transport.delay(SET_ADDRESS_SETTLE);
            let rx_buffer = self.transport.receive(SetAddress::reply_size());
            if SetAddress::is_acknowledged(&rx_buffer, address) {
                log::info!("Assigned address {address}");
                self.modules[slot].set_exists(true);
                self.found_modules += 1;
            } else {
                log::warn!("Board did not acknowledge address {address}");
            }
        }
        log::warn!("Giving up addressing after {ADDRESSING_PROBES} probes");
    }

    /// Releases latched alerts and faults on every board.
    pub fn clear_faults(&mut self) {
        for frame in ClearFaults::requests() {
            self.transport
                .exchange(&frame, true, ClearFaults::reply_size());
        }
    }

    /// Reads the alert and fault bitmasks of every existing module.
    pub fn refresh_status(&mut self) {
        let Self {
            transport, modules, ..
        } = self;
        for module in modules.iter_mut().filter(|m| m.exists()) {
            module.read_status(transport);
        }
    }

    pub fn stop_balancing(&mut self) {
        let Self {
            transport, modules, ..
        } = self;
        for module in modules.iter().filter(|m| m.exists()) {
            module.stop_balance(transport);
        }
    }

    /// Bleeds every cell sitting above the lowest cell of the pack.
    pub fn balance_cells(&mut self, duty: u8) {
        let low = self.pack.low_cell_voltage;
        let Self {
            transport, modules, ..
        } = self;
        for module in modules.iter().filter(|m| m.exists()) {
            let mask = balance_mask(module.cell_voltages(), low);
            if mask != 0 {
                log::debug!("Module {}: balancing mask={mask:06b}", module.address());
                module.balance(transport, mask, duty);
            }
        }
    }

    /// Reads every existing module and recomputes the pack figures.
    pub fn poll_cycle(&mut self) -> &PackState {
        self.stop_balancing();
        self.transport
            .delay(conversion_settle_delay(self.found_modules));

        let Self {
            transport, modules, ..
        } = self;
        for module in modules.iter_mut().filter(|m| m.exists()) {
            if !module.read_values(transport) {
                log::debug!("Module {}: using cached values", module.address());
            }
            module.average_voltage();
        }

        self.pack = PackState::aggregate(&self.modules, self.found_modules);
        &self.pack
    }

    /// Balances when enabled, the highest cell is above the configured threshold and the
    /// spread is wide enough, otherwise switches balancing off.
    pub fn balance_decision<P: ParamStore>(&mut self, params: &P) -> BalanceAction {
        let threshold_mv = params.get_int(Param::BalanceVoltage) as f32;
        let wanted = params.get_int(Param::Balance) != 0
            && self.pack.high_cell_voltage * 1000.0 > threshold_mv
            && self.pack.cell_spread() > BALANCE_MIN_SPREAD;
        if wanted {
            let duty = params.get_int(Param::BalanceDuty).clamp(0, u8::MAX as i32) as u8;
            self.balance_cells(duty);
            BalanceAction::Balance
        } else {
            self.stop_balancing();
            BalanceAction::Stop
        }
    }

    /// Writes the pack figures and the first cell voltages into `params`.
    pub fn publish<P: ParamStore>(&self, params: &mut P) {
        let pack = &self.pack;
        params.set_float(Param::Udc, pack.pack_voltage);
        params.set_int(Param::Umin, (pack.low_cell_voltage * 1000.0) as i32);
        params.set_int(Param::Umax, (pack.high_cell_voltage * 1000.0) as i32);
        params.set_int(Param::DeltaV, (pack.cell_spread() * 1000.0) as i32);
        params.set_int(Param::TempMax, pack.high_temperature as i32);
        params.set_int(Param::TempMin, pack.low_temperature as i32);
        params.set_int(Param::TempAvg, pack.avg_temperature as i32);
        params.set_int(Param::CellsPresent, pack.total_cells as i32);
        params.set_int(Param::ModulesFound, pack.module_count as i32);
        params.set_int(Param::CellAvg, (pack.average_cell_voltage() * 1000.0) as i32);
        params.set_int(Param::Soc, pack.estimated_soc() as i32);

        let cells = self
            .existing_modules()
            .flat_map(|m| m.cell_voltages().iter().copied())
            .take(CELL_VOLTAGE_SLOTS);
        for (index, volt) in cells.enumerate() {
            if let Some(key) = Param::cell_voltage(index) {
                params.set_int(key, (volt * 1000.0) as i32);
            }
        }
    }

    /// One scheduler period. Does nothing until a discovery routine completed.
    pub fn tick<P: ParamStore>(&mut self, params: &mut P) -> Option<BalanceAction> {
        if self.state != BusState::Polling {
            return None;
        }
        self.poll_cycle();
        let action = self.balance_decision(params);
        self.publish(params);
        Some(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamTable;
    use crate::sim::{Responder, SimClock, SimUart, SimulatedBoard, SimulatedPack};
    use crate::transport::reply_settle_delay;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn manager(pack: SimulatedPack) -> BusManager<SimUart<SimulatedPack>, SimClock> {
        BusManager::new(Transport::new(SimUart::new(pack), SimClock::default()))
    }

    fn address(a: u8) -> Address {
        Address::try_from(a).unwrap()
    }

    #[test]
    fn starts_uninitialized_with_empty_table() {
        let mut bus = manager(SimulatedPack::addressed(2));
        assert_eq!(bus.state(), BusState::Uninitialized);
        assert_eq!(bus.modules().count(), MAX_MODULES);
        assert_eq!(bus.existing_modules().count(), 0);
        let mut params = ParamTable::new();
        assert_eq!(bus.tick(&mut params), None);
        assert!(bus.transport().uart().frames().is_empty());
    }

    #[test]
    fn discover_sequential_finds_answering_boards() {
        let mut pack = SimulatedPack::addressed(6);
        pack.boards[2].silent = true;
        let mut bus = manager(pack);
        bus.discover_sequential();
        assert_eq!(bus.found_modules(), 5);
        assert_eq!(bus.state(), BusState::Polling);
        let found: Vec<u8> = bus.existing_modules().map(|m| *m.address()).collect();
        assert_eq!(found, vec![1, 2, 4, 5, 6]);
    }

    #[test]
    fn discover_sequential_resets_previous_result() {
        let mut bus = manager(SimulatedPack::addressed(3));
        bus.discover_sequential();
        bus.discover_sequential();
        assert_eq!(bus.found_modules(), 3);
    }

    #[test]
    fn renumber_addresses_boards_in_chain_order() {
        let mut bus = manager(SimulatedPack::unaddressed(3));
        bus.renumber_and_setup();
        assert_eq!(bus.found_modules(), 3);
        let boards = &bus.transport().uart().responder().boards;
        let addresses: Vec<Option<u8>> = boards.iter().map(|b| b.address).collect();
        assert_eq!(addresses, vec![Some(1), Some(2), Some(3)]);
        assert!(bus.module(address(3)).exists());
        assert!(!bus.module(address(4)).exists());
    }

    #[test]
    fn renumber_proceeds_without_reset_acknowledgement() {
        let mut probes = 0;
        let responder = move |frame: &[u8]| -> Vec<u8> {
            match (frame[0], frame[1]) {
                (0x00, REG_DEV_STATUS) if probes < 1 => {
                    probes += 1;
                    vec![0x80, 0x00, 0x01, 0x00]
                }
                (0x01, REG_ADDR_CTRL) => vec![0x81, REG_ADDR_CTRL, frame[2]],
                _ => Vec::new(),
            }
        };
        let mut bus = BusManager::new(Transport::new(SimUart::new(responder), SimClock::default()));
        bus.renumber_and_setup();
        assert_eq!(bus.found_modules(), 1);
        let resets = bus
            .transport()
            .uart()
            .frames()
            .iter()
            .filter(|f| f[1] == REG_RESET)
            .count();
        assert_eq!(resets, RESET_ATTEMPTS);
    }

    #[test]
    fn renumber_is_bounded_when_boards_never_acknowledge() {
        let responder = |frame: &[u8]| -> Vec<u8> {
            if frame[0] == 0x00 && frame[1] == REG_DEV_STATUS {
                vec![0x80, 0x00, 0x01, 0x00]
            } else {
                Vec::new()
            }
        };
        let mut bus = BusManager::new(Transport::new(SimUart::new(responder), SimClock::default()));
        bus.renumber_and_setup();
        assert_eq!(bus.found_modules(), 0);
        assert_eq!(bus.state(), BusState::Polling);
    }

    #[test]
    fn clear_faults_broadcasts_four_writes() {
        let mut bus = manager(SimulatedPack::addressed(1));
        bus.clear_faults();
        let frames = bus.transport().uart().frames();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f[0] == BROADCAST_ALL_WRITE && f.len() == 4));
        let writes: Vec<(u8, u8)> = frames.iter().map(|f| (f[1], f[2])).collect();
        assert_eq!(
            writes,
            vec![
                (REG_ALERT_STATUS, 0xFF),
                (REG_ALERT_STATUS, 0x00),
                (REG_FAULT_STATUS, 0xFF),
                (REG_FAULT_STATUS, 0x00),
            ]
        );
    }

    #[test]
    fn refresh_status_reads_existing_modules() {
        let mut pack = SimulatedPack::addressed(2);
        pack.boards[1].cov_faults = 0x20;
        let mut bus = manager(pack);
        bus.discover_sequential();
        bus.refresh_status();
        assert_eq!(bus.module(address(1)).cov_faults(), 0);
        assert_eq!(bus.module(address(2)).cov_faults(), 0x20);
    }

    #[test]
    fn settle_delay_depends_on_module_count() {
        assert_eq!(conversion_settle_delay(5), Duration::from_millis(200));
        assert_eq!(conversion_settle_delay(7), Duration::from_millis(200));
        assert_eq!(conversion_settle_delay(8), Duration::from_millis(50));
        assert_eq!(conversion_settle_delay(10), Duration::from_millis(50));
    }

    #[test]
    fn poll_cycle_aggregates_pack() {
        let mut pack = SimulatedPack::addressed(2);
        pack.boards[1] =
            SimulatedBoard::new(Some(2)).with_cell_volts([3.6, 3.7, 3.8, 3.9, 4.0, 4.1]);
        let mut bus = manager(pack);
        bus.discover_sequential();
        let state = bus.poll_cycle().clone();
        assert_eq!(state.module_count, 2);
        assert_eq!(state.total_cells, 12);
        assert!((state.low_cell_voltage - 3.6).abs() < 0.001);
        assert!((state.high_cell_voltage - 4.1).abs() < 0.001);
        assert!((state.pack_voltage - (6.0 * 3.7 + 23.1)).abs() < 0.01);
        assert!((state.avg_temperature - 25.0).abs() < 1.0);
    }

    #[derive(Clone, Default)]
    struct SharedClock(Rc<Cell<Duration>>);

    impl Clock for SharedClock {
        fn now(&self) -> Duration {
            self.0.get()
        }

        fn delay(&mut self, duration: Duration) {
            self.0.set(self.0.get() + duration);
        }
    }

    /// Time between the last balance stop write and the first status read of a poll cycle.
    fn conversion_gap(count: u8) -> Duration {
        let clock = SharedClock::default();
        let events: Rc<RefCell<Vec<(Duration, u8)>>> = Rc::default();
        let mut pack = SimulatedPack::addressed(count);
        let (now, log) = (clock.clone(), events.clone());
        let responder = move |frame: &[u8]| -> Vec<u8> {
            log.borrow_mut().push((now.now(), frame[1]));
            pack.respond(frame)
        };
        let mut bus = BusManager::new(Transport::new(SimUart::new(responder), clock));
        bus.discover_sequential();
        assert_eq!(bus.found_modules(), count as usize);
        events.borrow_mut().clear();
        bus.poll_cycle();

        let events = events.borrow();
        let first_read = events
            .iter()
            .position(|(_, register)| *register == REG_DEV_STATUS)
            .unwrap();
        assert!(first_read > 0);
        assert_eq!(events[first_read - 1].1, REG_BAL_CTRL);
        assert!(events[..first_read].iter().all(|(_, r)| *r == REG_BAL_CTRL));
        events[first_read].0 - events[first_read - 1].0
    }

    #[test]
    fn poll_cycle_waits_for_conversion_on_small_pack() {
        let status_settle = reply_settle_delay(DeviceStatus::reply_size());
        assert_eq!(conversion_gap(5), Duration::from_millis(200) + status_settle);
    }

    #[test]
    fn poll_cycle_waits_less_on_large_pack() {
        let status_settle = reply_settle_delay(DeviceStatus::reply_size());
        assert_eq!(conversion_gap(10), Duration::from_millis(50) + status_settle);
    }

    #[test]
    fn discovery_on_empty_bus_still_reaches_polling() {
        let mut bus = manager(SimulatedPack::default());
        bus.discover_sequential();
        assert_eq!(bus.state(), BusState::Polling);
        assert_eq!(bus.found_modules(), 0);

        let mut bus = manager(SimulatedPack::default());
        bus.renumber_and_setup();
        assert_eq!(bus.state(), BusState::Polling);
        assert_eq!(bus.found_modules(), 0);

        let mut params = ParamTable::new();
        assert_eq!(bus.tick(&mut params), Some(BalanceAction::Stop));
        assert_eq!(params.get_int(Param::ModulesFound), 0);
    }

    #[test]
    fn rediscovery_drops_cached_readings() {
        let mut bus = manager(SimulatedPack::addressed(2));
        bus.discover_sequential();
        bus.poll_cycle();
        assert!(bus.module(address(2)).cell_voltage(0) > 3.0);

        bus.discover_sequential();
        assert_eq!(bus.found_modules(), 2);
        assert_eq!(bus.module(address(2)).cell_voltage(0), 0.0);
        assert_eq!(bus.module(address(2)).module_voltage(), 0.0);
    }

    #[test]
    fn poll_cycle_keeps_stale_module_in_aggregate() {
        let mut bus = manager(SimulatedPack::addressed(2));
        bus.discover_sequential();
        let first = bus.poll_cycle().clone();

        bus.transport
            .uart_mut()
            .responder_mut()
            .board_mut(2)
            .unwrap()
            .corrupt_telemetry = true;
        let second = bus.poll_cycle().clone();
        assert_eq!(second.pack_voltage, first.pack_voltage);
        assert_eq!(second.total_cells, 12);
    }

    #[test]
    fn balance_decision_balances_high_cells() {
        let mut pack = SimulatedPack::addressed(2);
        pack.boards[0] =
            SimulatedBoard::new(Some(1)).with_cell_volts([4.0, 4.0, 4.1, 4.0, 4.0, 4.0]);
        let mut bus = manager(pack);
        bus.discover_sequential();
        bus.poll_cycle();

        let mut params = ParamTable::new();
        params.set_int(Param::Balance, 1);
        params.set_int(Param::BalanceVoltage, 3900);
        params.set_int(Param::BalanceDuty, 40);
        assert_eq!(bus.balance_decision(&params), BalanceAction::Balance);

        let sim = bus.transport().uart().responder();
        assert_eq!(sim.board(1).unwrap().balance_mask, 0b0011_1111);
        assert_eq!(sim.board(1).unwrap().balance_duty, 40);
        // Every cell of module 2 is the pack low cell
        assert_eq!(sim.board(2).unwrap().balance_mask, 0);
        assert_eq!(sim.board(2).unwrap().balance_duty, 0);
    }

    #[test]
    fn balance_decision_stops_when_disabled() {
        let mut pack = SimulatedPack::addressed(1);
        pack.boards[0] =
            SimulatedBoard::new(Some(1)).with_cell_volts([4.0, 4.0, 4.1, 4.0, 4.0, 3.7]);
        let mut bus = manager(pack);
        bus.discover_sequential();
        bus.poll_cycle();
        let params = ParamTable::new();
        assert_eq!(bus.balance_decision(&params), BalanceAction::Stop);
        assert_eq!(bus.transport().uart().responder().board(1).unwrap().balance_mask, 0);
    }

    #[test]
    fn publish_writes_first_twenty_cells() {
        let mut pack = SimulatedPack::addressed(4);
        pack.boards[3] =
            SimulatedBoard::new(Some(4)).with_cell_volts([3.0, 3.1, 3.2, 3.3, 3.4, 3.5]);
        let mut bus = manager(pack);
        bus.discover_sequential();
        bus.poll_cycle();
        let mut params = ParamTable::new();
        bus.publish(&mut params);

        assert_eq!(params.get_int(Param::CellsPresent), 24);
        assert_eq!(params.get_int(Param::ModulesFound), 4);
        assert_eq!(params.get_int(Param::U1), 3700);
        // Slots 19 and 20 are the first two cells of module 4
        assert_eq!(params.get_int(Param::U18), 3700);
        assert_eq!(params.get_int(Param::U19), 3000);
        assert_eq!(params.get_int(Param::U20), 3100);
        let slots = (0..CELL_VOLTAGE_SLOTS)
            .filter_map(Param::cell_voltage)
            .filter(|key| params.iter().any(|(k, _)| k == *key))
            .count();
        assert_eq!(slots, CELL_VOLTAGE_SLOTS);
    }
}
