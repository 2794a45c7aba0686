use teslabms_lib::manager::{BalanceAction, BusManager, BusState};
use teslabms_lib::params::{Param, ParamStore, ParamTable, CELL_VOLTAGE_SLOTS};
use teslabms_lib::protocol::{Address, REG_GPAI};
use teslabms_lib::sim::{SimClock, SimUart, SimulatedBoard, SimulatedPack};
use teslabms_lib::transport::{Clock, Transport};

type SimBus = BusManager<SimUart<SimulatedPack>, SimClock>;

fn bus(pack: SimulatedPack) -> SimBus {
    BusManager::new(Transport::new(SimUart::new(pack), SimClock::default()))
}

fn sim(bus: &mut SimBus) -> &mut SimulatedPack {
    bus.transport_mut().uart_mut().responder_mut()
}

fn balancing_params() -> ParamTable {
    let mut params = ParamTable::new();
    params.set_int(Param::Balance, 1);
    params.set_int(Param::BalanceVoltage, 3900);
    params.set_int(Param::BalanceDuty, 50);
    params
}

#[test]
fn four_modules_at_3v70() {
    let mut bus = bus(SimulatedPack::addressed(4));
    bus.discover_sequential();
    assert_eq!(bus.found_modules(), 4);

    let mut params = balancing_params();
    assert_eq!(bus.tick(&mut params), Some(BalanceAction::Stop));

    assert!((params.get_float(Param::Udc) - 88.8).abs() < 0.01);
    assert_eq!(params.get_int(Param::Umin), 3700);
    assert_eq!(params.get_int(Param::Umax), 3700);
    assert_eq!(params.get_int(Param::DeltaV), 0);
    assert_eq!(params.get_int(Param::CellsPresent), 24);
    assert_eq!(params.get_int(Param::ModulesFound), 4);
    assert_eq!(params.get_int(Param::CellAvg), 3700);
    assert_eq!(params.get_int(Param::Soc), 60);
    assert!((24..=25).contains(&params.get_int(Param::TempAvg)));
    for index in 0..CELL_VOLTAGE_SLOTS {
        let key = Param::cell_voltage(index).unwrap();
        assert_eq!(params.get_int(key), 3700, "{key}");
    }
    for board in &sim(&mut bus).boards {
        assert_eq!(board.balance_mask, 0);
    }
}

#[test]
fn tick_waits_for_discovery() {
    let mut bus = bus(SimulatedPack::addressed(2));
    let mut params = ParamTable::new();
    assert_eq!(bus.state(), BusState::Uninitialized);
    assert_eq!(bus.tick(&mut params), None);
    assert_eq!(params.iter().count(), 0);
}

#[test]
fn discovery_finds_sparse_addresses() {
    let pack = SimulatedPack {
        boards: [1, 3, 16]
            .into_iter()
            .map(|a| SimulatedBoard::new(Some(a)))
            .collect(),
    };
    let mut bus = bus(pack);
    bus.discover_sequential();
    let found: Vec<u8> = bus.existing_modules().map(|m| *m.address()).collect();
    assert_eq!(found, vec![1, 3, 16]);

    let mut params = ParamTable::new();
    bus.tick(&mut params);
    assert_eq!(params.get_int(Param::CellsPresent), 18);
    // Slots follow address order, module 16 starts at slot 13
    assert_eq!(params.get_int(Param::U13), 3700);
    assert_eq!(params.get_int(Param::U19), 0);
}

#[test]
fn full_chain_of_sixteen() {
    let mut bus = bus(SimulatedPack::addressed(16));
    bus.discover_sequential();
    assert_eq!(bus.found_modules(), 16);
    let mut params = ParamTable::new();
    bus.tick(&mut params);
    assert_eq!(params.get_int(Param::CellsPresent), 96);
    assert!((params.get_float(Param::Udc) - 355.2).abs() < 0.05);
}

#[test]
fn renumber_then_poll() {
    let mut bus = bus(SimulatedPack::unaddressed(5));
    bus.renumber_and_setup();
    assert_eq!(bus.found_modules(), 5);
    let addresses: Vec<Option<u8>> = sim(&mut bus).boards.iter().map(|b| b.address).collect();
    assert_eq!(
        addresses,
        vec![Some(1), Some(2), Some(3), Some(4), Some(5)]
    );

    let mut params = ParamTable::new();
    assert!(bus.tick(&mut params).is_some());
    assert_eq!(params.get_int(Param::ModulesFound), 5);
    assert_eq!(params.get_int(Param::CellsPresent), 30);
}

#[test]
fn renumber_replaces_stale_addresses() {
    let mut pack = SimulatedPack::addressed(3);
    pack.boards[0].address = Some(9);
    pack.boards[2].address = Some(4);
    let mut bus = bus(pack);
    bus.renumber_and_setup();
    let found: Vec<u8> = bus.existing_modules().map(|m| *m.address()).collect();
    assert_eq!(found, vec![1, 2, 3]);
}

#[test]
fn silent_module_keeps_cached_values_after_retries() {
    let mut bus = bus(SimulatedPack::addressed(2));
    bus.discover_sequential();
    let mut params = ParamTable::new();
    bus.tick(&mut params);
    let udc = params.get_float(Param::Udc);

    sim(&mut bus).board_mut(2).unwrap().silent = true;
    let telemetry_reads = |bus: &SimBus| {
        bus.transport()
            .uart()
            .frames()
            .iter()
            .filter(|f| f[0] == Address::try_from(2).unwrap().frame_byte() && f[1] == REG_GPAI)
            .count()
    };
    let before = telemetry_reads(&bus);
    let started = bus.transport().clock().now();
    bus.tick(&mut params);

    assert_eq!(telemetry_reads(&bus) - before, 3);
    assert!(bus.transport().clock().now() > started);
    assert_eq!(params.get_float(Param::Udc).to_bits(), udc.to_bits());
    assert_eq!(params.get_int(Param::CellsPresent), 12);
}

#[test]
fn corrupted_telemetry_is_ignored() {
    let mut pack = SimulatedPack::addressed(2);
    pack.boards[1] = SimulatedBoard::new(Some(2)).with_cell_volts([3.6; 6]);
    let mut bus = bus(pack);
    bus.discover_sequential();
    let mut params = ParamTable::new();
    bus.tick(&mut params);
    assert_eq!(params.get_int(Param::Umin), 3600);

    let board = sim(&mut bus).board_mut(2).unwrap();
    board.cells_raw = [SimulatedBoard::CELL_3V70; 6];
    board.cells_raw[0] = 0;
    board.corrupt_telemetry = true;
    bus.tick(&mut params);
    assert_eq!(params.get_int(Param::Umin), 3600);
    assert_eq!(
        bus.module(Address::try_from(2).unwrap()).cell_voltage(0),
        bus.module(Address::try_from(2).unwrap()).cell_voltage(1)
    );
}

#[test]
fn lost_cell_is_adopted_on_third_poll() {
    let mut bus = bus(SimulatedPack::addressed(4));
    bus.discover_sequential();
    let mut params = ParamTable::new();
    bus.tick(&mut params);
    assert_eq!(params.get_int(Param::CellsPresent), 24);

    sim(&mut bus).board_mut(3).unwrap().cells_raw[5] = 0;
    bus.tick(&mut params);
    bus.tick(&mut params);
    assert_eq!(params.get_int(Param::CellsPresent), 24);
    bus.tick(&mut params);
    assert_eq!(params.get_int(Param::CellsPresent), 23);
}

#[test]
fn balancing_bleeds_cells_above_pack_low() {
    let mut pack = SimulatedPack::addressed(3);
    pack.boards[0] =
        SimulatedBoard::new(Some(1)).with_cell_volts([4.00, 3.95, 4.00, 4.00, 4.00, 4.00]);
    pack.boards[2] =
        SimulatedBoard::new(Some(3)).with_cell_volts([4.05, 4.00, 4.00, 4.00, 4.00, 4.00]);
    pack.boards[1] = SimulatedBoard::new(Some(2)).with_cell_volts([3.95; 6]);
    let mut bus = bus(pack);
    bus.discover_sequential();

    let mut params = balancing_params();
    assert_eq!(bus.tick(&mut params), Some(BalanceAction::Balance));
    let sim = sim(&mut bus);
    assert_eq!(sim.board(1).unwrap().balance_mask, 0b0011_1101);
    assert_eq!(sim.board(2).unwrap().balance_mask, 0);
    assert_eq!(sim.board(3).unwrap().balance_mask, 0b0011_1111);
    assert_eq!(sim.board(3).unwrap().balance_duty, 50);

    // Below the threshold balancing is switched off again
    params.set_int(Param::BalanceVoltage, 4100);
    assert_eq!(bus.tick(&mut params), Some(BalanceAction::Stop));
    let sim = bus.transport().uart().responder();
    assert!(sim.boards.iter().all(|b| b.balance_mask == 0));
}

#[test]
fn small_spread_does_not_balance() {
    let mut pack = SimulatedPack::addressed(2);
    pack.boards[0] = SimulatedBoard::new(Some(1)).with_cell_volts([4.02; 6]);
    pack.boards[1] = SimulatedBoard::new(Some(2)).with_cell_volts([4.00; 6]);
    let mut bus = bus(pack);
    bus.discover_sequential();
    let mut params = balancing_params();
    assert_eq!(bus.tick(&mut params), Some(BalanceAction::Stop));
    assert_eq!(params.get_int(Param::DeltaV), 20);
}
