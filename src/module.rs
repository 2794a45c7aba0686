use crate::protocol::*;
use crate::transport::{Clock, Transport, Uart};
use serde::Serialize;
use std::time::Duration;

/// Cells at or below this voltage are treated as disconnected.
pub const CELL_PRESENT_MIN: f32 = 0.5;
/// Upper bound of a plausible cell for the high cell search.
pub const CELL_PLAUSIBLE_MAX: f32 = 4.5;
/// Upper bound of a cell counted for the average.
pub const CELL_AVERAGE_MAX: f32 = 60.0;
/// Returned by [`BatteryModule::low_cell`] when no cell qualifies.
pub const LOW_CELL_NONE: f32 = 10.0;
/// Returned by [`BatteryModule::high_cell`] when no cell qualifies.
pub const HIGH_CELL_NONE: f32 = 0.0;
/// Consecutive disagreeing polls tolerated before the cell count follows the measurement.
pub const CELL_COUNT_MISSES: u8 = 2;

const BALANCE_SETTLE: Duration = Duration::from_millis(2);

/// Cached state of one module board.
#[derive(Debug, Clone, Serialize)]
pub struct BatteryModule {
    address: Address,
    exists: bool,
    cell_volts: [f32; CELLS_PER_MODULE],
    lowest_cell_volts: [f32; CELLS_PER_MODULE],
    highest_cell_volts: [f32; CELLS_PER_MODULE],
    module_volt: f32,
    temperatures: [f32; TEMPERATURE_CHANNELS],
    lowest_temperature: f32,
    highest_temperature: f32,
    alerts: u8,
    faults: u8,
    cov_faults: u8,
    cuv_faults: u8,
    cell_count: usize,
    cell_count_misses: u8,
}

impl BatteryModule {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            exists: false,
            cell_volts: [0.0; CELLS_PER_MODULE],
            lowest_cell_volts: [5.0; CELLS_PER_MODULE],
            highest_cell_volts: [0.0; CELLS_PER_MODULE],
            module_volt: 0.0,
            temperatures: [0.0; TEMPERATURE_CHANNELS],
            lowest_temperature: 200.0,
            highest_temperature: -100.0,
            alerts: 0,
            faults: 0,
            cov_faults: 0,
            cuv_faults: 0,
            cell_count: CELLS_PER_MODULE,
            cell_count_misses: 0,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn set_exists(&mut self, exists: bool) {
        self.exists = exists;
    }

    /// Zeroes the cached cell and temperature readings, history is kept.
    pub fn clear(&mut self) {
        self.cell_volts = [0.0; CELLS_PER_MODULE];
        self.module_volt = 0.0;
        self.temperatures = [0.0; TEMPERATURE_CHANNELS];
    }

    /// Refreshes the alert, fault, over- and under-voltage bitmasks.
    ///
    /// There is no checksum on this path: every field is taken from the reply as long as
    /// its byte arrived.
    pub fn read_status<U: Uart, C: Clock>(&mut self, transport: &mut Transport<U, C>) {
        let address = self.address();
        transport.exchange(
            &DeviceStatus::request(address),
            false,
            DeviceStatus::reply_size(),
        );
        let rx_buffer = transport.exchange(
            &AlertStatus::request(address),
            false,
            AlertStatus::reply_size(),
        );
        let field = |index: usize, current: u8| rx_buffer.get(index).copied().unwrap_or(current);
        self.alerts = field(AlertStatus::ALERTS, self.alerts);
        self.faults = field(AlertStatus::FAULTS, self.faults);
        self.cov_faults = field(AlertStatus::COV_FAULTS, self.cov_faults);
        self.cuv_faults = field(AlertStatus::CUV_FAULTS, self.cuv_faults);
    }

    /// Triggers a conversion and reads cells and temperatures.
    ///
    /// Returns false and keeps every cached value when the reply fails validation.
    pub fn read_values<U: Uart, C: Clock>(&mut self, transport: &mut Transport<U, C>) -> bool {
        let address = self.address();
        self.read_status(transport);

        for frame in StartConversion::requests(address) {
            transport.exchange(&frame, true, StartConversion::reply_size());
        }

        let rx_buffer = transport.exchange(
            &Telemetry::request(address),
            false,
            Telemetry::reply_size(),
        );
        match Telemetry::decode(&rx_buffer, address) {
            Ok(telemetry) => {
                self.apply(&telemetry);
                true
            }
            Err(err) => {
                log::warn!("Module {address}: keeping previous values ({err})");
                false
            }
        }
    }

    fn apply(&mut self, telemetry: &Telemetry) {
        self.cell_volts = telemetry.cells;
        for (i, volt) in self.cell_volts.iter().enumerate() {
            if *volt >= CELL_PRESENT_MIN && *volt < self.lowest_cell_volts[i] {
                self.lowest_cell_volts[i] = *volt;
            }
            if *volt > self.highest_cell_volts[i] {
                self.highest_cell_volts[i] = *volt;
            }
        }
        self.module_volt = self.cell_volts.iter().sum();

        self.temperatures = telemetry.temperatures;
        if self.low_temperature() < self.lowest_temperature {
            self.lowest_temperature = self.low_temperature();
        }
        if self.high_temperature() > self.highest_temperature {
            self.highest_temperature = self.high_temperature();
        }
        log::debug!(
            "Module {}: cells={:?} module={:.3}V temperatures={:?}",
            self.address,
            self.cell_volts,
            self.module_volt,
            self.temperatures
        );
    }

    pub fn stop_balance<U: Uart, C: Clock>(&self, transport: &mut Transport<U, C>) {
        transport.exchange(
            &BalanceControl::request(self.address(), 0),
            true,
            BalanceControl::stop_reply_size(),
        );
    }

    /// Arms the balance timer with `duty` and switches on the bleed resistors in `mask`.
    pub fn balance<U: Uart, C: Clock>(&self, transport: &mut Transport<U, C>, mask: u8, duty: u8) {
        let address = self.address();
        for frame in [
            BalanceTimer::request(address, duty),
            BalanceControl::request(address, mask),
        ] {
            transport.send(&frame, true);
            transport.delay(BALANCE_SETTLE);
            transport.receive(BALANCE_REPLY_SIZE);
        }
    }

    /// Mean of the plausible cells. Also feeds the stabilized cell count: a differing
    /// number of plausible cells is only adopted once it persisted for
    /// `CELL_COUNT_MISSES + 1` consecutive calls.
    pub fn average_voltage(&mut self) -> f32 {
        let plausible: Vec<f32> = self
            .cell_volts
            .iter()
            .copied()
            .filter(|v| *v > CELL_PRESENT_MIN && *v < CELL_AVERAGE_MAX)
            .collect();

        if plausible.len() != self.cell_count {
            if self.cell_count_misses >= CELL_COUNT_MISSES {
                log::info!(
                    "Module {}: cell count changed {} -> {}",
                    self.address,
                    self.cell_count,
                    plausible.len()
                );
                self.cell_count = plausible.len();
                self.cell_count_misses = 0;
            } else {
                self.cell_count_misses += 1;
            }
        } else {
            self.cell_count_misses = 0;
        }

        if plausible.is_empty() {
            0.0
        } else {
            plausible.iter().sum::<f32>() / plausible.len() as f32
        }
    }

    /// Lowest connected cell, [`LOW_CELL_NONE`] if there is none.
    pub fn low_cell(&self) -> f32 {
        self.cell_volts
            .iter()
            .copied()
            .filter(|v| *v > CELL_PRESENT_MIN)
            .fold(LOW_CELL_NONE, f32::min)
    }

    /// Highest plausible cell, [`HIGH_CELL_NONE`] if there is none.
    pub fn high_cell(&self) -> f32 {
        self.cell_volts
            .iter()
            .copied()
            .filter(|v| *v < CELL_PLAUSIBLE_MAX)
            .fold(HIGH_CELL_NONE, f32::max)
    }

    /// Voltage of cell `cell`, 0 outside of 0..6.
    pub fn cell_voltage(&self, cell: usize) -> f32 {
        self.cell_volts.get(cell).copied().unwrap_or(0.0)
    }

    pub fn cell_voltages(&self) -> &[f32; CELLS_PER_MODULE] {
        &self.cell_volts
    }

    pub fn lowest_cell_voltage(&self, cell: usize) -> f32 {
        self.lowest_cell_volts.get(cell).copied().unwrap_or(0.0)
    }

    pub fn highest_cell_voltage(&self, cell: usize) -> f32 {
        self.highest_cell_volts.get(cell).copied().unwrap_or(0.0)
    }

    pub fn module_voltage(&self) -> f32 {
        self.module_volt
    }

    /// Temperature of channel `channel`, 0 outside of 0..2.
    pub fn temperature(&self, channel: usize) -> f32 {
        self.temperatures.get(channel).copied().unwrap_or(0.0)
    }

    pub fn low_temperature(&self) -> f32 {
        self.temperatures[0].min(self.temperatures[1])
    }

    pub fn high_temperature(&self) -> f32 {
        self.temperatures[0].max(self.temperatures[1])
    }

    pub fn average_temperature(&self) -> f32 {
        (self.temperatures[0] + self.temperatures[1]) * 0.5
    }

    /// Lowest temperature seen since start up.
    pub fn lowest_temperature(&self) -> f32 {
        self.lowest_temperature
    }

    /// Highest temperature seen since start up.
    pub fn highest_temperature(&self) -> f32 {
        self.highest_temperature
    }

    pub fn alerts(&self) -> u8 {
        self.alerts
    }

    pub fn faults(&self) -> u8 {
        self.faults
    }

    pub fn cov_faults(&self) -> u8 {
        self.cov_faults
    }

    pub fn cuv_faults(&self) -> u8 {
        self.cuv_faults
    }

    /// Stabilized cell count.
    pub fn cell_count(&self) -> usize {
        self.cell_count
    }
}
