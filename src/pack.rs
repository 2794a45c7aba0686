use crate::module::BatteryModule;
use serde::Serialize;

/// Modules whose average temperature is at or below this are left out of the pack
/// temperature figures.
pub const TEMPERATURE_PLAUSIBLE_MIN: f32 = -70.0;

/// Lowest cell voltage (mV) at 0%, 10%, .. 100% state of charge.
const SOC_CURVE_MV: [f32; 11] = [
    3300.0, 3400.0, 3450.0, 3500.0, 3560.0, 3600.0, 3700.0, 3800.0, 4000.0, 4100.0, 4200.0,
];

/// Pack level figures, recomputed from the module table on every poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackState {
    pub pack_voltage: f32,
    pub low_cell_voltage: f32,
    pub high_cell_voltage: f32,
    pub avg_temperature: f32,
    pub low_temperature: f32,
    pub high_temperature: f32,
    pub total_cells: usize,
    pub module_count: usize,
}

impl Default for PackState {
    fn default() -> Self {
        Self {
            pack_voltage: 0.0,
            low_cell_voltage: 5.0,
            high_cell_voltage: 0.0,
            avg_temperature: 0.0,
            low_temperature: 999.0,
            high_temperature: -999.0,
            total_cells: 0,
            module_count: 0,
        }
    }
}

impl PackState {
    /// Aggregates the existing modules. Cached readings of modules that failed their last
    /// read are used as they are.
    pub fn aggregate<'a>(
        modules: impl IntoIterator<Item = &'a BatteryModule>,
        module_count: usize,
    ) -> Self {
        let mut state = Self {
            module_count,
            ..Self::default()
        };
        let mut temperature_sum = 0.0;
        let mut temperature_count = 0;

        for module in modules.into_iter().filter(|m| m.exists()) {
            state.pack_voltage += module.module_voltage();
            state.total_cells += module.cell_count();
            state.high_cell_voltage = state.high_cell_voltage.max(module.high_cell());
            state.low_cell_voltage = state.low_cell_voltage.min(module.low_cell());

            let average = module.average_temperature();
            if average > TEMPERATURE_PLAUSIBLE_MIN {
                temperature_sum += average;
                temperature_count += 1;
                state.high_temperature = state.high_temperature.max(module.high_temperature());
                state.low_temperature = state.low_temperature.min(module.low_temperature());
            }
        }
        if temperature_count > 0 {
            state.avg_temperature = temperature_sum / temperature_count as f32;
        }
        state
    }

    pub fn cell_spread(&self) -> f32 {
        self.high_cell_voltage - self.low_cell_voltage
    }

    pub fn average_cell_voltage(&self) -> f32 {
        self.pack_voltage / self.total_cells.max(1) as f32
    }

    /// State of charge in percent, interpolated from the lowest cell.
    pub fn estimated_soc(&self) -> f32 {
        soc_from_cell_voltage(self.low_cell_voltage * 1000.0)
    }
}

/// Open circuit state of charge estimate for a cell voltage given in mV.
pub fn soc_from_cell_voltage(millivolts: f32) -> f32 {
    for (i, point) in SOC_CURVE_MV.iter().enumerate() {
        if millivolts < *point {
            if i == 0 {
                return 0.0;
            }
            let step = point - SOC_CURVE_MV[i - 1];
            let below = point - millivolts;
            return i as f32 * 10.0 - below / step * 10.0;
        }
    }
    100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soc_curve() {
        assert_eq!(soc_from_cell_voltage(3000.0), 0.0);
        assert_eq!(soc_from_cell_voltage(3300.0), 0.0);
        assert_eq!(soc_from_cell_voltage(3350.0), 5.0);
        assert_eq!(soc_from_cell_voltage(3700.0), 60.0);
        assert_eq!(soc_from_cell_voltage(3900.0), 75.0);
        assert_eq!(soc_from_cell_voltage(4200.0), 100.0);
        assert_eq!(soc_from_cell_voltage(4500.0), 100.0);
    }

    #[test]
    fn empty_pack_uses_sentinels() {
        let state = PackState::aggregate(std::iter::empty(), 0);
        assert_eq!(state, PackState::default());
        assert_eq!(state.average_cell_voltage(), 0.0);
    }
}
