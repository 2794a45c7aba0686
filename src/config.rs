use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use teslabms_lib::params::{Param, ParamStore};

/// Balancing settings read from the bus configuration file.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    #[serde(default)]
    pub balance: bool,
    /// Highest cell voltage above which balancing may start, mV.
    #[serde(default = "BusConfig::default_balance_voltage")]
    pub balance_voltage: i32,
    #[serde(default = "BusConfig::default_balance_duty")]
    pub balance_duty: i32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            balance: false,
            balance_voltage: Self::default_balance_voltage(),
            balance_duty: Self::default_balance_duty(),
        }
    }
}

impl BusConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "teslabms.yaml";

    fn default_balance_voltage() -> i32 {
        3900
    }

    fn default_balance_duty() -> i32 {
        50
    }

    /// Reads `config_file_path`. A file that does not exist yields the defaults.
    pub fn load<P: AsRef<Path>>(config_file_path: P) -> Result<Self> {
        let path = config_file_path.as_ref();
        if !path.exists() {
            log::debug!("No config file at {path:?}, using defaults");
            return Ok(Self::default());
        }
        log::debug!("Loading config file from {path:?}");
        let config_file = std::fs::File::open(path)
            .with_context(|| format!("Cannot open config file {path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read bus config from file: {path:?}"))?;
        Ok(config)
    }

    /// Writes the balancing settings into `params`.
    pub fn apply<P: ParamStore>(&self, params: &mut P) {
        params.set_int(Param::Balance, i32::from(self.balance));
        params.set_int(Param::BalanceVoltage, self.balance_voltage);
        params.set_int(Param::BalanceDuty, self.balance_duty);
    }
}
