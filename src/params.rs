//! Key/value parameter interface between the bus engine and the rest of the system.
//!
//! The engine reads its balancing settings from a [`ParamStore`] and writes the pack
//! readings back into it once per poll cycle.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Number of individually published cell voltage slots.
pub const CELL_VOLTAGE_SLOTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Param {
    /// Balancing on (1) or off (0).
    Balance,
    /// Highest cell voltage above which balancing may start, mV.
    BalanceVoltage,
    /// Balance timer duty written to every balancing module.
    BalanceDuty,
    /// Pack voltage, V.
    Udc,
    Umin,
    Umax,
    DeltaV,
    TempMax,
    TempMin,
    TempAvg,
    CellsPresent,
    ModulesFound,
    /// Average cell voltage, mV.
    CellAvg,
    /// State of charge estimated from the lowest cell, %.
    Soc,
    U1,
    U2,
    U3,
    U4,
    U5,
    U6,
    U7,
    U8,
    U9,
    U10,
    U11,
    U12,
    U13,
    U14,
    U15,
    U16,
    U17,
    U18,
    U19,
    U20,
}

const CELL_VOLTAGE_KEYS: [Param; CELL_VOLTAGE_SLOTS] = [
    Param::U1,
    Param::U2,
    Param::U3,
    Param::U4,
    Param::U5,
    Param::U6,
    Param::U7,
    Param::U8,
    Param::U9,
    Param::U10,
    Param::U11,
    Param::U12,
    Param::U13,
    Param::U14,
    Param::U15,
    Param::U16,
    Param::U17,
    Param::U18,
    Param::U19,
    Param::U20,
];

impl Param {
    /// Key of the cell voltage slot `index`, counted across modules in address order.
    pub fn cell_voltage(index: usize) -> Option<Param> {
        CELL_VOLTAGE_KEYS.get(index).copied()
    }

    /// Value a store reports for a key that was never written.
    pub fn default_value(&self) -> ParamValue {
        match self {
            Param::BalanceVoltage => ParamValue::Int(3900),
            Param::BalanceDuty => ParamValue::Int(50),
            Param::Udc => ParamValue::Float(0.0),
            _ => ParamValue::Int(0),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
}

impl ParamValue {
    pub fn as_int(&self) -> i32 {
        match self {
            ParamValue::Int(value) => *value,
            ParamValue::Float(value) => *value as i32,
        }
    }

    pub fn as_float(&self) -> f32 {
        match self {
            ParamValue::Int(value) => *value as f32,
            ParamValue::Float(value) => *value,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Float(value) => write!(f, "{value}"),
        }
    }
}

/// Typed access to the parameter database.
pub trait ParamStore {
    fn get_int(&self, key: Param) -> i32;
    fn get_float(&self, key: Param) -> f32;
    fn set_int(&mut self, key: Param, value: i32);
    fn set_float(&mut self, key: Param, value: f32);
}

/// In-memory [`ParamStore`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ParamTable {
    values: BTreeMap<Param, ParamValue>,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: Param) -> ParamValue {
        self.values
            .get(&key)
            .copied()
            .unwrap_or_else(|| key.default_value())
    }

    /// Written entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (Param, ParamValue)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

impl ParamStore for ParamTable {
    fn get_int(&self, key: Param) -> i32 {
        self.get(key).as_int()
    }

    fn get_float(&self, key: Param) -> f32 {
        self.get(key).as_float()
    }

    fn set_int(&mut self, key: Param, value: i32) {
        self.values.insert(key, ParamValue::Int(value));
    }

    fn set_float(&mut self, key: Param, value: f32) {
        self.values.insert(key, ParamValue::Float(value));
    }
}
