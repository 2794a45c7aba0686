use crate::protocol::MAX_MODULES;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid reply size - expected={expected} received={received}")]
    ReplySizeError { expected: usize, received: usize },
    #[error("Invalid checksum - calculated={calculated:02X} received={received:02X}")]
    CheckSumError { calculated: u8, received: u8 },
    #[error("Reply does not echo the request - expected={expected:02X?} received={received:02X?}")]
    EchoError { expected: [u8; 3], received: [u8; 3] },
    #[error("The module address {0} is outside the valid range of 1 to {max}", max = MAX_MODULES)]
    AddressOutOfRange(u8),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
