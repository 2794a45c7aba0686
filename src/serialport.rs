use crate::protocol::BAUD_RATE;
use crate::transport::{SystemClock, Transport, Uart};
use crate::Result;
use std::io::{Read, Write};
use std::time::Duration;

/// Read timeout of the underlying port. Bytes are only read after `bytes_to_read`
/// reported them, so this only guards against a vanished device.
const PORT_TIMEOUT: Duration = Duration::from_millis(10);

/// The module bus on a local serial port.
pub struct SerialUart {
    serial: Box<dyn serialport::SerialPort>,
}

impl std::fmt::Debug for SerialUart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialUart")
            .field("name", &self.serial.name())
            .finish()
    }
}

impl SerialUart {
    /// Opens `port` at the bus rate, 8N1 without flow control.
    pub fn open(port: &str) -> Result<Self> {
        let serial = serialport::new(port, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(PORT_TIMEOUT)
            .open()?;
        log::debug!("Opened serial port {port} at {BAUD_RATE} baud");
        Ok(Self { serial })
    }

    /// Opens `port` and wraps it into a [`Transport`] running on wall clock time.
    pub fn open_transport(port: &str) -> Result<Transport<Self, SystemClock>> {
        Ok(Transport::new(Self::open(port)?, SystemClock::new()))
    }
}

impl Uart for SerialUart {
    fn has_data(&mut self) -> Result<bool> {
        Ok(self.serial.bytes_to_read()? > 0)
    }

    fn send_byte(&mut self, byte: u8) -> Result<()> {
        self.serial.write_all(&[byte])?;
        Ok(())
    }

    fn recv_byte(&mut self) -> Result<u8> {
        let mut buffer = [0u8; 1];
        self.serial.read_exact(&mut buffer)?;
        Ok(buffer[0])
    }
}
