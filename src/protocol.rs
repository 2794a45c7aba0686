use crate::Error;
use serde::Serialize;
use std::fmt;

/// Fixed line rate of the module bus (8N1, half duplex).
pub const BAUD_RATE: u32 = 612_500;

/// Number of boards a single bus can address.
pub const MAX_MODULES: usize = 16;
pub const CELLS_PER_MODULE: usize = 6;
pub const TEMPERATURE_CHANNELS: usize = 2;

pub const REG_DEV_STATUS: u8 = 0x00;
pub const REG_GPAI: u8 = 0x01;
pub const REG_ALERT_STATUS: u8 = 0x20;
pub const REG_FAULT_STATUS: u8 = 0x21;
pub const REG_ADC_CTRL: u8 = 0x30;
pub const REG_IO_CTRL: u8 = 0x31;
pub const REG_BAL_CTRL: u8 = 0x32;
pub const REG_BAL_TIME: u8 = 0x33;
pub const REG_ADC_CONV: u8 = 0x34;
pub const REG_ADDR_CTRL: u8 = 0x3B;
pub const REG_RESET: u8 = 0x3C;

/// Address byte seen by boards that have not been assigned an address yet.
pub const BROADCAST_UNADDRESSED: u8 = 0x00;
/// All-call address, shifted into the address byte for the reset command.
pub const BROADCAST_ALL: u8 = 0x3F;
/// All-call address byte with the write bit already applied.
pub const BROADCAST_ALL_WRITE: u8 = 0x7F;

const WRITE_BIT: u8 = 0x01;
const CRC8_POLYNOMIAL: u8 = 0x07;

/// Volts per ADC count of a cell channel.
pub const CELL_VOLTS_PER_COUNT: f32 = 0.000381493;

// Steinhart-Hart coefficients of the on-board NTC thermistors
const SH_A: f32 = 0.0007610373573;
const SH_B: f32 = 0.0002728524832;
const SH_C: f32 = 0.0000001022822735;
const KELVIN_OFFSET: f32 = 273.15;

/// CRC-8, polynomial 0x07, initial value 0, MSB first, no reflection.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for b in bytes {
        crc ^= *b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Bus address of a module board.
/// The address must be in the range from 1 to 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Address(u8);

impl std::ops::Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Address {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = MAX_MODULES as u8;

    /// Zero based slot of this address in the module table.
    pub fn index(&self) -> usize {
        (self.0 - Self::MIN) as usize
    }

    /// The address as it appears in the first byte of a frame, write bit cleared.
    pub fn frame_byte(&self) -> u8 {
        self.0 << 1
    }

    /// Iterates all assignable addresses in ascending order.
    pub fn all() -> impl Iterator<Item = Address> {
        (Self::MIN..=Self::MAX).map(Address)
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::AddressOutOfRange(value))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One request on the wire: address byte, register and a length or data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    address_byte: u8,
    register: u8,
    data: u8,
}

impl Frame {
    /// Frame targeting a single addressed board.
    pub fn to_module(address: Address, register: u8, data: u8) -> Self {
        Self::raw(address.frame_byte(), register, data)
    }

    /// Frame with an explicit address byte, used for the broadcast commands.
    pub fn raw(address_byte: u8, register: u8, data: u8) -> Self {
        Self {
            address_byte,
            register,
            data,
        }
    }

    pub fn address_byte(&self) -> u8 {
        self.address_byte
    }

    pub fn register(&self) -> u8 {
        self.register
    }

    pub fn data(&self) -> u8 {
        self.data
    }

    /// Serializes the frame. Write frames get the write bit in the address byte and a
    /// trailing CRC computed with that bit applied.
    pub fn encode(&self, is_write: bool) -> Vec<u8> {
        let address_byte = if is_write {
            self.address_byte | WRITE_BIT
        } else {
            self.address_byte
        };
        let mut tx_buffer = vec![address_byte, self.register, self.data];
        if is_write {
            tx_buffer.push(crc8(&tx_buffer));
        }
        tx_buffer
    }
}

fn validate_len(buffer: &[u8], reply_size: usize) -> Result<(), Error> {
    if buffer.len() != reply_size {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            reply_size,
            buffer.len()
        );
        return Err(Error::ReplySizeError {
            expected: reply_size,
            received: buffer.len(),
        });
    }
    Ok(())
}

fn validate_checksum(buffer: &[u8]) -> Result<(), Error> {
    let (received, payload) = match buffer.split_last() {
        Some((last, payload)) => (*last, payload),
        None => return validate_len(buffer, 1),
    };
    let calculated = crc8(payload);
    if received != calculated {
        log::warn!(
            "Invalid checksum - calculated={:02X?} received={:02X?} buffer={:02X?}",
            calculated,
            received,
            buffer
        );
        return Err(Error::CheckSumError {
            calculated,
            received,
        });
    }
    Ok(())
}

fn validate_echo(buffer: &[u8], expected: [u8; 3]) -> Result<(), Error> {
    let received = [buffer[0], buffer[1], buffer[2]];
    if received != expected {
        log::warn!(
            "Reply does not echo request - expected={:02X?} received={:02X?}",
            expected,
            received
        );
        return Err(Error::EchoError { expected, received });
    }
    Ok(())
}

/// Device status register, also used as the presence probe during discovery.
pub struct DeviceStatus;

impl DeviceStatus {
    pub fn request(address: Address) -> Frame {
        Frame::to_module(address, REG_DEV_STATUS, 0x01)
    }

    pub fn reply_size() -> usize {
        4
    }

    /// Room for the status reply plus its checksum and some slack.
    pub fn probe_reply_size() -> usize {
        8
    }

    /// A board is present when it echoes the probe and reports a non-zero byte after
    /// the status value.
    pub fn is_present(rx_buffer: &[u8], address: Address) -> bool {
        rx_buffer.len() > 4
            && rx_buffer[0] == address.frame_byte()
            && rx_buffer[1] == REG_DEV_STATUS
            && rx_buffer[2] == 0x01
            && rx_buffer[4] > 0
    }
}

/// Alert, fault, cell over-voltage and cell under-voltage bitmasks.
pub struct AlertStatus;

impl AlertStatus {
    pub const ALERTS: usize = 3;
    pub const FAULTS: usize = 4;
    pub const COV_FAULTS: usize = 5;
    pub const CUV_FAULTS: usize = 6;

    pub fn request(address: Address) -> Frame {
        Frame::to_module(address, REG_ALERT_STATUS, 0x04)
    }

    pub fn reply_size() -> usize {
        7
    }
}

/// Register writes that start an ADC conversion of all cells and both thermistors.
pub struct StartConversion;

impl StartConversion {
    /// Auto mode, all inputs.
    const ADC_CTRL_ALL_INPUTS: u8 = 0b0011_1101;
    /// Thermistor excitation on.
    const IO_CTRL_TEMP_ENABLE: u8 = 0b0000_0011;

    pub fn requests(address: Address) -> [Frame; 3] {
        [
            Frame::to_module(address, REG_ADC_CTRL, Self::ADC_CTRL_ALL_INPUTS),
            Frame::to_module(address, REG_IO_CTRL, Self::IO_CTRL_TEMP_ENABLE),
            Frame::to_module(address, REG_ADC_CONV, 0x01),
        ]
    }

    pub fn reply_size() -> usize {
        3
    }
}

/// Calibration of one thermistor channel: the raw reading is offset and divided by the
/// channel full scale before conversion into a resistance.
#[derive(Debug, Clone, Copy)]
pub struct ThermistorChannel {
    offset: f32,
    full_scale: f32,
}

pub const THERMISTOR_CHANNELS: [ThermistorChannel; TEMPERATURE_CHANNELS] = [
    ThermistorChannel {
        offset: 2.0,
        full_scale: 33046.0,
    },
    ThermistorChannel {
        offset: 9.0,
        full_scale: 33068.0,
    },
];

impl ThermistorChannel {
    /// Resistance proportional value of the thermistor divider, in ohms.
    pub fn resistance(&self, raw: u16) -> f32 {
        let ratio = (raw as f32 + self.offset) / self.full_scale;
        (1.78 / ratio - 3.57) * 1000.0
    }

    /// Temperature in degree celsius. Readings outside the divider range yield NaN.
    pub fn celsius(&self, raw: u16) -> f32 {
        let ln_r = self.resistance(raw).ln();
        let kelvin = 1.0 / (SH_A + SH_B * ln_r + SH_C * ln_r.powi(3));
        kelvin - KELVIN_OFFSET
    }
}

/// Decoded general purpose analog input block.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub cells: [f32; CELLS_PER_MODULE],
    pub temperatures: [f32; TEMPERATURE_CHANNELS],
}

impl Telemetry {
    const DATA_LENGTH: u8 = 0x12;
    const CELLS_OFFSET: usize = 5;
    const TEMPERATURES_OFFSET: usize = 17;

    pub fn request(address: Address) -> Frame {
        Frame::to_module(address, REG_GPAI, Self::DATA_LENGTH)
    }

    /// Echoed header, 18 data bytes and the checksum.
    pub fn reply_size() -> usize {
        3 + Self::DATA_LENGTH as usize + 1
    }

    pub fn decode(rx_buffer: &[u8], address: Address) -> Result<Self, Error> {
        validate_len(rx_buffer, Self::reply_size())?;
        validate_checksum(rx_buffer)?;
        validate_echo(
            rx_buffer,
            [address.frame_byte(), REG_GPAI, Self::DATA_LENGTH],
        )?;

        let word = |offset: usize| u16::from_be_bytes([rx_buffer[offset], rx_buffer[offset + 1]]);

        let mut cells = [0.0; CELLS_PER_MODULE];
        for (i, cell) in cells.iter_mut().enumerate() {
            *cell = word(Self::CELLS_OFFSET + 2 * i) as f32 * CELL_VOLTS_PER_COUNT;
        }
        let mut temperatures = [0.0; TEMPERATURE_CHANNELS];
        for (i, (temperature, channel)) in temperatures
            .iter_mut()
            .zip(THERMISTOR_CHANNELS.iter())
            .enumerate()
        {
            *temperature = channel.celsius(word(Self::TEMPERATURES_OFFSET + 2 * i));
        }
        Ok(Self {
            cells,
            temperatures,
        })
    }
}

pub struct BalanceControl;

impl BalanceControl {
    pub fn request(address: Address, mask: u8) -> Frame {
        Frame::to_module(address, REG_BAL_CTRL, mask)
    }

    /// Reply size used when the balancing is switched off through `exchange`.
    pub fn stop_reply_size() -> usize {
        4
    }
}

pub struct BalanceTimer;

impl BalanceTimer {
    pub fn request(address: Address, duty: u8) -> Frame {
        Frame::to_module(address, REG_BAL_TIME, duty)
    }
}

/// Read buffer used for the balance register writes.
pub const BALANCE_REPLY_SIZE: usize = 30;

/// Bit `i` is set when cell `i` sits above the lowest cell of the pack.
pub fn balance_mask(cells: &[f32; CELLS_PER_MODULE], pack_low: f32) -> u8 {
    cells
        .iter()
        .enumerate()
        .filter(|(_, volt)| **volt > pack_low)
        .fold(0u8, |mask, (i, _)| mask | (1 << i))
}

/// Broadcast that drops every board back to the unaddressed state.
pub struct ResetAddresses;

impl ResetAddresses {
    const MAGIC: u8 = 0xA5;
    const ACK: u8 = 0x57;

    pub fn request() -> Frame {
        Frame::raw(BROADCAST_ALL << 1, REG_RESET, Self::MAGIC)
    }

    pub fn reply_size() -> usize {
        8
    }

    pub fn is_acknowledged(rx_buffer: &[u8]) -> bool {
        rx_buffer.len() >= 4
            && rx_buffer[..4] == [BROADCAST_ALL_WRITE, REG_RESET, Self::MAGIC, Self::ACK]
    }
}

/// "Is any unaddressed board present" probe.
pub struct UnaddressedProbe;

impl UnaddressedProbe {
    const REPLY_ADDRESS: u8 = 0x80;

    pub fn request() -> Frame {
        Frame::raw(BROADCAST_UNADDRESSED, REG_DEV_STATUS, 0x01)
    }

    pub fn reply_size() -> usize {
        4
    }

    pub fn is_answered(rx_buffer: &[u8]) -> bool {
        rx_buffer.len() == Self::reply_size()
            && rx_buffer[0] == Self::REPLY_ADDRESS
            && rx_buffer[1] == REG_DEV_STATUS
            && rx_buffer[2] == 0x01
    }
}

/// Assigns an address to the first unaddressed board on the chain.
pub struct SetAddress;

impl SetAddress {
    const ADDRESS_VALID: u8 = 0x80;
    const REPLY_ADDRESS: u8 = 0x81;

    pub fn request(address: Address) -> Frame {
        Frame::raw(
            BROADCAST_UNADDRESSED,
            REG_ADDR_CTRL,
            *address | Self::ADDRESS_VALID,
        )
    }

    pub fn reply_size() -> usize {
        10
    }

    pub fn is_acknowledged(rx_buffer: &[u8], address: Address) -> bool {
        rx_buffer.len() > 2
            && rx_buffer[0] == Self::REPLY_ADDRESS
            && rx_buffer[1] == REG_ADDR_CTRL
            && rx_buffer[2] == *address | Self::ADDRESS_VALID
    }
}

/// Broadcast writes that latch and then release the alert and fault registers.
pub struct ClearFaults;

impl ClearFaults {
    pub fn requests() -> [Frame; 4] {
        [
            Frame::raw(BROADCAST_ALL_WRITE, REG_ALERT_STATUS, 0xFF),
            Frame::raw(BROADCAST_ALL_WRITE, REG_ALERT_STATUS, 0x00),
            Frame::raw(BROADCAST_ALL_WRITE, REG_FAULT_STATUS, 0xFF),
            Frame::raw(BROADCAST_ALL_WRITE, REG_FAULT_STATUS, 0x00),
        ]
    }

    pub fn reply_size() -> usize {
        4
    }
}
