//! Software model of the module chain for deterministic testing without hardware.
//!
//! [`SimUart`] hands every transmitted frame to a [`Responder`] and queues the answer as
//! received bytes. [`SimulatedPack`] is a responder that behaves like a chain of boards.

use crate::protocol::*;
use crate::transport::{Clock, Uart};
use crate::Result;
use std::collections::VecDeque;
use std::time::Duration;

/// Virtual time: `delay` only advances the counter.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Duration,
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.now
    }

    fn delay(&mut self, duration: Duration) {
        self.now += duration;
    }
}

/// Produces the reply to one transmitted frame.
pub trait Responder {
    fn respond(&mut self, frame: &[u8]) -> Vec<u8>;
}

impl<F> Responder for F
where
    F: FnMut(&[u8]) -> Vec<u8>,
{
    fn respond(&mut self, frame: &[u8]) -> Vec<u8> {
        self(frame)
    }
}

#[derive(Debug)]
pub struct SimUart<R> {
    responder: R,
    tx: Vec<u8>,
    rx: VecDeque<u8>,
    frames: Vec<Vec<u8>>,
}

impl<R: Responder> SimUart<R> {
    pub fn new(responder: R) -> Self {
        Self {
            responder,
            tx: Vec::new(),
            rx: VecDeque::new(),
            frames: Vec::new(),
        }
    }

    /// Every frame transmitted so far, in order.
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn responder(&self) -> &R {
        &self.responder
    }

    pub fn responder_mut(&mut self) -> &mut R {
        &mut self.responder
    }

    /// The line turns around once the host starts listening.
    fn turnaround(&mut self) {
        if self.tx.is_empty() {
            return;
        }
        let frame = std::mem::take(&mut self.tx);
        self.rx.extend(self.responder.respond(&frame));
        self.frames.push(frame);
    }
}

impl<R: Responder> Uart for SimUart<R> {
    fn has_data(&mut self) -> Result<bool> {
        self.turnaround();
        Ok(!self.rx.is_empty())
    }

    fn send_byte(&mut self, byte: u8) -> Result<()> {
        self.tx.push(byte);
        Ok(())
    }

    fn recv_byte(&mut self) -> Result<u8> {
        self.turnaround();
        self.rx.pop_front().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "no byte pending").into()
        })
    }
}

/// One emulated board.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedBoard {
    pub address: Option<u8>,
    pub cells_raw: [u16; CELLS_PER_MODULE],
    pub temperatures_raw: [u16; TEMPERATURE_CHANNELS],
    pub alerts: u8,
    pub faults: u8,
    pub cov_faults: u8,
    pub cuv_faults: u8,
    pub balance_mask: u8,
    pub balance_duty: u8,
    /// Flip a bit in the telemetry checksum.
    pub corrupt_telemetry: bool,
    /// Answer nothing at all.
    pub silent: bool,
}

impl SimulatedBoard {
    /// Raw cell count for 3.70V.
    pub const CELL_3V70: u16 = 9699;
    /// Raw thermistor readings of both channels at roughly 25 degree celsius.
    pub const TEMPERATURES_25C: [u16; TEMPERATURE_CHANNELS] = [4333, 4326];

    pub fn new(address: Option<u8>) -> Self {
        Self {
            address,
            cells_raw: [Self::CELL_3V70; CELLS_PER_MODULE],
            temperatures_raw: Self::TEMPERATURES_25C,
            alerts: 0,
            faults: 0,
            cov_faults: 0,
            cuv_faults: 0,
            balance_mask: 0,
            balance_duty: 0,
            corrupt_telemetry: false,
            silent: false,
        }
    }

    /// Sets every cell to `volts`, rounded to the nearest ADC count.
    pub fn with_cell_volts(mut self, volts: [f32; CELLS_PER_MODULE]) -> Self {
        for (raw, volt) in self.cells_raw.iter_mut().zip(volts) {
            *raw = (volt / CELL_VOLTS_PER_COUNT).round() as u16;
        }
        self
    }

    fn telemetry(&self) -> Vec<u8> {
        let address = self.address.unwrap_or(0);
        let module_raw: u32 = self.cells_raw.iter().map(|raw| *raw as u32).sum();
        let mut rx = vec![address << 1, REG_GPAI, 0x12];
        rx.extend_from_slice(&((module_raw / 6) as u16).to_be_bytes());
        for raw in self.cells_raw.iter().chain(self.temperatures_raw.iter()) {
            rx.extend_from_slice(&raw.to_be_bytes());
        }
        let mut crc = crc8(&rx);
        if self.corrupt_telemetry {
            crc ^= 0x01;
        }
        rx.push(crc);
        rx
    }
}

/// A chain of [`SimulatedBoard`]s sharing one bus.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPack {
    pub boards: Vec<SimulatedBoard>,
}

fn with_crc(mut reply: Vec<u8>) -> Vec<u8> {
    reply.push(crc8(&reply));
    reply
}

impl SimulatedPack {
    /// `count` boards already holding addresses 1..=count.
    pub fn addressed(count: u8) -> Self {
        Self {
            boards: (1..=count).map(|a| SimulatedBoard::new(Some(a))).collect(),
        }
    }

    /// `count` boards fresh from power up.
    pub fn unaddressed(count: usize) -> Self {
        Self {
            boards: vec![SimulatedBoard::new(None); count],
        }
    }

    pub fn board(&self, address: u8) -> Option<&SimulatedBoard> {
        self.boards.iter().find(|b| b.address == Some(address))
    }

    pub fn board_mut(&mut self, address: u8) -> Option<&mut SimulatedBoard> {
        self.boards.iter_mut().find(|b| b.address == Some(address))
    }

    fn first_unaddressed(&mut self) -> Option<&mut SimulatedBoard> {
        self.boards.iter_mut().find(|b| b.address.is_none() && !b.silent)
    }
}

impl Responder for SimulatedPack {
    fn respond(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame.len() < 3 {
            return Vec::new();
        }
        let (address_byte, register, data) = (frame[0], frame[1], frame[2]);
        let is_write = address_byte & 0x01 != 0;

        if address_byte == BROADCAST_ALL_WRITE {
            if register == REG_RESET && data == 0xA5 {
                self.boards.iter_mut().for_each(|b| b.address = None);
                return vec![BROADCAST_ALL_WRITE, REG_RESET, 0xA5, 0x57];
            }
            return with_crc(frame[..3].to_vec());
        }

        if address_byte >> 1 == 0 {
            return match (is_write, register) {
                (false, REG_DEV_STATUS) => match self.first_unaddressed() {
                    Some(_) => vec![0x80, REG_DEV_STATUS, 0x01, 0x00],
                    None => Vec::new(),
                },
                (true, REG_ADDR_CTRL) => match self.first_unaddressed() {
                    Some(board) => {
                        board.address = Some(data & 0x3F);
                        with_crc(vec![0x81, REG_ADDR_CTRL, data])
                    }
                    None => Vec::new(),
                },
                _ => Vec::new(),
            };
        }

        let address = address_byte >> 1;
        let board = match self.board_mut(address) {
            Some(board) if !board.silent => board,
            _ => return Vec::new(),
        };
        match (is_write, register) {
            (false, REG_DEV_STATUS) => with_crc(vec![address << 1, REG_DEV_STATUS, 0x01, 0x00]),
            (false, REG_ALERT_STATUS) => with_crc(vec![
                address << 1,
                REG_ALERT_STATUS,
                0x04,
                board.alerts,
                board.faults,
                board.cov_faults,
                board.cuv_faults,
            ]),
            (false, REG_GPAI) => board.telemetry(),
            (true, REG_BAL_CTRL) => {
                board.balance_mask = data;
                with_crc(frame[..3].to_vec())
            }
            (true, REG_BAL_TIME) => {
                board.balance_duty = data;
                with_crc(frame[..3].to_vec())
            }
            (true, _) => with_crc(frame[..3].to_vec()),
            _ => Vec::new(),
        }
    }
}
