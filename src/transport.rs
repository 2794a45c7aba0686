//! Byte level link to the module chain.
//!
//! The [`Transport`] owns a [`Uart`] and a [`Clock`] and implements framing, the bounded
//! per-byte receive and the request/response retry. Nothing in here returns an error:
//! a short or empty reply is the only failure signal and callers validate what they get.

use crate::protocol::Frame;
use crate::Result;
use std::time::Duration;

/// Per byte receive budget.
pub const BYTE_TIMEOUT: Duration = Duration::from_millis(5);
/// Granularity of the receive poll.
pub const POLL_STEP: Duration = Duration::from_micros(1);
/// Total send/receive attempts of [`Transport::exchange`].
pub const EXCHANGE_ATTEMPTS: usize = 3;

/// Byte level access to the serial port.
pub trait Uart {
    /// Non-blocking check whether a received byte is waiting.
    fn has_data(&mut self) -> Result<bool>;
    /// Blocks until the byte is accepted for transmission.
    fn send_byte(&mut self, byte: u8) -> Result<()>;
    /// Reads one byte, only called after [`Uart::has_data`] reported one.
    fn recv_byte(&mut self) -> Result<u8>;
}

/// Monotonic time source with a blocking delay.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    fn delay(&mut self, duration: Duration);
}

/// Wall clock backed by [`std::time::Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Polls `ready` every `step` until it returns true or `budget` has elapsed on `clock`.
/// Returns whether `ready` succeeded.
pub fn poll_with_deadline<C, F>(
    clock: &mut C,
    budget: Duration,
    step: Duration,
    mut ready: F,
) -> bool
where
    C: Clock,
    F: FnMut() -> bool,
{
    let deadline = clock.now() + budget;
    loop {
        if ready() {
            return true;
        }
        if clock.now() >= deadline {
            return false;
        }
        clock.delay(step);
    }
}

/// Wait after a request proportional to the expected reply size.
pub fn reply_settle_delay(reply_len: usize) -> Duration {
    Duration::from_micros(2000 * ((reply_len / 8) as u64 + 1))
}

#[derive(Debug)]
pub struct Transport<U, C> {
    uart: U,
    clock: C,
}

impl<U: Uart, C: Clock> Transport<U, C> {
    pub fn new(uart: U, clock: C) -> Self {
        Self { uart, clock }
    }

    pub fn uart(&self) -> &U {
        &self.uart
    }

    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn delay(&mut self, duration: Duration) {
        self.clock.delay(duration);
    }

    fn has_data(&mut self) -> bool {
        self.uart.has_data().unwrap_or_else(|err| {
            log::warn!("Cannot check serial input: {err}");
            false
        })
    }

    /// Discards everything waiting in the receive buffer.
    fn drain(&mut self) {
        while self.has_data() {
            match self.uart.recv_byte() {
                Ok(byte) => log::trace!("Discarding pending byte {byte:02X}"),
                Err(err) => {
                    log::warn!("Cannot read pending byte: {err}");
                    break;
                }
            }
        }
    }

    /// Transmits `frame`, appending the CRC on writes. Stale input is flushed first.
    pub fn send(&mut self, frame: &Frame, is_write: bool) {
        self.drain();
        let tx_buffer = frame.encode(is_write);
        log::trace!("send_bytes: {:02X?}", tx_buffer);
        for byte in tx_buffer {
            if let Err(err) = self.uart.send_byte(byte) {
                log::warn!("Cannot write to serial: {err}");
                return;
            }
        }
    }

    /// Reads up to `max_len` bytes, giving each byte [`BYTE_TIMEOUT`] to arrive.
    /// Stops at the first byte that times out; whatever is left afterwards is drained.
    pub fn receive(&mut self, max_len: usize) -> Vec<u8> {
        let mut rx_buffer = Vec::with_capacity(max_len);
        while rx_buffer.len() < max_len {
            let uart = &mut self.uart;
            let got = poll_with_deadline(&mut self.clock, BYTE_TIMEOUT, POLL_STEP, || {
                uart.has_data().unwrap_or_else(|err| {
                    log::warn!("Cannot check serial input: {err}");
                    false
                })
            });
            if !got {
                break;
            }
            match self.uart.recv_byte() {
                Ok(byte) => rx_buffer.push(byte),
                Err(err) => {
                    log::warn!("Cannot receive byte: {err}");
                    break;
                }
            }
        }
        self.drain();
        log::trace!("receive_bytes: {:02X?}", rx_buffer);
        rx_buffer
    }

    /// Sends `frame` and reads the reply, retrying until exactly `expected_len` bytes
    /// arrive or [`EXCHANGE_ATTEMPTS`] are used up. The last reply is returned either way.
    pub fn exchange(&mut self, frame: &Frame, is_write: bool, expected_len: usize) -> Vec<u8> {
        let mut rx_buffer = Vec::new();
        for attempt in 1..=EXCHANGE_ATTEMPTS {
            self.send(frame, is_write);
            self.clock.delay(reply_settle_delay(expected_len));
            rx_buffer = self.receive(expected_len);
            if rx_buffer.len() == expected_len {
                break;
            }
            log::trace!(
                "Failed try {} of {}, repeating (received {} of {} bytes)",
                attempt,
                EXCHANGE_ATTEMPTS,
                rx_buffer.len(),
                expected_len
            );
        }
        rx_buffer
    }
}
