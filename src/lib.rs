#![cfg_attr(docsrs, feature(doc_cfg))]
//! # teslabms_lib
//!
//! This crate talks to the daisy-chained battery module boards of a Tesla Model S/X pack
//! over their shared single-wire serial bus. It assigns addresses, polls cell voltages and
//! temperatures, aggregates them into pack figures and drives passive cell balancing.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `teslabms`
//!   command-line tool and pulls in `serialport`.
//! - `serialport`: Enables [`serialport::SerialUart`], the hardware UART built on the
//!   `serialport` crate.
//! - `bin-dependencies`: Enables all features required by the `teslabms` binary executable.
//!
//! Without any feature the crate still builds the complete engine; [`sim`] provides a
//! simulated bus for running it without hardware.

/// Contains error types for the library.
mod error;
/// Bus orchestration: discovery, polling, balancing and publishing.
pub mod manager;
/// Cached per-module state.
pub mod module;
/// Pack level aggregates.
pub mod pack;
/// Parameter keys and the store interface.
pub mod params;
/// Defines the wire protocol of the module boards.
pub mod protocol;
/// Software model of the module chain.
pub mod sim;
/// Framing, bounded receive and retry on top of a byte UART.
pub mod transport;

pub use error::{Error, Result};

/// Hardware UART for the module bus.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
