//! Servolink - Modbus RTU polling engine for servo drives
//!
//! This crate talks to a single drive over a serial line, reads a fixed catalog
//! of holding registers on a background worker and hands decoded, range-checked
//! batches to a caller-supplied handler. When no drive is reachable it can feed
//! the same handler with synthetic waveforms.
//!
//! The public modules expose the register client, the poll engine and the RTU
//! framing helpers. The binary's boot and command-line helpers live in separate,
//! hidden modules.

pub mod api;
#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
pub mod core;
pub mod protocol;

pub use api::*;
