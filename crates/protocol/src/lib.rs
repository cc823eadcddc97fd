//! MPS Protocol - APF frame definitions and serialization
//!
//! This crate defines the wire layer of the APF protocol:
//! - `Command`: one-byte command codes and their minimum frame sizes
//! - `Frame`: typed frames with a bounds-checked incremental decoder
//! - `ControlMessage`: JSON payloads carried by the `JSON_CONTROL` extension
//!
//! Everything here is pure; no I/O happens in this crate.

mod command;
mod control;
mod frame;
mod validation;

pub use command::*;
pub use control::*;
pub use frame::*;
pub use validation::*;
