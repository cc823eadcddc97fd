//! MPS Engine - APF connection handling
//!
//! This crate provides:
//! - Frame accumulation and command dispatch per connection
//! - Handshake and identity binding against a device directory
//! - Port-forward global requests
//! - Virtual channels with credit-based flow control
//! - A registry of live device connections

mod channel;
mod config;
mod directory;
mod error;
mod events;
mod global;
mod handle;
mod handshake;
mod identity;
mod metrics;
mod mux;
mod registry;
mod session;
mod transport;
mod worker;

pub use channel::*;
pub use config::*;
pub use directory::*;
pub use error::*;
pub use events::*;
pub use handle::*;
pub use handshake::*;
pub use identity::*;
pub use metrics::*;
pub use registry::*;
pub use session::*;
pub use transport::*;
pub use worker::*;
