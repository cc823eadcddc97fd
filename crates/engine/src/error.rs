//! Engine errors

use mps_protocol::{Command, DecodeError};
use thiserror::Error;

use crate::directory::DirectoryError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("{0} received before authentication")]
    Unauthenticated(Command),

    #[error("Unknown channel {0}")]
    UnknownChannel(u32),

    #[error("Channel {0} is closed")]
    ChannelClosed(u32),

    #[error("Connection is not authenticated")]
    NotAuthenticated,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Control message error: {0}")]
    Control(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
