// src/error.rs
use std::time::Duration;
use thiserror::Error;

use crate::network::codec::CodecError;
use crate::network::transport::TransportError;

/// Errors surfaced by the session layer to local callers
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("peer stayed busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("network service is shutting down")]
    Shutdown,

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
