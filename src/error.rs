use std::io;

use packed_struct::PackingError;
use thiserror::Error;

/// Errors surfaced by the codec, session and device layers.
///
/// A `Framing` error means the peer sent something the session state
/// machine didn't expect; the session is closed but the server keeps
/// running. `Codec` wraps a `packed_struct` packing/unpacking failure
/// (wrong buffer length, out-of-range enum value). `Io` wraps the
/// underlying socket error, including read/write timeouts.
#[derive(Debug, Error)]
pub enum UsbIpError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("codec error: {0}")]
    Codec(#[from] PackingError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, UsbIpError>;
