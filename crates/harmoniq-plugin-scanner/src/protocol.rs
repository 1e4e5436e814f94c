//! Messages exchanged between the host and its scan worker.
//!
//! Every message travels in a frame: a magic number followed by a
//! length-prefixed payload. Requests are a pair of length-prefixed strings
//! (format name, then locator); responses are descriptor documents (see
//! [`harmoniq_plugin_db::xml`]).

use std::io::{self, Read, Write};

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FRAME_MAGIC: u32 = 0x4851_5343;
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode or decode message: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("unexpected frame magic {0:#010x}")]
    BadMagic(u32),
    #[error("worker closed the connection before identifying itself")]
    MissingHandshake,
    #[error("worker announced an unexpected session token")]
    TokenMismatch,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_SIZE)
}

/// Host to worker: probe `locator` with the backend called `format_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub format_name: String,
    pub locator: String,
}

impl ScanRequest {
    pub fn new(format_name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            format_name: format_name.into(),
            locator: locator.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(wire_options().serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(wire_options().deserialize(bytes)?)
    }
}

#[derive(Serialize)]
struct FrameRef<'a> {
    magic: u32,
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct Frame {
    magic: u32,
    payload: Vec<u8>,
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    let frame = FrameRef {
        magic: FRAME_MAGIC,
        payload,
    };
    wire_options().serialize_into(&mut *writer, &frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame, returning `None` when the stream has ended.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError> {
    match wire_options().deserialize_from::<_, Frame>(&mut *reader) {
        Ok(frame) if frame.magic == FRAME_MAGIC => Ok(Some(frame.payload)),
        Ok(frame) => Err(ProtocolError::BadMagic(frame.magic)),
        Err(err) => {
            let closed = matches!(
                &*err,
                bincode::ErrorKind::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof
            );
            if closed {
                Ok(None)
            } else {
                Err(err.into())
            }
        }
    }
}
