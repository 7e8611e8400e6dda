//! Byte sinks fed by the HTTP client as a response body streams in

use storepull_core::protocol::CHUNK_PAYLOAD_MAX;
use storepull_core::{Engine, EngineError, Pumped, Until, pump};
use tracing::error;

/// Why a sink refused a slice. Returning one aborts the transfer.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The peer closed the channel while the body was streaming
    #[error("channel closed during transfer")]
    Closed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("chunk size overflow")]
    Overflow,

    #[error("chunk too large: {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("out of memory buffering chunk")]
    OutOfMemory,
}

/// Receiver of response body slices
pub trait ByteSink {
    /// Accept one slice of the body, or abort the transfer
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;
}

/// Streams index bytes straight into the engine, honouring backpressure
pub struct IndexSink<'a, E: ?Sized> {
    engine: &'a mut E,
    written: u64,
}

impl<'a, E: Engine + ?Sized> IndexSink<'a, E> {
    pub fn new(engine: &'a mut E) -> Self {
        Self { engine, written: 0 }
    }

    /// Index bytes handed to the engine so far
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl<E: Engine + ?Sized> ByteSink for IndexSink<'_, E> {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if pump(&mut *self.engine, Until::CanPutIndex)? == Pumped::Closed {
            return Err(SinkError::Closed);
        }

        self.engine.put_index(data).map_err(|e| {
            error!("Failed to put index: {e}");
            SinkError::from(e)
        })?;
        self.written += data.len() as u64;
        Ok(())
    }
}

/// Accumulates one chunk body in local memory.
///
/// No backpressure here: the buffer is handed to the engine only once the
/// whole body has arrived.
pub struct ChunkSink<'a> {
    buffer: &'a mut Vec<u8>,
    max: usize,
}

impl<'a> ChunkSink<'a> {
    /// Sink bounded by the largest payload a CHUNK frame can carry
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self::with_limit(buffer, CHUNK_PAYLOAD_MAX)
    }

    pub fn with_limit(buffer: &'a mut Vec<u8>, max: usize) -> Self {
        Self { buffer, max }
    }
}

impl ByteSink for ChunkSink<'_> {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let size = self
            .buffer
            .len()
            .checked_add(data.len())
            .ok_or(SinkError::Overflow)?;
        if size > self.max {
            return Err(SinkError::TooLarge {
                size,
                max: self.max,
            });
        }

        self.buffer
            .try_reserve(data.len())
            .map_err(|_| SinkError::OutOfMemory)?;
        self.buffer.extend_from_slice(data);
        Ok(())
    }
}
