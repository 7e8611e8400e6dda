//! Engine capability boundary and the pump that drives it
//!
//! Everything that touches the protocol engine goes through [`Engine`]. The
//! adapter never writes into the engine without first calling [`pump`] to
//! establish readiness.

use std::time::Duration;

use tracing::error;

use crate::chunk::ChunkId;
use crate::protocol::{ChunkEncoding, ProtocolError};

/// Outcome of a single [`Engine::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Some work was done, call again
    Progress,
    /// Nothing to do until the underlying I/O becomes ready
    Poll,
    /// The session is over and all output has been flushed
    Finished,
}

/// Why a session is being aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The requested object does not exist (HTTP 404)
    NoMedium,
    /// The server answered with something other than success
    BadResponse,
}

impl AbortReason {
    /// Numeric code sent on the wire (errno values understood by the peer)
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::NoMedium => 123,
            Self::BadResponse => 53,
        }
    }

    /// Map a failing HTTP status to an abort reason
    #[must_use]
    pub fn from_http_status(status: u16) -> Self {
        if status == 404 {
            Self::NoMedium
        } else {
            Self::BadResponse
        }
    }
}

/// Errors reported by an [`Engine`]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The peer closed the duplex channel. Expected termination, not a failure.
    #[error("channel closed")]
    Closed,

    #[error("peer aborted session (code {code}): {reason}")]
    PeerAborted { code: u32, reason: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Wire(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Operations the HTTP adapter needs from a protocol engine.
///
/// [`crate::RemoteEngine`] is the production implementation; tests drive the
/// adapter with scripted implementations of the same trait.
pub trait Engine {
    /// Announce what this side can serve. Must be called before the first step.
    fn set_local_features(&mut self, features: u64) -> Result<(), EngineError>;

    /// Whether one chunk payload may be queued right now
    fn can_put_chunk(&mut self) -> Result<bool, EngineError>;

    /// Whether a slice of index bytes may be queued right now
    fn can_put_index(&mut self) -> Result<bool, EngineError>;

    /// Whether the peer has asked for at least one chunk we have not answered
    fn has_pending_requests(&mut self) -> Result<bool, EngineError>;

    /// Advance the engine by one unit of work
    fn step(&mut self) -> Result<Step, EngineError>;

    /// Block until the underlying I/O is ready; `None` waits forever
    fn poll(&mut self, timeout: Option<Duration>) -> Result<(), EngineError>;

    fn put_index(&mut self, data: &[u8]) -> Result<(), EngineError>;

    fn put_index_eof(&mut self) -> Result<(), EngineError>;

    /// Take the oldest outstanding chunk request
    fn next_request(&mut self) -> Result<ChunkId, EngineError>;

    fn put_chunk(
        &mut self,
        id: &ChunkId,
        encoding: ChunkEncoding,
        data: &[u8],
    ) -> Result<(), EngineError>;

    fn put_missing(&mut self, id: &ChunkId) -> Result<(), EngineError>;

    /// Terminate the whole session, telling the peer why
    fn abort(&mut self, reason: AbortReason, message: &str) -> Result<(), EngineError>;
}

/// Readiness condition to pump towards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Until {
    CanPutChunk,
    CanPutIndex,
    HaveRequest,
    /// Drain until the engine reports it is finished
    Finished,
}

impl Until {
    fn describe(self) -> &'static str {
        match self {
            Self::CanPutChunk => "whether a chunk can be queued",
            Self::CanPutIndex => "whether an index fragment can be queued",
            Self::HaveRequest => "whether there are pending requests",
            Self::Finished => "completion",
        }
    }
}

/// Result of a successful [`pump`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pumped {
    /// The condition holds (or, for [`Until::Finished`], the engine is done)
    Ready,
    /// The peer closed the channel before the condition held
    Closed,
}

/// Advance `engine` until `until` holds, the channel closes or an error occurs.
///
/// A closed channel is returned as [`Pumped::Closed`] and is never logged as an
/// error. For [`Until::Finished`] a closed channel is the success path.
///
/// # Errors
/// Any engine error other than [`EngineError::Closed`].
pub fn pump<E: Engine + ?Sized>(engine: &mut E, until: Until) -> Result<Pumped, EngineError> {
    loop {
        let ready = match until {
            Until::CanPutChunk => engine.can_put_chunk(),
            Until::CanPutIndex => engine.can_put_index(),
            Until::HaveRequest => engine.has_pending_requests(),
            Until::Finished => Ok(false),
        };

        match ready {
            Ok(true) => return Ok(Pumped::Ready),
            Ok(false) => {}
            Err(EngineError::Closed) => return Ok(Pumped::Closed),
            Err(e) => {
                error!("Failed to determine {}: {e}", until.describe());
                return Err(e);
            }
        }

        match engine.step() {
            Ok(Step::Finished) | Err(EngineError::Closed) => {
                return Ok(if until == Until::Finished {
                    Pumped::Ready
                } else {
                    Pumped::Closed
                });
            }
            Ok(Step::Progress) => {}
            Ok(Step::Poll) => {
                if let Err(e) = engine.poll(None) {
                    if e.is_closed() {
                        // Next step observes the closed channel
                        continue;
                    }
                    error!("Failed to poll remoting engine: {e}");
                    return Err(e);
                }
            }
            Err(e) => {
                error!("Failed to process remoting engine: {e}");
                return Err(e);
            }
        }
    }
}
