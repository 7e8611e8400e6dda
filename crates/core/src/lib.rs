//! storepull-core: chunk identifiers, wire protocol and the protocol engine
//!
//! Provides the [`Engine`] capability boundary, the [`pump`] that drives it,
//! and [`RemoteEngine`], which speaks the wire protocol over a duplex channel.

pub mod chunk;
pub mod engine;
pub mod protocol;
pub mod remote;

pub use chunk::ChunkId;
pub use engine::{AbortReason, Engine, EngineError, Pumped, Step, Until, pump};
pub use protocol::{ChunkEncoding, Message, ProtocolReader, ProtocolWriter, feature};
pub use remote::RemoteEngine;
