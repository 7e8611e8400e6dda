//! storepull-transport: HTTP side of a pull session
//!
//! Fetches an index and chunks over HTTP and feeds them into a protocol
//! engine, honouring its backpressure.

pub mod http;
pub mod locate;
pub mod pull;
pub mod sink;
pub mod store;

pub use http::{FetchError, HttpClient, ReqwestClient};
pub use locate::chunk_url;
pub use pull::{PullOptions, PullStats, pull};
pub use sink::{ByteSink, ChunkSink, IndexSink, SinkError};
pub use store::{Endpoints, StoreSelector};
