//! Fetch orchestrator
//!
//! Serves one pull session: the index (if configured) is streamed into the
//! engine first, then every chunk request the peer makes is answered from
//! the configured stores, one blocking GET at a time.

use color_eyre::Result;
use color_eyre::eyre::eyre;
use storepull_core::{AbortReason, ChunkEncoding, Engine, Pumped, Until, pump};
use tracing::{debug, warn};

use crate::http::{HTTP_OK, HttpClient};
use crate::locate::chunk_url;
use crate::sink::{ChunkSink, IndexSink};
use crate::store::{Endpoints, StoreSelector};

/// Knobs for a pull session
#[derive(Debug, Clone, Copy, Default)]
pub struct PullOptions {
    /// Rotate through the stores per request instead of always asking slot 0
    pub round_robin: bool,
}

/// What a session transferred
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullStats {
    pub index_bytes: u64,
    /// Chunks served from a store
    pub chunks: u64,
    /// Requests answered with a missing marker
    pub missing: u64,
    pub chunk_bytes: u64,
}

/// Where control goes once a phase ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    /// Run the following phase
    Continue,
    /// Skip straight to draining the engine
    Drain,
    /// The channel closed; nothing left to do
    Done,
}

/// Run a pull session against `engine`.
///
/// A channel closed by the peer at any point ends the session successfully.
/// Individual chunks a store cannot serve are reported to the peer as
/// missing; only transport and engine failures are errors.
///
/// # Errors
/// Fails if an HTTP transfer cannot be performed at all, a chunk body exceeds
/// the protocol limit, or the engine reports anything other than a close.
pub fn pull<E, C>(
    engine: &mut E,
    client: &C,
    endpoints: &Endpoints,
    options: PullOptions,
) -> Result<PullStats>
where
    E: Engine + ?Sized,
    C: HttpClient + ?Sized,
{
    let mut stats = PullStats::default();

    engine
        .set_local_features(endpoints.features())
        .map_err(|e| eyre!("Failed to set feature flags: {e}"))?;

    let mut next = Next::Continue;
    if let Some(url) = endpoints.index.as_deref() {
        next = fetch_index(engine, client, url, &mut stats)?;
    }

    if next == Next::Continue {
        if let Some(selector) = endpoints.selector() {
            next = serve_chunks(engine, client, selector, options, &mut stats)?;
        }
    }

    if next != Next::Done {
        pump(engine, Until::Finished)?;
    }

    debug!(
        index_bytes = stats.index_bytes,
        chunks = stats.chunks,
        missing = stats.missing,
        chunk_bytes = stats.chunk_bytes,
        "Pull finished"
    );
    Ok(stats)
}

fn fetch_index<E, C>(
    engine: &mut E,
    client: &C,
    url: &str,
    stats: &mut PullStats,
) -> Result<Next>
where
    E: Engine + ?Sized,
    C: HttpClient + ?Sized,
{
    debug!("Acquiring {url}...");

    let mut sink = IndexSink::new(&mut *engine);
    let fetched = client.get(url, &mut sink);
    stats.index_bytes = sink.written();

    let status = match fetched {
        Ok(status) => status,
        Err(e) if e.is_closed() => return Ok(Next::Done),
        Err(e) => return Err(e.into()),
    };

    if status != HTTP_OK {
        warn!(status, "HTTP server failure {status} while requesting {url}.");
        let message = format!("HTTP request on {url} failed with status {status}");
        // The drain below reports whatever state the engine is left in
        if let Err(e) = engine.abort(AbortReason::from_http_status(status), &message) {
            warn!("Failed to abort session: {e}");
        }
        return Ok(Next::Drain);
    }

    if pump(engine, Until::CanPutIndex)? == Pumped::Closed {
        return Ok(Next::Done);
    }

    engine
        .put_index_eof()
        .map_err(|e| eyre!("Failed to put index EOF: {e}"))?;
    Ok(Next::Continue)
}

/// Answer chunk requests until the peer closes the channel
fn serve_chunks<E, C>(
    engine: &mut E,
    client: &C,
    selector: StoreSelector<'_>,
    options: PullOptions,
    stats: &mut PullStats,
) -> Result<Next>
where
    E: Engine + ?Sized,
    C: HttpClient + ?Sized,
{
    let mut buffer = Vec::new();
    let mut counter = 0usize;

    loop {
        if pump(engine, Until::HaveRequest)? == Pumped::Closed {
            return Ok(Next::Done);
        }

        let id = engine
            .next_request()
            .map_err(|e| eyre!("Failed to determine next chunk to get: {e}"))?;

        let store = selector.select(counter);
        if options.round_robin {
            counter = counter.wrapping_add(1);
        }

        let url = chunk_url(store, &id);
        debug!("Acquiring {url}...");

        buffer.clear();
        let status = client.get(&url, &mut ChunkSink::new(&mut buffer))?;

        if pump(engine, Until::CanPutChunk)? == Pumped::Closed {
            return Ok(Next::Done);
        }

        if status == HTTP_OK {
            engine
                .put_chunk(&id, ChunkEncoding::Compressed, &buffer)
                .map_err(|e| eyre!("Failed to write chunk: {e}"))?;
            stats.chunks += 1;
            stats.chunk_bytes += buffer.len() as u64;
        } else {
            debug!("HTTP server failure {status} while requesting {url}.");
            engine
                .put_missing(&id)
                .map_err(|e| eyre!("Failed to write missing message: {e}"))?;
            stats.missing += 1;
        }

        buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::FetchError;
    use crate::sink::{ByteSink, SinkError};
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use storepull_core::{ChunkId, EngineError, Step, feature};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Index(Vec<u8>),
        IndexEof,
        Chunk(ChunkId, ChunkEncoding, Vec<u8>),
        Missing(ChunkId),
        Abort(AbortReason, String),
    }

    /// Engine that refuses every put not preceded by a readiness check and
    /// stays busy for a few steps after each put.
    #[derive(Default)]
    struct MockEngine {
        features: Option<u64>,
        requests: VecDeque<ChunkId>,
        events: Vec<Event>,
        /// Steps left before the engine accepts more input
        busy: usize,
        /// Steps each put keeps the engine busy for
        backpressure: usize,
        /// Readiness confirmed by the last predicate call
        armed: Option<Until>,
        closed: bool,
        /// Close the channel once this many index bytes have arrived
        close_after_index: Option<usize>,
        /// Reject index bytes with a protocol error
        fail_put_index: bool,
        index_bytes: usize,
        steps: usize,
    }

    impl MockEngine {
        fn with_requests(ids: &[ChunkId]) -> Self {
            Self {
                requests: ids.iter().copied().collect(),
                backpressure: 2,
                ..Self::default()
            }
        }

        fn check(&mut self, until: Until) -> Result<bool, EngineError> {
            if self.closed {
                return Err(EngineError::Closed);
            }
            let ready = self.busy == 0;
            if ready {
                self.armed = Some(until);
            }
            Ok(ready)
        }

        fn disarm(&mut self, expected: Until) {
            assert_eq!(self.armed.take(), Some(expected), "put without readiness");
            self.busy = self.backpressure;
        }

        fn feature_set(&self, bit: u64) -> bool {
            self.features.is_some_and(|f| f & bit != 0)
        }
    }

    impl Engine for MockEngine {
        fn set_local_features(&mut self, features: u64) -> Result<(), EngineError> {
            assert!(self.features.is_none());
            self.features = Some(features);
            Ok(())
        }

        fn can_put_chunk(&mut self) -> Result<bool, EngineError> {
            self.check(Until::CanPutChunk)
        }

        fn can_put_index(&mut self) -> Result<bool, EngineError> {
            self.check(Until::CanPutIndex)
        }

        fn has_pending_requests(&mut self) -> Result<bool, EngineError> {
            if self.closed {
                return Err(EngineError::Closed);
            }
            Ok(self.busy == 0 && !self.requests.is_empty())
        }

        fn step(&mut self) -> Result<Step, EngineError> {
            self.steps += 1;
            if self.closed {
                return Err(EngineError::Closed);
            }
            if self.busy > 0 {
                self.busy -= 1;
                return Ok(Step::Progress);
            }
            Ok(Step::Finished)
        }

        fn poll(&mut self, _timeout: Option<Duration>) -> Result<(), EngineError> {
            Ok(())
        }

        fn put_index(&mut self, data: &[u8]) -> Result<(), EngineError> {
            assert!(self.feature_set(feature::READABLE_INDEX));
            self.disarm(Until::CanPutIndex);
            if self.fail_put_index {
                return Err(EngineError::Protocol("index frame rejected".to_string()));
            }
            self.events.push(Event::Index(data.to_vec()));
            self.index_bytes += data.len();
            if self
                .close_after_index
                .is_some_and(|limit| self.index_bytes >= limit)
            {
                self.closed = true;
            }
            Ok(())
        }

        fn put_index_eof(&mut self) -> Result<(), EngineError> {
            self.disarm(Until::CanPutIndex);
            self.events.push(Event::IndexEof);
            Ok(())
        }

        fn next_request(&mut self) -> Result<ChunkId, EngineError> {
            self.requests
                .pop_front()
                .ok_or_else(|| EngineError::Protocol("no pending request".to_string()))
        }

        fn put_chunk(
            &mut self,
            id: &ChunkId,
            encoding: ChunkEncoding,
            data: &[u8],
        ) -> Result<(), EngineError> {
            assert!(self.feature_set(feature::READABLE_STORE));
            self.disarm(Until::CanPutChunk);
            self.events.push(Event::Chunk(*id, encoding, data.to_vec()));
            Ok(())
        }

        fn put_missing(&mut self, id: &ChunkId) -> Result<(), EngineError> {
            self.disarm(Until::CanPutChunk);
            self.events.push(Event::Missing(*id));
            Ok(())
        }

        fn abort(&mut self, reason: AbortReason, message: &str) -> Result<(), EngineError> {
            self.events.push(Event::Abort(reason, message.to_string()));
            Ok(())
        }
    }

    /// Canned responses keyed by URL, bodies delivered a few bytes at a time
    #[derive(Default)]
    struct ScriptedClient {
        responses: HashMap<String, (u16, Vec<u8>)>,
        requested: RefCell<Vec<String>>,
    }

    impl ScriptedClient {
        fn respond(mut self, url: &str, status: u16, body: &[u8]) -> Self {
            self.responses
                .insert(url.to_string(), (status, body.to_vec()));
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requested.borrow().clone()
        }
    }

    impl HttpClient for ScriptedClient {
        fn get(&self, url: &str, sink: &mut dyn ByteSink) -> Result<u16, FetchError> {
            self.requested.borrow_mut().push(url.to_string());
            let (status, body) = self
                .responses
                .get(url)
                .ok_or_else(|| FetchError::transport(url, "connection refused"))?;
            if *status == HTTP_OK {
                for piece in body.chunks(3) {
                    sink.write(piece)
                        .map_err(|e| FetchError::aborted(url, e))?;
                }
            }
            Ok(*status)
        }
    }

    fn id(byte: u8) -> ChunkId {
        ChunkId::from_raw([byte; 32])
    }

    fn endpoints(index: &str, wstore: &str, stores: &[&str]) -> Endpoints {
        let stores: Vec<String> = stores.iter().map(|s| (*s).to_string()).collect();
        Endpoints::parse("-", "-", index, wstore, &stores).unwrap()
    }

    fn index_bytes(events: &[Event]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Index(data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    #[test]
    fn test_index_streamed_then_eof() {
        let body = b"caidx index body of some length".to_vec();
        let client = ScriptedClient::default().respond("http://h/a.caidx", 200, &body);
        let mut engine = MockEngine::with_requests(&[]);

        let stats = pull(
            &mut engine,
            &client,
            &endpoints("http://h/a.caidx", "-", &[]),
            PullOptions::default(),
        )
        .unwrap();

        assert_eq!(engine.features, Some(feature::READABLE_INDEX));
        assert_eq!(index_bytes(&engine.events), body);
        assert!(engine.events.iter().filter(|e| matches!(e, Event::Index(_))).count() > 1);
        assert_eq!(engine.events.last(), Some(&Event::IndexEof));
        assert_eq!(stats.index_bytes, body.len() as u64);
    }

    #[test]
    fn test_index_404_aborts_without_chunk_fetches() {
        let client = ScriptedClient::default()
            .respond("http://h/a.caidx", 404, b"not found")
            .respond(&chunk_url("http://s", &id(2)), 200, b"never");
        let mut engine = MockEngine::with_requests(&[id(2)]);

        pull(
            &mut engine,
            &client,
            &endpoints("http://h/a.caidx", "-", &["http://s"]),
            PullOptions::default(),
        )
        .unwrap();

        assert_eq!(
            engine.events,
            vec![Event::Abort(
                AbortReason::NoMedium,
                "HTTP request on http://h/a.caidx failed with status 404".to_string()
            )]
        );
        assert_eq!(client.requested(), ["http://h/a.caidx"]);
        // Drain ran to completion
        assert!(engine.steps > 0);
    }

    #[test]
    fn test_index_server_error_is_bad_response() {
        let client = ScriptedClient::default().respond("http://h/a.caidx", 500, b"");
        let mut engine = MockEngine::default();

        pull(
            &mut engine,
            &client,
            &endpoints("http://h/a.caidx", "-", &[]),
            PullOptions::default(),
        )
        .unwrap();

        assert!(matches!(
            engine.events.as_slice(),
            [Event::Abort(AbortReason::BadResponse, msg)] if msg.contains("status 500")
        ));
    }

    #[test]
    fn test_chunk_served_compressed() {
        let chunk = id(0xab);
        let url = chunk_url("http://s", &chunk);
        let client = ScriptedClient::default().respond(&url, 200, b"xz compressed bytes");
        let mut engine = MockEngine::with_requests(&[chunk]);

        let stats = pull(
            &mut engine,
            &client,
            &endpoints("-", "-", &["http://s"]),
            PullOptions::default(),
        )
        .unwrap();

        assert_eq!(engine.features, Some(feature::READABLE_STORE));
        assert_eq!(
            engine.events,
            vec![Event::Chunk(
                chunk,
                ChunkEncoding::Compressed,
                b"xz compressed bytes".to_vec()
            )]
        );
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.chunk_bytes, 19);
    }

    #[test]
    fn test_failed_chunk_is_missing_and_loop_continues() {
        let (a, b) = (id(1), id(2));
        let client = ScriptedClient::default()
            .respond(&chunk_url("http://s", &a), 503, b"unavailable")
            .respond(&chunk_url("http://s", &b), 200, b"B");
        let mut engine = MockEngine::with_requests(&[a, b]);

        let stats = pull(
            &mut engine,
            &client,
            &endpoints("-", "-", &["http://s"]),
            PullOptions::default(),
        )
        .unwrap();

        assert_eq!(
            engine.events,
            vec![
                Event::Missing(a),
                Event::Chunk(b, ChunkEncoding::Compressed, b"B".to_vec()),
            ]
        );
        assert_eq!((stats.chunks, stats.missing), (1, 1));
    }

    #[test]
    fn test_buffer_does_not_leak_between_chunks() {
        let (a, b) = (id(1), id(2));
        let client = ScriptedClient::default()
            .respond(&chunk_url("http://s", &a), 200, b"first chunk body")
            .respond(&chunk_url("http://s", &b), 200, b"2nd");
        let mut engine = MockEngine::with_requests(&[a, b]);

        pull(
            &mut engine,
            &client,
            &endpoints("-", "-", &["http://s"]),
            PullOptions::default(),
        )
        .unwrap();

        assert_eq!(
            engine.events[1],
            Event::Chunk(b, ChunkEncoding::Compressed, b"2nd".to_vec())
        );
    }

    #[test]
    fn test_requests_pinned_to_first_slot_by_default() {
        let ids = [id(1), id(2), id(3)];
        let mut client = ScriptedClient::default();
        for chunk in &ids {
            client = client.respond(&chunk_url("http://w", chunk), 200, b"w");
        }
        let mut engine = MockEngine::with_requests(&ids);

        pull(
            &mut engine,
            &client,
            &endpoints("-", "http://w", &["http://s1", "http://s2"]),
            PullOptions::default(),
        )
        .unwrap();

        assert!(client.requested().iter().all(|u| u.starts_with("http://w/")));
    }

    #[test]
    fn test_round_robin_rotates_stores() {
        let ids = [id(1), id(2), id(3), id(4)];
        let stores = ["http://w", "http://s1", "http://s2", "http://w"];
        let mut client = ScriptedClient::default();
        for (chunk, store) in ids.iter().zip(stores) {
            client = client.respond(&chunk_url(store, chunk), 200, b"x");
        }
        let mut engine = MockEngine::with_requests(&ids);

        let stats = pull(
            &mut engine,
            &client,
            &endpoints("-", "http://w", &["http://s1", "http://s2"]),
            PullOptions { round_robin: true },
        )
        .unwrap();

        assert_eq!(stats.chunks, 4);
        let expected: Vec<String> = ids
            .iter()
            .zip(stores)
            .map(|(chunk, store)| chunk_url(store, chunk))
            .collect();
        assert_eq!(client.requested(), expected);
    }

    #[test]
    fn test_oversized_chunk_is_fatal() {
        struct Huge;

        impl HttpClient for Huge {
            fn get(&self, url: &str, sink: &mut dyn ByteSink) -> Result<u16, FetchError> {
                let slice = vec![0u8; 1024 * 1024];
                loop {
                    sink.write(&slice)
                        .map_err(|e| FetchError::aborted(url, e))?;
                }
            }
        }

        let mut engine = MockEngine::with_requests(&[id(9)]);
        let err = pull(
            &mut engine,
            &Huge,
            &endpoints("-", "-", &["http://s"]),
            PullOptions::default(),
        )
        .unwrap_err();

        let source = err
            .downcast_ref::<FetchError>()
            .expect("fetch error preserved");
        assert!(matches!(
            source,
            FetchError::Aborted {
                source: SinkError::TooLarge { .. },
                ..
            }
        ));
        assert!(engine.events.is_empty());
    }

    #[test]
    fn test_transport_failure_is_fatal() {
        let client = ScriptedClient::default();
        let mut engine = MockEngine::with_requests(&[id(1)]);

        let err = pull(
            &mut engine,
            &client,
            &endpoints("-", "-", &["http://s"]),
            PullOptions::default(),
        )
        .unwrap_err();

        assert!(err.to_string().starts_with("Failed to acquire http://s/0101/"));
    }

    #[test]
    fn test_close_during_index_is_success() {
        let body = vec![7u8; 30];
        let client = ScriptedClient::default().respond("http://h/a.caidx", 200, &body);
        let mut engine = MockEngine {
            close_after_index: Some(6),
            ..MockEngine::with_requests(&[])
        };

        pull(
            &mut engine,
            &client,
            &endpoints("http://h/a.caidx", "-", &[]),
            PullOptions::default(),
        )
        .unwrap();

        assert_eq!(index_bytes(&engine.events).len(), 6);
        assert!(!engine.events.contains(&Event::IndexEof));
    }

    #[test]
    fn test_index_engine_failure_is_fatal() {
        let client = ScriptedClient::default().respond("http://h/a.caidx", 200, b"index body");
        let mut engine = MockEngine {
            fail_put_index: true,
            ..MockEngine::with_requests(&[])
        };

        let err = pull(
            &mut engine,
            &client,
            &endpoints("http://h/a.caidx", "-", &[]),
            PullOptions::default(),
        )
        .unwrap_err();

        let source = err
            .downcast_ref::<FetchError>()
            .expect("fetch error preserved");
        assert!(!source.is_closed());
        assert!(matches!(
            source,
            FetchError::Aborted {
                source: SinkError::Engine(EngineError::Protocol(_)),
                ..
            }
        ));
        assert!(!engine.events.contains(&Event::IndexEof));
        assert!(engine.events.is_empty());
    }

    #[test]
    fn test_closed_channel_before_first_request() {
        let client = ScriptedClient::default();
        let mut engine = MockEngine {
            closed: true,
            ..MockEngine::default()
        };

        let stats = pull(
            &mut engine,
            &client,
            &endpoints("-", "-", &["http://s"]),
            PullOptions::default(),
        )
        .unwrap();

        assert_eq!(stats, PullStats::default());
        assert!(client.requested().is_empty());
    }

    #[test]
    fn test_index_then_chunks() {
        let chunk = id(0x42);
        let client = ScriptedClient::default()
            .respond("http://h/a.caidx", 200, b"idx")
            .respond(&chunk_url("http://s", &chunk), 200, b"data");
        let mut engine = MockEngine::with_requests(&[chunk]);

        pull(
            &mut engine,
            &client,
            &endpoints("http://h/a.caidx", "-", &["http://s"]),
            PullOptions::default(),
        )
        .unwrap();

        assert_eq!(
            engine.features,
            Some(feature::READABLE_INDEX | feature::READABLE_STORE)
        );
        assert_eq!(
            engine.events,
            vec![
                Event::Index(b"idx".to_vec()),
                Event::IndexEof,
                Event::Chunk(chunk, ChunkEncoding::Compressed, b"data".to_vec()),
            ]
        );
    }
}
