//! Blocking HTTP GET with a streaming body callback

use std::io::{ErrorKind, Read};

use tracing::trace;

use crate::sink::{ByteSink, SinkError};

/// Status code of a successful fetch
pub const HTTP_OK: u16 = 200;

/// Errors from a single HTTP transfer
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The sink refused a slice of the body
    #[error("Transfer of {url} aborted")]
    Aborted {
        url: String,
        #[source]
        source: SinkError,
    },

    #[error("Failed to acquire {url}")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl FetchError {
    pub fn transport(
        url: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            url: url.to_string(),
            source: source.into(),
        }
    }

    pub fn aborted(url: &str, source: SinkError) -> Self {
        Self::Aborted {
            url: url.to_string(),
            source,
        }
    }

    /// The transfer stopped because the peer closed the channel
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Aborted {
                source: SinkError::Closed,
                ..
            }
        )
    }
}

/// Minimal HTTP capability the adapter needs.
///
/// Redirects are followed. Only the body of a [`HTTP_OK`] response is
/// delivered to the sink; other bodies are discarded.
pub trait HttpClient {
    /// GET `url`, stream the body into `sink`, return the final status code
    fn get(&self, url: &str, sink: &mut dyn ByteSink) -> Result<u16, FetchError>;
}

/// Pump everything `body` yields into `sink`
pub fn stream_body(
    url: &str,
    body: &mut impl Read,
    sink: &mut dyn ByteSink,
) -> Result<u64, FetchError> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(FetchError::transport(url, e)),
        };
        sink.write(&buf[..n])
            .map_err(|e| FetchError::aborted(url, e))?;
        total += n as u64;
    }

    trace!("{url}: {total} bytes");
    Ok(total)
}

/// Production client backed by `reqwest`'s blocking API
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Client following redirects, with no overall timeout.
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> color_eyre::Result<Self> {
        let client = Self::builder().build()?;
        Ok(Self { client })
    }

    fn builder() -> reqwest::blocking::ClientBuilder {
        reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(None::<std::time::Duration>)
            .user_agent(concat!("storepull/", env!("CARGO_PKG_VERSION")))
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str, sink: &mut dyn ByteSink) -> Result<u16, FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::transport(url, e))?;

        let status = response.status().as_u16();
        if status == HTTP_OK {
            stream_body(url, &mut response, sink)?;
        }
        Ok(status)
    }
}
