//! Mapping of chunk identifiers onto store URLs
//!
//! Stores are laid out as `<store>/<first 4 hex chars>/<64 hex chars>.xz`.

use storepull_core::ChunkId;

/// Suffix of every object in a store; objects are stored compressed
pub const CHUNK_SUFFIX: &str = ".xz";

/// Number of leading hex characters used as the shard directory
const SHARD_LEN: usize = 4;

/// Build the URL of `id` inside the store at `store_url`.
///
/// Anything from the first `?` or `;` on is dropped, as are trailing slashes.
#[must_use]
pub fn chunk_url(store_url: &str, id: &ChunkId) -> String {
    let end = store_url.find(['?', ';']).unwrap_or(store_url.len());
    let prefix = store_url[..end].trim_end_matches('/');
    let hex = id.to_hex();

    format!("{prefix}/{}/{hex}{CHUNK_SUFFIX}", &hex[..SHARD_LEN])
}
