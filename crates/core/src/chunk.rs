//! Content-derived chunk identifiers

use std::fmt;
use std::str::FromStr;

/// Raw size of a chunk identifier in bytes
pub const CHUNK_ID_SIZE: usize = 32;

/// Length of the canonical lowercase-hex form
pub const CHUNK_ID_HEX_LEN: usize = CHUNK_ID_SIZE * 2;

/// A 256-bit content fingerprint naming one chunk.
///
/// The adapter never computes these itself: they arrive in REQUEST frames and
/// are echoed back in CHUNK / MISSING frames and in store URLs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; CHUNK_ID_SIZE]);

impl ChunkId {
    /// Wrap raw digest bytes
    #[must_use]
    pub const fn from_raw(bytes: [u8; CHUNK_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copy an identifier out of a slice of exactly [`CHUNK_ID_SIZE`] bytes
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; CHUNK_ID_SIZE]>::try_from(bytes).ok().map(Self)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; CHUNK_ID_SIZE] {
        &self.0
    }

    /// Canonical lowercase hex, always [`CHUNK_ID_HEX_LEN`] characters
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ChunkId {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = [0u8; CHUNK_ID_SIZE];
        hex::decode_to_slice(s, &mut raw)
            .map_err(|e| color_eyre::eyre::eyre!("invalid chunk id {s:?}: {e}"))?;
        Ok(Self(raw))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ChunkId({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
