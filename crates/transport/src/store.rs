//! Configured endpoints and store selection

use color_eyre::Result;
use color_eyre::eyre::bail;
use storepull_core::feature;

/// `""` and `"-"` both mean "not configured"
fn configured(arg: &str) -> Option<String> {
    match arg {
        "" | "-" => None,
        other => Some(other.to_string()),
    }
}

/// Where to pull from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub index: Option<String>,
    /// Primary store, always slot 0 of the rotation when present
    pub writable_store: Option<String>,
    /// Additional read-only mirrors, in the order given
    pub stores: Vec<String>,
}

impl Endpoints {
    /// Validate the positional endpoint arguments.
    ///
    /// # Errors
    /// Rejects base/archive endpoints (not supported over HTTP) and a
    /// configuration with neither an index nor a store.
    pub fn parse(
        base: &str,
        archive: &str,
        index: &str,
        writable_store: &str,
        stores: &[String],
    ) -> Result<Self> {
        if configured(base).is_some() || configured(archive).is_some() {
            bail!("Pushing/pulling to base or archive via HTTP not yet supported.");
        }

        let endpoints = Self {
            index: configured(index),
            writable_store: configured(writable_store),
            stores: stores.to_vec(),
        };

        if endpoints.index.is_none() && !endpoints.has_stores() {
            bail!("Nothing to do.");
        }

        Ok(endpoints)
    }

    #[must_use]
    pub fn has_stores(&self) -> bool {
        self.store_count() > 0
    }

    /// Writable store (if any) plus every read-only store
    #[must_use]
    pub fn store_count(&self) -> usize {
        usize::from(self.writable_store.is_some()) + self.stores.len()
    }

    /// Feature flags to announce to the peer
    #[must_use]
    pub fn features(&self) -> u64 {
        let mut features = 0;
        if self.has_stores() {
            features |= feature::READABLE_STORE;
        }
        if self.index.is_some() {
            features |= feature::READABLE_INDEX;
        }
        features
    }

    /// Selector over the configured stores, or `None` without any store
    #[must_use]
    pub fn selector(&self) -> Option<StoreSelector<'_>> {
        self.has_stores().then(|| StoreSelector {
            writable: self.writable_store.as_deref(),
            stores: &self.stores,
        })
    }
}

/// Picks the store to query for a request.
///
/// With a writable store configured, slot 0 is the writable store and slots
/// 1.. are the read-only stores; otherwise slots map straight onto them.
#[derive(Debug, Clone, Copy)]
pub struct StoreSelector<'a> {
    writable: Option<&'a str>,
    stores: &'a [String],
}

impl<'a> StoreSelector<'a> {
    /// Number of slots in the rotation (never zero)
    #[must_use]
    pub fn slots(&self) -> usize {
        usize::from(self.writable.is_some()) + self.stores.len()
    }

    /// Store for request number `counter`
    #[must_use]
    pub fn select(&self, counter: usize) -> &'a str {
        let stores = self.stores;
        let slot = counter % self.slots();
        match self.writable {
            Some(writable) if slot == 0 => writable,
            Some(_) => stores[slot - 1].as_str(),
            None => stores[slot].as_str(),
        }
    }
}
