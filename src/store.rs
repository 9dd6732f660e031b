//! Coordination store seam.
//!
//! The reconciler is written against [`CoordinationStore`] so it can be driven by
//! etcd in production and by an in-memory source in tests.

use std::future::Future;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// One key-value notification. Not retained after it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Change {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ChangeKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// Full read of the watched prefix.
#[derive(Debug, Clone, Default)]
pub struct Seed {
    /// Every key currently under the prefix, as puts.
    pub changes: Vec<Change>,
    /// Store revision the read was served at.
    pub revision: i64,
}

pub trait CoordinationStore {
    type Watch: WatchStream;

    /// Read every key under `prefix`.
    fn load(&mut self, prefix: &str) -> impl Future<Output = Result<Seed>> + Send;

    /// Subscribe to changes under `prefix`, starting at `start_revision`.
    fn watch(
        &mut self,
        prefix: &str,
        start_revision: i64,
    ) -> impl Future<Output = Result<Self::Watch>> + Send;
}

pub trait WatchStream {
    /// Wait for the next batch of changes.
    ///
    /// `Ok(None)` means the subscription ended; the caller treats that as a
    /// connection loss. Must be cancel safe: dropping the future before it
    /// resolves loses no batch.
    fn next_batch(&mut self) -> impl Future<Output = Result<Option<Vec<Change>>>> + Send;
}
