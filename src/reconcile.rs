//! Event reconciliation loop.
//!
//! Folds the store's change notifications into the [`Registry`] and rewrites the
//! target file once per batch. The reconciler is the registry's only owner, so
//! every mutation is serialized through `&mut self`.

use std::future::Future;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::key;
use crate::registry::Registry;
use crate::store::{Change, ChangeKind, CoordinationStore, WatchStream};
use crate::target::TargetFile;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Connecting,
    Watching,
    /// Clean shutdown.
    Draining,
    /// Retries exhausted or a fatal error; the process should exit non-zero.
    Failed,
}

/// What to do when a single change or write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Log it and keep going.
    #[default]
    Skip,
    /// Stop the loop with the error.
    Fatal,
}

/// Exponential backoff for re-establishing the watch.
///
/// Delay for attempt `n` (0-based) is `min(initial * multiplier^n, max)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Reconnect attempts before giving up. Resets once a watch is established.
    pub max_retries: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            initial,
            max,
            ..Default::default()
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub prefix: String,
    pub retry: RetryPolicy,
    pub malformed_keys: ErrorPolicy,
    pub write_errors: ErrorPolicy,
}

impl ReconcilerConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            retry: RetryPolicy::default(),
            malformed_keys: ErrorPolicy::Skip,
            write_errors: ErrorPolicy::Skip,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::new(key::DEFAULT_PREFIX)
    }
}

/// Counters for one reconciler run.
#[derive(Debug, Clone, Default)]
pub struct ReconcileStats {
    /// Full prefix reads, including the first.
    pub seeds: usize,

    /// Watch batches applied.
    pub batches: usize,

    /// Changes that altered the registry.
    pub changes_applied: usize,

    /// Changes that left the registry as it was (duplicates, unknown deletes).
    pub changes_unchanged: usize,

    /// Changes dropped because their key did not decode.
    pub malformed_keys: usize,

    /// Target file writes that failed.
    pub persist_failures: usize,

    /// Times the watch was lost and re-established.
    pub reconnects: usize,
}

impl ReconcileStats {
    pub fn summary(&self) -> String {
        format!(
            "Seeds: {}, Batches: {}, Applied: {}, Unchanged: {}, Malformed: {}, Write failures: {}, Reconnects: {}",
            self.seeds,
            self.batches,
            self.changes_applied,
            self.changes_unchanged,
            self.malformed_keys,
            self.persist_failures,
            self.reconnects
        )
    }
}

pub struct Reconciler<S> {
    store: S,
    target: TargetFile,
    config: ReconcilerConfig,
    registry: Registry,
    state: LoopState,
    stats: ReconcileStats,
}

impl<S: CoordinationStore> Reconciler<S> {
    pub fn new(store: S, target: TargetFile, config: ReconcilerConfig) -> Self {
        Self {
            store,
            target,
            config,
            registry: Registry::new(),
            state: LoopState::Connecting,
            stats: ReconcileStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    pub fn target(&self) -> &TargetFile {
        &self.target
    }

    /// Seed the registry from a full read, write the target file and stop.
    pub async fn run_once(&mut self) -> Result<()> {
        self.state = LoopState::Connecting;
        match self.seed().await {
            Ok(_) => {
                self.drain();
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Watch until `shutdown` resolves or the loop fails.
    ///
    /// Returns `Ok` after a clean drain. A batch that has already been received
    /// when shutdown fires is applied in full first.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut attempt: u32 = 0;

        loop {
            self.state = LoopState::Connecting;
            let connected = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                res = self.connect() => Some(res),
            };
            let Some(connected) = connected else {
                self.drain();
                return Ok(());
            };

            let lost = match connected {
                Ok(mut watch) => {
                    attempt = 0;
                    self.state = LoopState::Watching;
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = &mut shutdown => None,
                            res = watch.next_batch() => Some(res),
                        };
                        match next {
                            None => {
                                self.drain();
                                return Ok(());
                            }
                            Some(Ok(Some(batch))) => {
                                if let Err(err) = self.apply_batch(&batch) {
                                    return Err(self.fail(err));
                                }
                            }
                            Some(Ok(None)) => break Error::WatchClosed,
                            Some(Err(err)) if err.is_connection() => break err,
                            Some(Err(err)) => return Err(self.fail(err)),
                        }
                    }
                }
                Err(err) if err.is_connection() => err,
                Err(err) => return Err(self.fail(err)),
            };

            if attempt >= self.config.retry.max_retries {
                return Err(self.fail(Error::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(lost),
                }));
            }
            let delay = self.config.retry.delay(attempt);
            attempt += 1;
            self.stats.reconnects += 1;
            warn!(
                "lost watch on {}: {lost}; retry {attempt}/{} in {delay:?}",
                self.config.prefix, self.config.retry.max_retries
            );

            let interrupted = tokio::select! {
                biased;
                _ = &mut shutdown => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                self.drain();
                return Ok(());
            }
        }
    }

    /// Apply every change in `batch`, then rewrite the target file once.
    ///
    /// Fails only when the configured policy makes a malformed key or a write
    /// failure fatal.
    pub fn apply_batch(&mut self, batch: &[Change]) -> Result<()> {
        self.stats.batches += 1;
        let mut changed = 0usize;
        for change in batch {
            info!(
                "watch: {:?} {:?}: {:?}",
                change.kind,
                String::from_utf8_lossy(&change.key),
                String::from_utf8_lossy(&change.value)
            );
            if Self::fold(&self.config, &mut self.stats, &mut self.registry, change)? {
                changed += 1;
            }
        }
        debug!("batch of {} changes, {changed} applied", batch.len());
        self.persist()
    }

    /// Full read of the prefix. Replaces the registry wholesale, since deletes
    /// that happened while disconnected never reach the watch.
    async fn seed(&mut self) -> Result<i64> {
        let seed = self.store.load(&self.config.prefix).await?;
        self.stats.seeds += 1;

        let mut registry = Registry::new();
        for change in &seed.changes {
            Self::fold(&self.config, &mut self.stats, &mut registry, change)?;
        }
        info!(
            "seeded {} services ({} instances) from {} keys at revision {}",
            registry.service_count(),
            registry.instance_count(),
            seed.changes.len(),
            seed.revision
        );
        self.registry = registry;
        self.persist()?;
        Ok(seed.revision)
    }

    async fn connect(&mut self) -> Result<S::Watch> {
        let revision = self.seed().await?;
        self.store.watch(&self.config.prefix, revision + 1).await
    }

    fn fold(
        config: &ReconcilerConfig,
        stats: &mut ReconcileStats,
        registry: &mut Registry,
        change: &Change,
    ) -> Result<bool> {
        let key = match key::decode(&config.prefix, &change.key) {
            Ok(key) => key,
            Err(err) => {
                stats.malformed_keys += 1;
                return match config.malformed_keys {
                    ErrorPolicy::Skip => {
                        warn!("skipping {:?}: {err}", change.kind);
                        Ok(false)
                    }
                    ErrorPolicy::Fatal => Err(err),
                };
            }
        };

        let value = match change.kind {
            ChangeKind::Put => String::from_utf8_lossy(&change.value),
            ChangeKind::Delete => "".into(),
        };
        let changed = registry.apply(change.kind, &key, &value);
        if changed {
            stats.changes_applied += 1;
        } else {
            stats.changes_unchanged += 1;
        }
        Ok(changed)
    }

    fn persist(&mut self) -> Result<()> {
        match self.target.persist(self.registry.snapshot()) {
            Ok(groups) => {
                debug!("wrote {groups} target groups to {}", self.target.path().display());
                Ok(())
            }
            Err(err) => {
                self.stats.persist_failures += 1;
                match self.config.write_errors {
                    ErrorPolicy::Skip => {
                        error!("{err}; keeping previous target file, will retry on next batch");
                        Ok(())
                    }
                    ErrorPolicy::Fatal => Err(err),
                }
            }
        }
    }

    fn drain(&mut self) {
        self.state = LoopState::Draining;
        info!("reconciler stopped: {}", self.stats.summary());
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = LoopState::Failed;
        error!("reconciler failed: {err} ({})", self.stats.summary());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.prefix, "/services");
        assert_eq!(config.malformed_keys, ErrorPolicy::Skip);
        assert_eq!(config.write_errors, ErrorPolicy::Skip);
    }

    #[test]
    fn test_fold_skips_malformed_key() {
        let config = ReconcilerConfig::default();
        let mut stats = ReconcileStats::default();
        let mut registry = Registry::new();

        let changed =
            Reconciler::<NoStore>::fold(&config, &mut stats, &mut registry, &Change::put("/services/", "x"))
                .unwrap();
        assert!(!changed);
        assert!(registry.is_empty());
        assert_eq!(stats.malformed_keys, 1);
    }

    #[test]
    fn test_fold_fatal_policy_returns_error() {
        let mut config = ReconcilerConfig::default();
        config.malformed_keys = ErrorPolicy::Fatal;
        let mut stats = ReconcileStats::default();
        let mut registry = Registry::new();

        let err = Reconciler::<NoStore>::fold(
            &config,
            &mut stats,
            &mut registry,
            &Change::delete("/services/classroom"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedKey { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_summary() {
        let stats = ReconcileStats {
            batches: 3,
            changes_applied: 7,
            malformed_keys: 1,
            ..Default::default()
        };
        let summary = stats.summary();
        assert!(summary.contains("Batches: 3"));
        assert!(summary.contains("Applied: 7"));
        assert!(summary.contains("Malformed: 1"));
    }

    struct NoStore;
    struct NoWatch;

    impl WatchStream for NoWatch {
        async fn next_batch(&mut self) -> Result<Option<Vec<Change>>> {
            Ok(None)
        }
    }

    impl CoordinationStore for NoStore {
        type Watch = NoWatch;

        async fn load(&mut self, _prefix: &str) -> Result<crate::store::Seed> {
            Ok(Default::default())
        }

        async fn watch(&mut self, _prefix: &str, _start_revision: i64) -> Result<NoWatch> {
            Ok(NoWatch)
        }
    }
}
