//! Mirror etcd service registrations into a Prometheus file_sd target file.
//!
//! Instances register as `<prefix>/<service>/<instance>` keys whose value is the
//! address to scrape. The [`Reconciler`] seeds a [`Registry`] from a full read
//! of the prefix, follows the watch from the next revision and rewrites the
//! target file after every batch of changes.

pub mod error;
pub mod etcd;
pub mod key;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod target;

pub use error::{Error, Result};
pub use etcd::{EtcdStore, StoreConfig};
pub use key::ServiceKey;
pub use reconcile::{ErrorPolicy, LoopState, ReconcileStats, Reconciler, ReconcilerConfig, RetryPolicy};
pub use registry::Registry;
pub use store::{Change, ChangeKind, CoordinationStore, Seed, WatchStream};
pub use target::{TargetFile, TargetGroup};
