#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etcd_sd::{Change, CoordinationStore, Error, Result, Seed, WatchStream};
use tokio::sync::{mpsc, watch};

pub type BatchSender = mpsc::UnboundedSender<Result<Vec<Change>>>;

/// Scripted store: each connect pops the next seed and the next watch.
/// With no watch left, `watch` fails like an unreachable cluster.
pub struct MemoryStore {
    seeds: VecDeque<Seed>,
    watches: VecDeque<mpsc::UnboundedReceiver<Result<Vec<Change>>>>,
    start_revisions: Arc<Mutex<Vec<i64>>>,
    polls: Arc<watch::Sender<usize>>,
}

pub struct MemoryHandle {
    pub start_revisions: Arc<Mutex<Vec<i64>>>,
    pub polls: watch::Receiver<usize>,
}

impl MemoryHandle {
    /// Wait until the reconciler has asked for `n` batches in total, which
    /// means every batch returned before that has been applied and persisted.
    pub async fn wait_for_polls(&mut self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while *self.polls.borrow_and_update() < n {
                self.polls.changed().await.expect("store dropped");
            }
        })
        .await
        .expect("reconciler did not poll in time");
    }
}

impl MemoryStore {
    pub fn new() -> (Self, MemoryHandle) {
        let start_revisions = Arc::new(Mutex::new(Vec::new()));
        let (polls_tx, polls_rx) = watch::channel(0);
        let store = Self {
            seeds: VecDeque::new(),
            watches: VecDeque::new(),
            start_revisions: Arc::clone(&start_revisions),
            polls: Arc::new(polls_tx),
        };
        let handle = MemoryHandle {
            start_revisions,
            polls: polls_rx,
        };
        (store, handle)
    }

    pub fn push_seed(&mut self, revision: i64, changes: Vec<Change>) {
        self.seeds.push_back(Seed { changes, revision });
    }

    pub fn push_watch(&mut self) -> BatchSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watches.push_back(rx);
        tx
    }
}

impl CoordinationStore for MemoryStore {
    type Watch = MemoryWatch;

    async fn load(&mut self, _prefix: &str) -> Result<Seed> {
        Ok(self.seeds.pop_front().unwrap_or_default())
    }

    async fn watch(&mut self, _prefix: &str, start_revision: i64) -> Result<MemoryWatch> {
        self.start_revisions.lock().unwrap().push(start_revision);
        let rx = self.watches.pop_front().ok_or(Error::WatchClosed)?;
        Ok(MemoryWatch {
            rx,
            polls: Arc::clone(&self.polls),
        })
    }
}

pub struct MemoryWatch {
    rx: mpsc::UnboundedReceiver<Result<Vec<Change>>>,
    polls: Arc<watch::Sender<usize>>,
}

impl WatchStream for MemoryWatch {
    async fn next_batch(&mut self) -> Result<Option<Vec<Change>>> {
        self.polls.send_modify(|n| *n += 1);
        self.rx.recv().await.transpose()
    }
}

pub fn put(key: &str, value: &str) -> Change {
    Change::put(key, value)
}

pub fn delete(key: &str) -> Change {
    Change::delete(key)
}
