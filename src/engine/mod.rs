mod credentials;
mod error;
mod queries;
mod reservations;
mod slots;
mod store;
mod txn;

pub use error::{ConstraintViolation, EngineError, NotFound, SchedulingConflict};
use store::{CheckFailure, Store};

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use crate::model::*;
use crate::observability::{TXN_COMMITS_TOTAL, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use txn::{RowLocks, Txn};

/// Tunables for lock waits, retries and credential hashing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a transaction waits for one row lock before counting as contention.
    pub lock_timeout: Duration,
    pub txn_max_attempts: u32,
    /// Backoff before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
    pub bcrypt_cost: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            txn_max_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first Append, drains whatever else is already queued,
/// then writes the whole batch with one fsync and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            // Flush what we have before handling it
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

/// A failed batch is rolled back inside `append_batch`, so every sender
/// told `Err` has nothing on disk.
fn flush_and_respond(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let (commits, senders): (Vec<Commit>, Vec<_>) = batch.into_iter().unzip();

    let flush_start = std::time::Instant::now();
    let result = wal.append_batch(&commits);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());

    for tx in senders {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let _ = response.send(wal.compact(&snapshot));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => flush_and_respond(wal, vec![(commit, response)]),
    }
}

/// The booking consistency engine: row store, WAL, row locks and the
/// transactional operations built on them. Shared as `Arc<Engine>`.
pub struct Engine {
    pub(super) store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared, compaction exclusively, so a snapshot never
    /// misses a commit that was logged to the old file.
    commit_gate: RwLock<()>,
    pub(super) provider_locks: RowLocks<ProviderId>,
    pub(super) consumer_locks: RowLocks<String>,
    pub(super) slot_locks: RowLocks<SlotId>,
    pub(super) config: EngineConfig,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the background writer.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let (wal, commits) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        for commit in &commits {
            store.apply_commit(&commit.changes);
        }
        info!(
            path = %wal_path.display(),
            commits = commits.len(),
            providers = store.provider_count(),
            reservations = store.reservation_count(),
            "replayed WAL"
        );

        Ok(Self {
            store,
            wal_tx,
            commit_gate: RwLock::new(()),
            provider_locks: RowLocks::new(),
            consumer_locks: RowLocks::new(),
            slot_locks: RowLocks::new(),
            config,
        })
    }

    pub(super) fn begin(&self) -> Txn {
        Txn::new()
    }

    /// Check, log and apply a transaction's staged changes as one unit.
    /// On any error nothing reaches the WAL or the store.
    pub(super) async fn commit(&self, txn: Txn) -> Result<(), EngineError> {
        let (changes, guards) = txn.into_parts();
        if changes.is_empty() {
            return Ok(());
        }
        let _gate = self.commit_gate.read().await;

        self.store.check(&changes).map_err(|failure| match failure {
            CheckFailure::DuplicateUsername(u) => {
                EngineError::from(ConstraintViolation::DuplicateUsername(u))
            }
            CheckFailure::Integrity(msg) => EngineError::StorageFailure(msg),
        })?;

        let commit = Commit { changes };
        self.wal_append(commit.clone()).await?;
        self.store.apply_commit(&commit.changes);
        metrics::counter!(TXN_COMMITS_TOTAL).increment(1);
        drop(guards);
        Ok(())
    }

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| EngineError::storage("WAL writer shut down"))?;
        rx.await
            .map_err(|_| EngineError::storage("WAL writer dropped response"))?
            .map_err(EngineError::storage)
    }

    /// Rewrite the WAL as a single snapshot of the current rows.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let snapshot = self.store.snapshot();
        let rows = snapshot.changes.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::storage("WAL writer shut down"))?;
        rx.await
            .map_err(|_| EngineError::storage("WAL writer dropped response"))?
            .map_err(EngineError::storage)?;
        debug!(rows, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
