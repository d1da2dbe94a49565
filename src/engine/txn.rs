use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;

use crate::model::Change;
use crate::observability::{TXN_ABORTS_TOTAL, TXN_RETRIES_TOTAL};

use super::{Engine, EngineError};

/// Lock table: one `RwLock<()>` per row key, created on first use.
/// Writers take the row exclusively, readers share it.
pub(crate) struct RowLocks<K> {
    rows: DashMap<K, Arc<RwLock<()>>>,
}

impl<K: Eq + Hash + Clone> RowLocks<K> {
    pub fn new() -> Self {
        Self { rows: DashMap::new() }
    }

    fn row(&self, key: &K) -> Arc<RwLock<()>> {
        // Clone the Arc out so the shard lock is released before awaiting.
        self.rows.entry(key.clone()).or_default().value().clone()
    }

    pub async fn write(&self, key: &K, timeout: Duration) -> Result<RowGuard, EngineError> {
        tokio::time::timeout(timeout, self.row(key).write_owned())
            .await
            .map(RowGuard::Exclusive)
            .map_err(|_| EngineError::Contention)
    }

    pub async fn read(&self, key: &K, timeout: Duration) -> Result<RowGuard, EngineError> {
        tokio::time::timeout(timeout, self.row(key).read_owned())
            .await
            .map(RowGuard::Shared)
            .map_err(|_| EngineError::Contention)
    }
}

pub(crate) enum RowGuard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// An open transaction: the row locks it holds and the changes it has staged.
/// Dropping it without [`Engine::commit`] rolls back, since nothing staged
/// has touched the store or the WAL.
pub(crate) struct Txn {
    changes: Vec<Change>,
    guards: Vec<RowGuard>,
}

impl Txn {
    pub fn new() -> Self {
        Self { changes: Vec::new(), guards: Vec::new() }
    }

    /// Keep a row lock until the transaction ends.
    pub fn hold(&mut self, guard: RowGuard) {
        self.guards.push(guard);
    }

    pub fn stage(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub(super) fn into_parts(self) -> (Vec<Change>, Vec<RowGuard>) {
        (self.changes, self.guards)
    }
}

impl Engine {
    /// Run a transaction, re-executing it from scratch while it loses row
    /// lock races. Exhausted attempts surface as `StorageFailure`.
    pub(super) async fn with_retry<T, F, Fut>(&self, op: &'static str, mut run: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let max_attempts = self.config.txn_max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match run().await {
                Ok(v) => return Ok(v),
                Err(EngineError::Contention) if attempt < max_attempts => {
                    metrics::counter!(TXN_RETRIES_TOTAL, "op" => op).increment(1);
                    warn!(op, attempt, "row lock contention, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(EngineError::Contention) => {
                    metrics::counter!(TXN_ABORTS_TOTAL, "op" => op).increment(1);
                    warn!(op, attempt, "giving up after repeated lock contention");
                    return Err(EngineError::StorageFailure(format!(
                        "{op}: row lock contention after {attempt} attempts"
                    )));
                }
                Err(e) => {
                    metrics::counter!(TXN_ABORTS_TOTAL, "op" => op).increment(1);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_share_writers_exclude() {
        let locks: RowLocks<i64> = RowLocks::new();
        let t = Duration::from_millis(50);

        let r1 = locks.read(&1, t).await.unwrap();
        let _r2 = locks.read(&1, t).await.unwrap();
        assert!(matches!(locks.write(&1, t).await, Err(EngineError::Contention)));

        drop(r1);
        drop(_r2);
        let _w = locks.write(&1, t).await.unwrap();
        assert!(matches!(locks.read(&1, t).await, Err(EngineError::Contention)));
        // Other keys are independent
        assert!(locks.write(&2, t).await.is_ok());
    }

    #[test]
    fn staged_changes_come_back_in_order() {
        let mut txn = Txn::new();
        txn.stage(Change::SlotBookedSet { slot_id: 1, booked: false });
        txn.stage(Change::ReservationDeleted { id: 1 });
        let (changes, guards) = txn.into_parts();
        assert_eq!(changes[1], Change::ReservationDeleted { id: 1 });
        assert!(guards.is_empty());
    }
}
