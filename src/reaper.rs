use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::session::SessionStore;

/// Background task that periodically drops expired sessions.
pub async fn run_session_reaper(sessions: Arc<dyn SessionStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let removed = sessions.purge_expired(Utc::now());
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "reaped expired sessions");
        }
    }
}

/// Background task that rewrites the WAL once enough commits have piled up
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran.
async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            warn!(error = %e, "WAL compaction failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::session::{InMemorySessionStore, Session};
    use chrono::TimeDelta;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            bcrypt_cost: crate::limits::MIN_BCRYPT_COST,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("compact_threshold.wal");
        let engine = Engine::new(path.clone(), test_config()).unwrap();

        engine.create_provider("Ada", "Lovelace").await.unwrap();
        engine.create_provider("Alan", "Turing").await.unwrap();
        assert!(!compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        engine.create_provider("Grace", "Hopper").await.unwrap();
        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        drop(engine);

        let reopened = Engine::new(path, test_config()).unwrap();
        assert_eq!(reopened.list_providers().len(), 3);
    }

    #[tokio::test]
    async fn session_reaper_purges_expired() {
        let store = Arc::new(InMemorySessionStore::new());
        let now = Utc::now();
        store.set(Session::issue("old".into(), TimeDelta::seconds(-1), now));
        store.set(Session::issue("fresh".into(), TimeDelta::hours(1), now));

        let task = tokio::spawn(run_session_reaper(store.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();

        assert_eq!(store.len(), 1);
    }
}
