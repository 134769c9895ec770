use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task: rewrite the WAL once enough appends have piled up, and
/// drop notification channels nobody listens to any more.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
        engine.notify.prune();
    }
}

/// Compact when at least `threshold` appends happened since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulingConfig;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("citystage_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), SchedulingConfig::default()).unwrap();

        let lid = Ulid::new();
        engine.create_location(lid, "Невский пр., 28".into(), String::new()).await.unwrap();
        for i in 0..4 {
            engine
                .update_location_address(lid, format!("Невский пр., {}", 30 + i))
                .await
                .unwrap();
        }

        assert!(!compact_if_due(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let replayed = Engine::new(path, Arc::new(NotifyHub::new()), SchedulingConfig::default()).unwrap();
        assert_eq!(replayed.get_location(&lid).unwrap().address, "Невский пр., 33");
    }
}
