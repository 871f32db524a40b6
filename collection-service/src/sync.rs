use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    catalog::Catalog,
    status::{CollectionCycleStatus, StatusReader},
};

pub const COLLECTION_IN_PROGRESS: &str = "collection in progress";
pub const SYNC_ALREADY_RUNNING: &str = "sync already running";
const SKIP_HISTORY: usize = 100;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("remote sync request failed: {0}")]
    Request(String),
    #[error("remote sync rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Scheduled,
    Manual,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => f.write_str("scheduled"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSkipRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub mode: SyncMode,
    pub reason: String,
    pub status: CollectionCycleStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub detail: String,
    pub catalog_reloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped(SyncSkipRecord),
    Executed(SyncReport),
    Failed { mode: SyncMode, error: String },
}

/// The external synchronization collaborator.
#[async_trait::async_trait]
pub trait RemoteSync: Send + Sync {
    /// Run one pass and describe what happened.
    async fn run_remote_sync(&self) -> Result<String, SyncError>;
}

/// POSTs to a remote endpoint that performs the synchronization.
pub struct HttpRemoteSync {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpRemoteSync {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait::async_trait]
impl RemoteSync for HttpRemoteSync {
    async fn run_remote_sync(&self) -> Result<String, SyncError> {
        let Some(url) = self.url.as_deref() else {
            return Ok("no remote sync url configured".to_string());
        };

        let resp = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| SyncError::Request(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(format!("{status}: {body}"))
    }
}

/// Never runs a sync while a collection cycle is in progress; such a
/// trigger is recorded as skipped and nothing is queued.
pub struct SyncCoordinator {
    status: StatusReader,
    remote: Arc<dyn RemoteSync>,
    catalog: Arc<Catalog>,
    running: tokio::sync::Mutex<()>,
    skips: Mutex<VecDeque<SyncSkipRecord>>,
}

impl SyncCoordinator {
    pub fn new(status: StatusReader, remote: Arc<dyn RemoteSync>, catalog: Arc<Catalog>) -> Self {
        Self {
            status,
            remote,
            catalog,
            running: tokio::sync::Mutex::new(()),
            skips: Mutex::new(VecDeque::new()),
        }
    }

    fn skip(&self, mode: SyncMode, reason: &str, status: CollectionCycleStatus) -> SyncOutcome {
        let record = SyncSkipRecord {
            ts: OffsetDateTime::now_utc(),
            mode,
            reason: reason.to_string(),
            status,
        };
        tracing::info!(
            mode = %mode,
            reason,
            cycle_id = record.status.cycle_id,
            "remote sync skipped"
        );
        metrics::counter!("sync_skipped_total").increment(1);

        let mut skips = self.skips.lock().unwrap_or_else(|p| p.into_inner());
        if skips.len() == SKIP_HISTORY {
            skips.pop_front();
        }
        skips.push_back(record.clone());
        SyncOutcome::Skipped(record)
    }

    /// Run a sync pass unless a collection cycle is in progress.
    ///
    /// Scheduled and manual triggers are checked the same way; a skip is
    /// final and nothing is retried.
    pub async fn trigger(&self, mode: SyncMode) -> SyncOutcome {
        let status = self.status.current();
        if status.in_progress {
            return self.skip(mode, COLLECTION_IN_PROGRESS, status);
        }
        let Ok(_guard) = self.running.try_lock() else {
            return self.skip(mode, SYNC_ALREADY_RUNNING, status);
        };

        let started_at = OffsetDateTime::now_utc();
        tracing::info!(mode = %mode, "remote sync started");
        match self.remote.run_remote_sync().await {
            Ok(detail) => {
                let catalog_reloaded = self.catalog.reload().await;
                metrics::counter!("sync_executed_total").increment(1);
                tracing::info!(mode = %mode, catalog_reloaded, detail = %detail, "remote sync finished");
                SyncOutcome::Executed(SyncReport {
                    mode,
                    started_at,
                    finished_at: OffsetDateTime::now_utc(),
                    detail,
                    catalog_reloaded,
                })
            }
            Err(e) => {
                tracing::warn!(mode = %mode, error = %e, "remote sync failed");
                metrics::counter!("sync_failed_total").increment(1);
                SyncOutcome::Failed {
                    mode,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Skip records, newest last.
    pub fn skip_history(&self) -> Vec<SyncSkipRecord> {
        self.skips
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use crate::{catalog::tests::MemoryCatalogStore, status::status_cell};

    /// Counts calls; optionally slow or failing.
    #[derive(Default)]
    pub(crate) struct ScriptedSync {
        pub(crate) calls: AtomicUsize,
        pub(crate) latency: Option<Duration>,
        pub(crate) fail: bool,
    }

    #[async_trait::async_trait]
    impl RemoteSync for ScriptedSync {
        async fn run_remote_sync(&self) -> Result<String, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.latency {
                tokio::time::sleep(d).await;
            }
            if self.fail {
                return Err(SyncError::Rejected {
                    status: 503,
                    body: "busy".to_string(),
                });
            }
            Ok("synced".to_string())
        }
    }

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::new(Arc::new(MemoryCatalogStore::default())))
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_during_cycle_is_skipped_and_next_one_runs() {
        let (writer, reader) = status_cell();
        let remote = Arc::new(ScriptedSync::default());
        let coordinator = SyncCoordinator::new(reader, remote.clone(), catalog());

        writer.begin_cycle();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let first = coordinator.trigger(SyncMode::Scheduled).await;

        let SyncOutcome::Skipped(record) = &first else {
            panic!("expected a skip, got {first:?}");
        };
        assert_eq!(record.reason, COLLECTION_IN_PROGRESS);
        assert!(record.status.in_progress);
        assert_eq!(record.status.cycle_id, 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        writer.finish_cycle();

        // nothing was queued by the skip
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

        let second = coordinator.trigger(SyncMode::Scheduled).await;
        assert!(matches!(second, SyncOutcome::Executed(ref r) if r.detail == "synced"));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.skip_history().len(), 1);
    }

    #[tokio::test]
    async fn manual_trigger_is_checked_like_a_scheduled_one() {
        let (writer, reader) = status_cell();
        let remote = Arc::new(ScriptedSync::default());
        let coordinator = SyncCoordinator::new(reader, remote.clone(), catalog());

        writer.begin_cycle();
        let outcome = coordinator.trigger(SyncMode::Manual).await;

        assert!(matches!(outcome, SyncOutcome::Skipped(ref r) if r.mode == SyncMode::Manual));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_sync_is_reported_not_retried() {
        let (_writer, reader) = status_cell();
        let remote = Arc::new(ScriptedSync {
            fail: true,
            ..Default::default()
        });
        let coordinator = SyncCoordinator::new(reader, remote.clone(), catalog());

        let outcome = coordinator.trigger(SyncMode::Scheduled).await;

        assert!(matches!(outcome, SyncOutcome::Failed { ref error, .. } if error.contains("503")));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.skip_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_sync_is_skipped() {
        let (_writer, reader) = status_cell();
        let remote = Arc::new(ScriptedSync {
            latency: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let coordinator = SyncCoordinator::new(reader, remote.clone(), catalog());

        let (a, b) = tokio::join!(coordinator.trigger(SyncMode::Scheduled), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            coordinator.trigger(SyncMode::Manual).await
        });

        assert!(matches!(a, SyncOutcome::Executed(_)));
        assert!(matches!(b, SyncOutcome::Skipped(ref r) if r.reason == SYNC_ALREADY_RUNNING));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn skip_history_is_bounded() {
        let (_writer, reader) = status_cell();
        let coordinator = SyncCoordinator::new(reader, Arc::new(ScriptedSync::default()), catalog());
        for _ in 0..SKIP_HISTORY + 5 {
            coordinator.skip(SyncMode::Scheduled, COLLECTION_IN_PROGRESS, CollectionCycleStatus::default());
        }
        assert_eq!(coordinator.skip_history().len(), SKIP_HISTORY);
    }

    #[test]
    fn outcome_serializes_with_a_tag() {
        let outcome = SyncOutcome::Failed {
            mode: SyncMode::Manual,
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["mode"], "manual");
    }
}
