use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CollectionCycleStatus {
    /// Zero until the first cycle starts.
    pub cycle_id: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Completion time of the most recent finished cycle, kept while the
    /// next one runs.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_completed_at: Option<OffsetDateTime>,
    pub in_progress: bool,
    pub meters_processed: usize,
    pub meters_failed: usize,
    pub errors: Vec<String>,
}

pub fn status_cell() -> (StatusWriter, StatusReader) {
    let (tx, rx) = watch::channel(CollectionCycleStatus::default());
    (StatusWriter { tx }, StatusReader { rx })
}

/// The single writer. Deliberately not `Clone`.
#[derive(Debug)]
pub struct StatusWriter {
    tx: watch::Sender<CollectionCycleStatus>,
}

impl StatusWriter {
    /// Publish a fresh in-progress status and return its cycle id.
    pub fn begin_cycle(&self) -> u64 {
        let mut cycle_id = 0;
        self.tx.send_modify(|s| {
            let next = CollectionCycleStatus {
                cycle_id: s.cycle_id + 1,
                started_at: Some(OffsetDateTime::now_utc()),
                completed_at: None,
                last_completed_at: s.last_completed_at,
                in_progress: true,
                meters_processed: 0,
                meters_failed: 0,
                errors: Vec::new(),
            };
            cycle_id = next.cycle_id;
            *s = next;
        });
        cycle_id
    }

    pub fn record_meter(&self, failed: bool, error: Option<String>) {
        self.tx.send_modify(|s| {
            s.meters_processed += 1;
            if failed {
                s.meters_failed += 1;
            }
            if let Some(e) = error {
                s.errors.push(e);
            }
        });
    }

    pub fn record_error(&self, error: String) {
        self.tx.send_modify(|s| s.errors.push(error));
    }

    /// Clear the in-progress flag. Must only be called once every meter and
    /// the persistence call of the cycle have returned.
    pub fn finish_cycle(&self) -> CollectionCycleStatus {
        self.tx.send_modify(|s| {
            let now = OffsetDateTime::now_utc();
            s.completed_at = Some(now);
            s.last_completed_at = Some(now);
            s.in_progress = false;
        });
        self.tx.borrow().clone()
    }
}

/// Read-only view of the status cell.
#[derive(Debug, Clone)]
pub struct StatusReader {
    rx: watch::Receiver<CollectionCycleStatus>,
}

impl StatusReader {
    pub fn current(&self) -> CollectionCycleStatus {
        self.rx.borrow().clone()
    }

    pub fn is_collecting(&self) -> bool {
        self.rx.borrow().in_progress
    }
}
