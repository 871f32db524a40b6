pub mod postgres;
pub mod upload;
#[cfg(test)]
pub(crate) mod memory;

use meter_client::domain::PendingReading;

pub use postgres::PgReadingStore;
pub use upload::{HttpUploader, UploadError, UploadReport, Uploader};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("reading rejected: {0}")]
    Rejected(String),
    #[error("database error: {0}")]
    Database(String),
}

/// Per-item result of a persistence call, aligned with the submitted batch.
pub type PersistOutcome = Result<(), PersistenceError>;

/// Storage collaborator for collected readings.
///
/// Implementations must be idempotent on the natural key
/// `(meter_id, meter_element_id, data_point, ts)`.
#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync {
    async fn persist_readings(&self, batch: &[PendingReading]) -> Vec<PersistOutcome>;
}
