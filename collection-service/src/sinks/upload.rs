use meter_client::{
    db::reading_queries::{self, ReadingCursor},
    domain::StoredReading,
};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("failed to query readings: {0}")]
    Query(String),
    #[error("upload request failed: {0}")]
    Http(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub uploaded: usize,
    pub batches: usize,
    /// `recorded_at` of the last reading accepted by the collector.
    #[serde(with = "time::serde::rfc3339::option")]
    pub watermark: Option<OffsetDateTime>,
}

#[async_trait::async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self) -> Result<UploadReport, UploadError>;
}

#[derive(Debug, Serialize)]
struct UploadRecord<'a> {
    event_id: String,
    tenant_id: i64,
    meter_id: i64,
    meter_element_id: i64,
    data_point: &'a str,
    value: Option<f64>,
    unit: &'a str,
    quality: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
}

#[derive(Debug, Serialize)]
struct UploadBody<'a> {
    records: Vec<UploadRecord<'a>>,
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Stable id of a reading's natural key, so the receiver can drop
/// re-uploads.
pub(crate) fn event_id(r: &StoredReading) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&r.ts.unix_timestamp_nanos().to_le_bytes());
    h.update(&r.meter_id.to_le_bytes());
    h.update(&r.meter_element_id.to_le_bytes());
    hash_str(&mut h, &r.data_point);
    h.finalize().to_hex().to_string()
}

fn body(rows: &[StoredReading]) -> UploadBody<'_> {
    UploadBody {
        records: rows
            .iter()
            .map(|r| UploadRecord {
                event_id: event_id(r),
                tenant_id: r.tenant_id,
                meter_id: r.meter_id,
                meter_element_id: r.meter_element_id,
                data_point: &r.data_point,
                value: r.value,
                unit: &r.unit,
                quality: &r.quality,
                ts: r.ts,
            })
            .collect(),
    }
}

/// Posts readings recorded since the last successful upload as JSON.
///
/// The cursor lives in memory and only advances after the collector
/// accepts a batch; after a restart everything is offered again and the
/// receiver deduplicates on `event_id`.
pub struct HttpUploader {
    pool: PgPool,
    client: reqwest::Client,
    url: Option<String>,
    batch_limit: i64,
    cursor: Mutex<ReadingCursor>,
}

impl HttpUploader {
    pub fn new(pool: PgPool, url: Option<String>, batch_limit: i64) -> Self {
        Self {
            pool,
            client: reqwest::Client::new(),
            url,
            batch_limit: batch_limit.max(1),
            cursor: Mutex::new(ReadingCursor::start()),
        }
    }
}

#[async_trait::async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self) -> Result<UploadReport, UploadError> {
        let Some(url) = self.url.as_deref() else {
            tracing::info!("no upload url configured, skipping upload");
            return Ok(UploadReport {
                uploaded: 0,
                batches: 0,
                watermark: None,
            });
        };

        // one upload at a time; overlapping triggers wait here
        let mut cursor = self.cursor.lock().await;
        let mut report = UploadReport {
            uploaded: 0,
            batches: 0,
            watermark: None,
        };

        loop {
            let rows = reading_queries::readings_after(&self.pool, &cursor, self.batch_limit)
                .await
                .map_err(|e| UploadError::Query(format!("{e:#}")))?;
            let Some(last) = rows.last() else {
                break;
            };

            let resp = self
                .client
                .post(url)
                .json(&body(&rows))
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    metrics::counter!("upload_failures_total").increment(1);
                    UploadError::Http(e.to_string())
                })?;
            tracing::debug!(status = %resp.status(), rows = rows.len(), "upload batch accepted");

            *cursor = ReadingCursor::after(last);
            report.uploaded += rows.len();
            report.batches += 1;
            report.watermark = Some(last.recorded_at);
            metrics::counter!("readings_uploaded_total").increment(rows.len() as u64);

            if (rows.len() as i64) < self.batch_limit {
                break;
            }
        }

        tracing::info!(uploaded = report.uploaded, batches = report.batches, "upload finished");
        Ok(report)
    }
}
