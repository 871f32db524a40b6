use std::{collections::HashMap, time::Duration};

use meter_client::{
    db::reading_queries,
    domain::{MeterKey, PendingReading, Quality},
};
use sqlx::postgres::PgPool;
use time::OffsetDateTime;

use super::{PersistOutcome, PersistenceError, ReadingStore};
use crate::transform;

pub struct PgReadingStore {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PgReadingStore {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    async fn flush_batch(&self, batch: &[PendingReading]) -> Result<(), PersistenceError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match reading_queries::upsert_readings(&self.pool, batch).await {
                Ok(_) => {
                    metrics::counter!("readings_persisted_total").increment(batch.len() as u64);
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "reading upsert failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "reading upsert failed, giving up");
                    metrics::counter!("reading_sink_errors_total").increment(1);
                    return Err(PersistenceError::Database(e.to_string()));
                }
            }
        }
    }
}

/// Indices of the last occurrence of every natural key, in first-seen order.
///
/// A single multi-row upsert cannot touch the same row twice.
pub(crate) fn dedupe_by_natural_key(batch: &[PendingReading], candidates: &[usize]) -> (Vec<usize>, HashMap<usize, usize>) {
    let mut position: HashMap<(i64, i64, &str, OffsetDateTime), usize> = HashMap::new();
    let mut kept: Vec<usize> = Vec::new();
    let mut alias: HashMap<usize, usize> = HashMap::new();

    for &idx in candidates {
        let key = batch[idx].natural_key();
        match position.get(&key) {
            Some(&slot) => {
                alias.insert(kept[slot], idx);
                kept[slot] = idx;
            }
            None => {
                position.insert(key, kept.len());
                kept.push(idx);
            }
        }
    }

    // resolve chains so every replaced index points at the kept one
    let resolved = alias
        .keys()
        .map(|&from| {
            let mut to = alias[&from];
            while let Some(&next) = alias.get(&to) {
                to = next;
            }
            (from, to)
        })
        .collect();

    (kept, resolved)
}

#[async_trait::async_trait]
impl ReadingStore for PgReadingStore {
    async fn persist_readings(&self, batch: &[PendingReading]) -> Vec<PersistOutcome> {
        let mut outcomes: Vec<PersistOutcome> = batch.iter().map(transform::check).collect();

        let valid: Vec<usize> = (0..batch.len()).filter(|&i| outcomes[i].is_ok()).collect();
        let (kept, aliases) = dedupe_by_natural_key(batch, &valid);

        for chunk in kept.chunks(self.batch_size) {
            let rows: Vec<PendingReading> = chunk.iter().map(|&i| batch[i].clone()).collect();
            if let Err(e) = self.flush_batch(&rows).await {
                for &i in chunk {
                    outcomes[i] = Err(e.clone());
                }
            }
        }
        for (from, to) in aliases {
            outcomes[from] = outcomes[to].clone();
        }

        let mut touched: Vec<MeterKey> = batch
            .iter()
            .zip(&outcomes)
            .filter(|(r, o)| o.is_ok() && r.quality == Quality::Good)
            .map(|(r, _)| r.meter_key())
            .collect();
        touched.sort();
        touched.dedup();
        if let Err(e) =
            reading_queries::touch_last_read(&self.pool, &touched, OffsetDateTime::now_utc()).await
        {
            tracing::warn!(error = %e, meters = touched.len(), "failed to update last read time");
        }

        outcomes
    }
}
