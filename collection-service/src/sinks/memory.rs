use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use meter_client::domain::PendingReading;
use time::OffsetDateTime;

use super::{PersistOutcome, PersistenceError, ReadingStore};
use crate::transform;

type Key = (i64, i64, String, OffsetDateTime);

#[derive(Default)]
pub(crate) struct MemoryReadingStore {
    rows: Mutex<BTreeMap<Key, PendingReading>>,
    pub(crate) fail: AtomicBool,
    pub(crate) calls: AtomicUsize,
    pub(crate) delay: Mutex<Option<Duration>>,
}

impl MemoryReadingStore {
    pub(crate) fn rows(&self) -> Vec<PendingReading> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ReadingStore for MemoryReadingStore {
    async fn persist_readings(&self, batch: &[PendingReading]) -> Vec<PersistOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return batch
                .iter()
                .map(|_| Err(PersistenceError::Database("connection reset".to_string())))
                .collect();
        }

        let mut rows = self.rows.lock().unwrap();
        batch
            .iter()
            .map(|r| {
                transform::check(r)?;
                let (m, e, p, ts) = r.natural_key();
                rows.insert((m, e, p.to_string(), ts), r.clone());
                Ok(())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_client::domain::{Quality, ReadSource};
    use time::macros::datetime;

    fn reading(element_id: i64, value: f64) -> PendingReading {
        PendingReading {
            tenant_id: 1,
            meter_id: 42,
            element_id,
            data_point: "energy_import".to_string(),
            value: Some(value),
            unit: "kWh".to_string(),
            quality: Quality::Good,
            ts: datetime!(2024-05-01 12:00:00 UTC),
            source: ReadSource::Batch,
        }
    }

    #[tokio::test]
    async fn resubmitting_a_reading_does_not_duplicate_rows() {
        let store = MemoryReadingStore::default();
        let batch = vec![reading(1, 10.0)];

        assert!(store.persist_readings(&batch).await.iter().all(Result::is_ok));
        assert!(store.persist_readings(&batch).await.iter().all(Result::is_ok));

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn elements_sharing_a_meter_id_are_kept_apart() {
        let store = MemoryReadingStore::default();
        store
            .persist_readings(&[reading(1, 10.0), reading(2, 20.0)])
            .await;

        let rows = store.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, Some(10.0));
        assert_eq!(rows[1].value, Some(20.0));
    }
}
