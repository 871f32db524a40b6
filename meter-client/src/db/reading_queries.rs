use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{MeterKey, PendingReading, StoredReading};

/// Insert readings, updating rows that already exist for the natural key
/// `(meter_id, meter_element_id, data_point, ts)`. Safe to repeat.
pub async fn upsert_readings(pool: &PgPool, batch: &[PendingReading]) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO meter_readings (tenant_id, meter_id, meter_element_id, data_point, value, unit, quality, ts, source) ",
    );

    builder.push_values(batch, |mut b, r| {
        b.push_bind(r.tenant_id)
            .push_bind(r.meter_id)
            .push_bind(r.element_id)
            .push_bind(&r.data_point)
            .push_bind(r.value)
            .push_bind(&r.unit)
            .push_bind(r.quality.as_str())
            .push_bind(r.ts)
            .push_bind(r.source.as_str());
    });

    builder.push(
        r#"
        ON CONFLICT (meter_id, meter_element_id, data_point, ts) DO UPDATE SET
            value = EXCLUDED.value,
            unit = EXCLUDED.unit,
            quality = EXCLUDED.quality,
            source = EXCLUDED.source,
            recorded_at = now()
        "#,
    );

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Record the last successful read time of meter elements.
pub async fn touch_last_read(pool: &PgPool, keys: &[MeterKey], at: OffsetDateTime) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::<Postgres>::new("UPDATE meter_elements SET last_read_at = ");
    builder.push_bind(at);
    builder.push(" WHERE (meter_id, element_id) IN ");
    builder.push_tuples(keys, |mut b, k| {
        b.push_bind(k.meter_id).push_bind(k.element_id);
    });

    builder.build().execute(pool).await?;
    Ok(())
}

/// Keyset position in the `meter_readings` upload order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingCursor {
    pub recorded_at: OffsetDateTime,
    pub meter_id: i64,
    pub meter_element_id: i64,
    pub data_point: String,
    pub ts: OffsetDateTime,
}

impl ReadingCursor {
    /// Position before every row.
    pub fn start() -> Self {
        Self {
            recorded_at: OffsetDateTime::UNIX_EPOCH,
            meter_id: i64::MIN,
            meter_element_id: i64::MIN,
            data_point: String::new(),
            ts: OffsetDateTime::UNIX_EPOCH,
        }
    }

    pub fn after(row: &StoredReading) -> Self {
        Self {
            recorded_at: row.recorded_at,
            meter_id: row.meter_id,
            meter_element_id: row.meter_element_id,
            data_point: row.data_point.clone(),
            ts: row.ts,
        }
    }
}

/// Up to `limit` readings strictly after `cursor` in
/// `(recorded_at, meter_id, meter_element_id, data_point, ts)` order.
pub async fn readings_after(
    pool: &PgPool,
    cursor: &ReadingCursor,
    limit: i64,
) -> Result<Vec<StoredReading>> {
    let rows = sqlx::query_as::<_, StoredReading>(
        r#"
        SELECT
            tenant_id,
            meter_id,
            meter_element_id,
            data_point,
            value,
            unit,
            quality,
            ts,
            recorded_at
        FROM meter_readings
        WHERE (recorded_at, meter_id, meter_element_id, data_point, ts) > ($1, $2, $3, $4, $5)
        ORDER BY recorded_at, meter_id, meter_element_id, data_point, ts
        LIMIT $6
        "#,
    )
    .bind(cursor.recorded_at)
    .bind(cursor.meter_id)
    .bind(cursor.meter_element_id)
    .bind(&cursor.data_point)
    .bind(cursor.ts)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
