use meter_client::domain::{PendingReading, Quality};
use time::macros::datetime;

use crate::sinks::PersistenceError;

/// Pure validation of a `PendingReading` before it is persisted.
///
/// Rules:
/// - a present value must be finite.
/// - a `good` reading must carry a value.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_reading(r: &PendingReading) -> Result<(), PersistenceError> {
    if let Some(v) = r.value {
        if !v.is_finite() {
            return Err(PersistenceError::Rejected(format!(
                "{}: value must be finite",
                r.data_point
            )));
        }
    }

    if r.quality == Quality::Good && r.value.is_none() {
        return Err(PersistenceError::Rejected(format!(
            "{}: good reading without a value",
            r.data_point
        )));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if r.ts < min_ts || r.ts > max_ts {
        return Err(PersistenceError::Rejected(format!(
            "{}: timestamp out of allowed range",
            r.data_point
        )));
    }

    Ok(())
}

/// Validate and count rejections.
pub fn check(r: &PendingReading) -> Result<(), PersistenceError> {
    validate_reading(r).inspect_err(|_| {
        metrics::counter!("validation_reading_rejected_total").increment(1);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_client::domain::ReadSource;

    fn reading(value: Option<f64>, quality: Quality) -> PendingReading {
        PendingReading {
            tenant_id: 1,
            meter_id: 1,
            element_id: 1,
            data_point: "energy_import".to_string(),
            value,
            unit: "kWh".to_string(),
            quality,
            ts: datetime!(2024-01-01 00:00:00 UTC),
            source: ReadSource::Batch,
        }
    }

    #[test]
    fn accepts_good_and_questionable_readings() {
        assert!(validate_reading(&reading(Some(1.0), Quality::Good)).is_ok());
        assert!(validate_reading(&reading(None, Quality::Questionable)).is_ok());
    }

    #[test]
    fn rejects_non_finite_and_valueless_good_readings() {
        assert!(matches!(
            validate_reading(&reading(Some(f64::NAN), Quality::Good)),
            Err(PersistenceError::Rejected(_))
        ));
        assert!(validate_reading(&reading(None, Quality::Good)).is_err());
    }

    #[test]
    fn rejects_out_of_range_ts() {
        let mut r = reading(Some(1.0), Quality::Good);
        r.ts = datetime!(1800-01-01 00:00:00 UTC);
        assert!(validate_reading(&r).is_err());
    }
}
