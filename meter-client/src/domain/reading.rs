use std::str::FromStr;

use time::OffsetDateTime;

use super::{Meter, MeterKey, RegisterMapping, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Quality {
    Good,
    Estimated,
    Questionable,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Estimated => "estimated",
            Self::Questionable => "questionable",
        }
    }
}

impl FromStr for Quality {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(Self::Good),
            "estimated" => Ok(Self::Estimated),
            "questionable" => Ok(Self::Questionable),
            other => Err(UnknownVariant {
                kind: "quality",
                value: other.to_string(),
            }),
        }
    }
}

/// Which read operation produced a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ReadSource {
    Batch,
    Sequential,
}

impl ReadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Sequential => "sequential",
        }
    }
}

/// A reading produced by the collector and not yet persisted.
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PendingReading {
    pub tenant_id: i64,
    pub meter_id: i64,
    pub element_id: i64,
    pub data_point: String,
    pub value: Option<f64>,
    pub unit: String,
    pub quality: Quality,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub source: ReadSource,
}

impl PendingReading {
    pub fn good(
        meter: &Meter,
        register: &RegisterMapping,
        value: f64,
        ts: OffsetDateTime,
        source: ReadSource,
    ) -> Self {
        Self::build(meter, register, Some(value), Quality::Good, ts, source)
    }

    pub fn failed(
        meter: &Meter,
        register: &RegisterMapping,
        ts: OffsetDateTime,
        source: ReadSource,
    ) -> Self {
        Self::build(meter, register, None, Quality::Questionable, ts, source)
    }

    fn build(
        meter: &Meter,
        register: &RegisterMapping,
        value: Option<f64>,
        quality: Quality,
        ts: OffsetDateTime,
        source: ReadSource,
    ) -> Self {
        Self {
            tenant_id: meter.tenant_id,
            meter_id: meter.meter_id,
            element_id: meter.element_id,
            data_point: register.data_point.clone(),
            value,
            unit: register.unit.clone(),
            quality,
            ts,
            source,
        }
    }

    pub fn meter_key(&self) -> MeterKey {
        MeterKey {
            meter_id: self.meter_id,
            element_id: self.element_id,
        }
    }

    /// Conflict key of the persisted row.
    pub fn natural_key(&self) -> (i64, i64, &str, OffsetDateTime) {
        (self.meter_id, self.element_id, &self.data_point, self.ts)
    }
}

/// A persisted reading as read back for upload.
#[derive(Debug, Clone, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StoredReading {
    pub tenant_id: i64,
    pub meter_id: i64,
    pub meter_element_id: i64,
    pub data_point: String,
    pub value: Option<f64>,
    pub unit: String,
    pub quality: String,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub recorded_at: OffsetDateTime,
}
