use std::fmt;

use time::OffsetDateTime;

use super::{DeviceAddress, MeterKey};

/// Read operation type. Batch and sequential reads carry separate timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum OperationKind {
    Batch,
    Sequential,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Sequential => "sequential",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed read attempt, tagged with the timeout in force for its
/// operation type.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeoutEvent {
    pub operation: OperationKind,
    pub timeout_ms: u64,
    pub meter: MeterKey,
    pub device: DeviceAddress,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
}
