use chrono::NaiveDate;
use thiserror::Error;

use crate::models::TrackedField;

/// Failures raised by an [`ExternalMetricsProvider`](crate::provider::ExternalMetricsProvider).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider access not authorized")]
    Unauthorized,
    #[error("provider query failed: {0}")]
    Query(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the reconciliation engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Provider access was denied. Provider-backed features stay disabled.
    #[error("health data access was not authorized")]
    Authorization,
    /// A single field could not be fetched; the field is treated as absent.
    #[error("failed to fetch {field}: {message}")]
    Fetch { field: TrackedField, message: String },
    /// The local store rejected a write.
    #[error("failed to persist record for {day}: {source:#}")]
    Persistence {
        day: NaiveDate,
        #[source]
        source: anyhow::Error,
    },
    /// A provider write did not read back as the value written.
    #[error("verification failed for {day}: wrote {expected}, read back {actual:?}")]
    Verification {
        day: NaiveDate,
        expected: f64,
        actual: Option<f64>,
    },
}

impl SyncError {
    pub(crate) fn persistence(day: NaiveDate, source: anyhow::Error) -> Self {
        Self::Persistence { day, source }
    }

    pub(crate) fn fetch(field: TrackedField, err: &ProviderError) -> Self {
        Self::Fetch {
            field,
            message: err.to_string(),
        }
    }
}
