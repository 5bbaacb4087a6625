//! Error types for sync and matching runs.
//!
//! Errors are classified by recoverability:
//! - Transient: network issues, timeouts, provider rate limits — retried with backoff
//! - Permanent-per-item: one record is gone or malformed — skipped and counted
//! - Structural: schema mismatch, auth failure — aborts the run
//! - Validation: bad invocation parameters — rejected before any fetch

use thiserror::Error;

/// Errors from fetching a page or a single record from a remote source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Auth expired or revoked")]
    AuthExpired,
    #[error("Watermark no longer resolvable by provider")]
    WatermarkExpired,
    #[error("Retries exhausted: {0}")]
    RetriesExhausted(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl FetchError {
    /// True when the failure is worth another attempt (network trouble,
    /// 408/429, 5xx). Everything else is terminal for the current request.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_timeout() || e.is_connect(),
            FetchError::Api { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// True when one record is permanently unavailable (deleted, forbidden)
    /// but the rest of the page is fine.
    pub fn is_permanent_item(&self) -> bool {
        matches!(
            self,
            FetchError::Api {
                status: 404 | 403 | 410,
                ..
            } | FetchError::MalformedPayload(_)
        )
    }

    /// True when the whole run must stop: auth is dead and every further
    /// call would fail the same way. A single record that exhausts retries
    /// is not structural; it degrades the page, not the run.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FetchError::AuthExpired | FetchError::Api { status: 401, .. }
        )
    }
}

/// Outcome of resolving one record during a page fetch.
///
/// Expected per-item failures are values, not exceptions — the page loop
/// inspects the variant instead of catching at several call depths.
#[derive(Debug)]
pub enum RecordOutcome {
    /// Record fetched and parsed.
    Ok(crate::sources::SourceRecord),
    /// Record permanently unavailable (404/410/403, malformed). Counted as
    /// one failed unit; the page continues.
    Skipped { id: String, reason: String },
    /// Transient failure that survived all retry attempts. Counted as one
    /// failed unit; the page continues.
    Failed { id: String, error: FetchError },
}

/// Errors from a whole sync or matching invocation.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Unknown source: {0}")]
    UnknownSource(String),
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Warehouse error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("Nothing written: {0}")]
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> FetchError {
        FetchError::Api {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_transient_statuses() {
        assert!(api(429).is_transient());
        assert!(api(503).is_transient());
        assert!(api(408).is_transient());
        assert!(!api(404).is_transient());
        assert!(!api(401).is_transient());
    }

    #[test]
    fn test_permanent_item_statuses() {
        assert!(api(404).is_permanent_item());
        assert!(api(403).is_permanent_item());
        assert!(api(410).is_permanent_item());
        assert!(!api(500).is_permanent_item());
        assert!(FetchError::MalformedPayload("bad mime".into()).is_permanent_item());
    }

    #[test]
    fn test_structural() {
        assert!(FetchError::AuthExpired.is_structural());
        assert!(api(401).is_structural());
        assert!(!api(404).is_structural());
        // Retries exhausted on one item degrades the page, not the run.
        assert!(!FetchError::RetriesExhausted("x".into()).is_structural());
    }
}
