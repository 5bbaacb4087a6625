//! Remote source clients and the page-fetch driver.
//!
//! Each external system is one variant of a closed set behind the
//! `RemoteSource` trait — adding a provider means adding a variant, never
//! branching on strings. Clients only know how to list a page and fetch a
//! single item; quota handling, retries and per-record failure accounting
//! live in `fetch_page` so every source gets them identically.

pub mod crm;
pub mod mailbox;
pub mod marketing;
pub mod telephony;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{Config, SourceConfig};
use crate::error::{FetchError, RecordOutcome};
use crate::net::{send_with_retry, RateLimitProfile, RateLimiter, RetryPolicy};

// ---------------------------------------------------------------------------
// Source kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Mailbox,
    Crm,
    Telephony,
    Marketing,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Mailbox => "mailbox",
            SourceKind::Crm => "crm",
            SourceKind::Telephony => "telephony",
            SourceKind::Marketing => "marketing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mailbox" => Some(SourceKind::Mailbox),
            "crm" => Some(SourceKind::Crm),
            "telephony" => Some(SourceKind::Telephony),
            "marketing" => Some(SourceKind::Marketing),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records and pages
// ---------------------------------------------------------------------------

/// One raw unit fetched from a remote API. Ephemeral — lives only for the
/// duration of a sync run, always transformed before any write.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: String,
    pub thread_id: Option<String>,
    /// Source-reported event time, RFC3339 where available.
    pub occurred_at: Option<String>,
    pub kind: SourceKind,
    /// Source-shaped payload; the transformer knows each kind's fields.
    pub payload: Value,
}

/// One entry in a listed page: either a full record (one-phase APIs) or a
/// stub the driver must resolve with `get_item` (two-phase APIs like the
/// mailbox message list).
#[derive(Debug)]
pub enum PageItem {
    Record(SourceRecord),
    Stub { id: String },
}

/// A listed page, before stub resolution.
#[derive(Debug, Default)]
pub struct SourcePage {
    pub items: Vec<PageItem>,
    pub next_page_token: Option<String>,
    /// Provider-suggested new watermark, when the API reports one.
    pub cursor_hint: Option<String>,
}

/// A fully resolved page: every item accounted for as Ok/Skipped/Failed.
#[derive(Debug)]
pub struct FetchedPage {
    pub outcomes: Vec<RecordOutcome>,
    pub next_page_token: Option<String>,
    pub cursor_hint: Option<String>,
}

// ---------------------------------------------------------------------------
// RemoteSource trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn rate_limit_profile(&self) -> RateLimitProfile;

    /// List one page at the given position. `watermark` bounds an
    /// incremental scan; `None` means full scan from the start.
    async fn list_page(
        &self,
        watermark: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<SourcePage, FetchError>;

    /// Fetch one item by source-native id.
    async fn get_item(&self, id: &str) -> Result<SourceRecord, FetchError>;
}

/// Construct the client for a kind from config. Disabled sources are a
/// validation error at the invocation boundary, before any fetch.
pub fn build_source(kind: SourceKind, config: &Config) -> Option<Box<dyn RemoteSource>> {
    let sc = config.source(kind);
    if !sc.enabled {
        return None;
    }
    Some(match kind {
        SourceKind::Mailbox => Box::new(mailbox::MailboxClient::new(sc)),
        SourceKind::Crm => Box::new(crm::CrmClient::new(sc)),
        SourceKind::Telephony => Box::new(telephony::TelephonyClient::new(sc)),
        SourceKind::Marketing => Box::new(marketing::MarketingClient::new(sc)),
    })
}

// ---------------------------------------------------------------------------
// Page-fetch driver
// ---------------------------------------------------------------------------

/// Fetch and resolve one page: list, then resolve each stub through the
/// limiter. A stub that is permanently gone becomes `Skipped`; one that
/// exhausts retries becomes `Failed`. Neither aborts the page — the
/// orchestrator decides run status from the aggregate.
pub async fn fetch_page(
    source: &dyn RemoteSource,
    limiter: &RateLimiter,
    watermark: Option<&str>,
    page_token: Option<&str>,
) -> Result<FetchedPage, FetchError> {
    limiter.acquire().await;
    let page = source.list_page(watermark, page_token).await?;

    let mut outcomes = Vec::with_capacity(page.items.len());
    for item in page.items {
        match item {
            PageItem::Record(record) => outcomes.push(RecordOutcome::Ok(record)),
            PageItem::Stub { id } => {
                limiter.acquire().await;
                match source.get_item(&id).await {
                    Ok(record) => outcomes.push(RecordOutcome::Ok(record)),
                    Err(e) if e.is_permanent_item() => {
                        log::debug!("{} record {} skipped: {}", source.kind(), id, e);
                        outcomes.push(RecordOutcome::Skipped {
                            id,
                            reason: e.to_string(),
                        });
                    }
                    Err(e) if e.is_structural() => return Err(e),
                    Err(e) => {
                        log::warn!("{} record {} failed: {}", source.kind(), id, e);
                        outcomes.push(RecordOutcome::Failed { id, error: e });
                    }
                }
            }
        }
    }

    Ok(FetchedPage {
        outcomes,
        next_page_token: page.next_page_token,
        cursor_hint: page.cursor_hint,
    })
}

// ---------------------------------------------------------------------------
// Shared client plumbing
// ---------------------------------------------------------------------------

/// HTTP scaffolding common to every concrete client: base URL, bearer key,
/// request timeout, retry policy, quota profile.
pub(crate) struct ClientCore {
    pub http: reqwest::Client,
    pub base_url: String,
    pub api_key: String,
    pub retry: RetryPolicy,
    pub profile: RateLimitProfile,
    pub page_size: u32,
}

impl ClientCore {
    pub fn new(sc: &SourceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(sc.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: sc.base_url.trim_end_matches('/').to_string(),
            api_key: sc.api_key.clone().unwrap_or_default(),
            retry: RetryPolicy::default(),
            profile: RateLimitProfile {
                calls: sc.rate_limit_calls,
                window: std::time::Duration::from_millis(sc.rate_limit_window_ms),
            },
            page_size: sc.page_size,
        }
    }

    /// GET with bearer auth and retry; classifies error statuses, returning
    /// the parsed body only on 2xx.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = send_with_retry(
            self.http
                .get(&url)
                .bearer_auth(&self.api_key)
                .query(query),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(FetchError::AuthExpired);
        }
        if status == reqwest::StatusCode::GONE {
            return Err(FetchError::WatermarkExpired);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(FetchError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parse_roundtrip() {
        for kind in [
            SourceKind::Mailbox,
            SourceKind::Crm,
            SourceKind::Telephony,
            SourceKind::Marketing,
        ] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("spreadsheet"), None);
    }

    #[test]
    fn test_empty_page_default() {
        let page = SourcePage::default();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
