//! Marketing-automation source client.
//!
//! Campaign engagement events (opens, clicks, replies) keyed by recipient
//! email, one-phase pages ordered by event time.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{ClientCore, PageItem, RemoteSource, SourceKind, SourcePage, SourceRecord};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::net::RateLimitProfile;

#[derive(Debug, Deserialize)]
struct EventListResponse {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    next_token: Option<String>,
}

pub struct MarketingClient {
    core: ClientCore,
}

impl MarketingClient {
    pub fn new(sc: &SourceConfig) -> Self {
        Self {
            core: ClientCore::new(sc),
        }
    }

    fn event_to_record(&self, event: Value) -> Option<SourceRecord> {
        let id = event.get("event_id")?.as_str()?.to_string();
        let occurred_at = event
            .get("occurred_at")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(SourceRecord {
            id,
            thread_id: event
                .get("campaign_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            occurred_at,
            kind: SourceKind::Marketing,
            payload: event,
        })
    }
}

#[async_trait]
impl RemoteSource for MarketingClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Marketing
    }

    fn rate_limit_profile(&self) -> RateLimitProfile {
        self.core.profile
    }

    async fn list_page(
        &self,
        watermark: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<SourcePage, FetchError> {
        let mut query: Vec<(&str, String)> =
            vec![("count", self.core.page_size.to_string())];
        if let Some(since) = watermark {
            query.push(("since", since.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("token", token.to_string()));
        }

        let body = self.core.get_json("/v3/events", &query).await?;
        let list: EventListResponse = serde_json::from_value(body)?;

        let items = list
            .events
            .into_iter()
            .filter_map(|e| self.event_to_record(e))
            .map(PageItem::Record)
            .collect();

        Ok(SourcePage {
            items,
            next_page_token: list.next_token,
            cursor_hint: None,
        })
    }

    async fn get_item(&self, id: &str) -> Result<SourceRecord, FetchError> {
        let path = format!("/v3/events/{id}");
        let body = self.core.get_json(&path, &[]).await?;
        self.event_to_record(body)
            .ok_or_else(|| FetchError::MalformedPayload(format!("event {id} missing event_id")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_to_record() {
        let client = MarketingClient::new(&SourceConfig::default());
        let rec = client
            .event_to_record(serde_json::json!({
                "event_id": "ev-1",
                "campaign_id": "camp-12",
                "recipient": "Lead@Example.com",
                "event_type": "click",
                "occurred_at": "2026-02-20T08:00:00Z"
            }))
            .unwrap();
        assert_eq!(rec.id, "ev-1");
        assert_eq!(rec.thread_id.as_deref(), Some("camp-12"));
        assert_eq!(rec.kind, SourceKind::Marketing);
    }

    #[test]
    fn test_event_list_empty() {
        let resp: EventListResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.events.is_empty());
        assert!(resp.next_token.is_none());
    }
}
