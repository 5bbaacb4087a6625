//! Telephony source client.
//!
//! Call logs come back as full records in one phase, newest-last within a
//! page. Calls are keyed by the two phone numbers on the line; the matcher
//! resolves them through the exact and fuzzy phone tiers.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{ClientCore, PageItem, RemoteSource, SourceKind, SourcePage, SourceRecord};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::net::RateLimitProfile;

#[derive(Debug, Deserialize)]
struct CallListResponse {
    #[serde(default)]
    calls: Vec<Value>,
    #[serde(default)]
    next_page: Option<String>,
}

pub struct TelephonyClient {
    core: ClientCore,
}

impl TelephonyClient {
    pub fn new(sc: &SourceConfig) -> Self {
        Self {
            core: ClientCore::new(sc),
        }
    }

    fn call_to_record(&self, call: Value) -> Option<SourceRecord> {
        let id = call.get("call_id")?.as_str()?.to_string();
        let occurred_at = call
            .get("started_at")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(SourceRecord {
            id,
            thread_id: None,
            occurred_at,
            kind: SourceKind::Telephony,
            payload: call,
        })
    }
}

#[async_trait]
impl RemoteSource for TelephonyClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Telephony
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
            vec![("per_page", self.core.page_size.to_string())];
        if let Some(since) = watermark {
            query.push(("started_after", since.to_string()));
        }
        if let Some(page) = page_token {
            query.push(("page", page.to_string()));
        }

        let body = self.core.get_json("/v1/calls", &query).await?;
        let list: CallListResponse = serde_json::from_value(body)?;

        let items = list
            .calls
            .into_iter()
            .filter_map(|c| self.call_to_record(c))
            .map(PageItem::Record)
            .collect();

        Ok(SourcePage {
            items,
            next_page_token: list.next_page,
            cursor_hint: None,
        })
    }

    async fn get_item(&self, id: &str) -> Result<SourceRecord, FetchError> {
        let path = format!("/v1/calls/{id}");
        let body = self.core.get_json(&path, &[]).await?;
        self.call_to_record(body)
            .ok_or_else(|| FetchError::MalformedPayload(format!("call {id} missing call_id")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_list_deserialization() {
        let json = r#"{
            "calls": [
                {"call_id": "call-1", "from_number": "+12345678901", "to_number": "+19998887777",
                 "direction": "inbound", "started_at": "2026-02-10T15:04:00Z", "duration_secs": 420}
            ],
            "next_page": "2"
        }"#;
        let resp: CallListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.calls.len(), 1);
        assert_eq!(resp.next_page.as_deref(), Some("2"));
    }

    #[test]
    fn test_call_to_record() {
        let client = TelephonyClient::new(&SourceConfig::default());
        let rec = client
            .call_to_record(serde_json::json!({
                "call_id": "call-7",
                "from_number": "+12345678901",
                "started_at": "2026-02-10T15:04:00Z"
            }))
            .unwrap();
        assert_eq!(rec.id, "call-7");
        assert_eq!(rec.kind, SourceKind::Telephony);
        assert!(client.call_to_record(serde_json::json!({"foo": 1})).is_none());
    }
}
