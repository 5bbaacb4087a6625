//! CRM source client.
//!
//! One-phase fetch: `GET /api/v2/contacts` returns full contact objects,
//! filtered by `updated_since` for incremental runs and paged by an opaque
//! cursor token. The response carries a `latest_modified` hint the
//! orchestrator can adopt as the new watermark.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{ClientCore, PageItem, RemoteSource, SourceKind, SourcePage, SourceRecord};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::net::RateLimitProfile;

#[derive(Debug, Deserialize)]
struct ContactListResponse {
    #[serde(default)]
    contacts: Vec<Value>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    latest_modified: Option<String>,
}

pub struct CrmClient {
    core: ClientCore,
}

impl CrmClient {
    pub fn new(sc: &SourceConfig) -> Self {
        Self {
            core: ClientCore::new(sc),
        }
    }

    fn contact_to_record(&self, contact: Value) -> Option<SourceRecord> {
        let id = contact.get("id")?.as_str()?.to_string();
        let occurred_at = contact
            .get("updated_at")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(SourceRecord {
            id,
            thread_id: None,
            occurred_at,
            kind: SourceKind::Crm,
            payload: contact,
        })
    }
}

#[async_trait]
impl RemoteSource for CrmClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Crm
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
            vec![("limit", self.core.page_size.to_string())];
        if let Some(since) = watermark {
            query.push(("updated_since", since.to_string()));
        }
        if let Some(cursor) = page_token {
            query.push(("cursor", cursor.to_string()));
        }

        let body = self.core.get_json("/api/v2/contacts", &query).await?;
        let list: ContactListResponse = serde_json::from_value(body)?;

        // Contacts without a usable id are dropped at the edge; the
        // transformer would only reject them later with less context.
        let items = list
            .contacts
            .into_iter()
            .filter_map(|c| self.contact_to_record(c))
            .map(PageItem::Record)
            .collect();

        Ok(SourcePage {
            items,
            next_page_token: list.next_cursor,
            cursor_hint: list.latest_modified,
        })
    }

    async fn get_item(&self, id: &str) -> Result<SourceRecord, FetchError> {
        let path = format!("/api/v2/contacts/{id}");
        let body = self.core.get_json(&path, &[]).await?;
        self.contact_to_record(body)
            .ok_or_else(|| FetchError::MalformedPayload(format!("contact {id} missing id field")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_list_deserialization() {
        let json = r#"{
            "contacts": [
                {"id": "c-1", "name": "Ana", "email": "ana@acme.io", "updated_at": "2026-03-01T10:00:00Z"},
                {"id": "c-2", "name": "Ben", "phone": "+12345678901"}
            ],
            "next_cursor": "abc",
            "latest_modified": "2026-03-01T10:00:00Z"
        }"#;
        let resp: ContactListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.contacts.len(), 2);
        assert_eq!(resp.next_cursor.as_deref(), Some("abc"));
        assert_eq!(resp.latest_modified.as_deref(), Some("2026-03-01T10:00:00Z"));
    }

    #[test]
    fn test_contact_without_id_dropped() {
        let client = CrmClient::new(&SourceConfig::default());
        assert!(client
            .contact_to_record(serde_json::json!({"name": "No Id"}))
            .is_none());
        let rec = client
            .contact_to_record(serde_json::json!({"id": "c-9", "updated_at": "2026-01-05T00:00:00Z"}))
            .unwrap();
        assert_eq!(rec.id, "c-9");
        assert_eq!(rec.occurred_at.as_deref(), Some("2026-01-05T00:00:00Z"));
        assert_eq!(rec.kind, SourceKind::Crm);
    }
}
