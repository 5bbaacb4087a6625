//! Mailbox source client.
//!
//! Two-phase fetch: `GET /v1/messages` lists stubs (id + thread id), then
//! each message is fetched individually with `format=full` and its MIME tree
//! walked for a text body. Body data is URL-safe base64; decoding lives in
//! `normalize::decode_base64_text` so it stays unit-testable outside the
//! fetch loop.

use async_trait::async_trait;
use serde::Deserialize;

use super::{ClientCore, PageItem, RemoteSource, SourceKind, SourcePage, SourceRecord};
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::net::RateLimitProfile;
use crate::normalize::decode_base64_text;

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PayloadBody>,
    #[serde(default)]
    parts: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadBody {
    #[serde(default)]
    data: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct MailboxClient {
    core: ClientCore,
}

impl MailboxClient {
    pub fn new(sc: &SourceConfig) -> Self {
        Self {
            core: ClientCore::new(sc),
        }
    }
}

#[async_trait]
impl RemoteSource for MailboxClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Mailbox
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
            vec![("maxResults", self.core.page_size.to_string())];
        if let Some(after) = watermark {
            query.push(("after", after.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let body = self.core.get_json("/v1/messages", &query).await?;
        let list: MessageListResponse = serde_json::from_value(body)?;

        Ok(SourcePage {
            items: list
                .messages
                .into_iter()
                .map(|stub| PageItem::Stub { id: stub.id })
                .collect(),
            next_page_token: list.next_page_token,
            cursor_hint: None,
        })
    }

    async fn get_item(&self, id: &str) -> Result<SourceRecord, FetchError> {
        let path = format!("/v1/messages/{id}");
        let body = self
            .core
            .get_json(&path, &[("format", "full".to_string())])
            .await?;
        let detail: MessageDetail = serde_json::from_value(body)?;

        if detail.id.is_empty() {
            return Err(FetchError::MalformedPayload(format!(
                "message {id} has no id field"
            )));
        }

        Ok(message_to_record(detail))
    }
}

// ---------------------------------------------------------------------------
// Message decoding
// ---------------------------------------------------------------------------

fn message_to_record(detail: MessageDetail) -> SourceRecord {
    let headers = detail
        .payload
        .as_ref()
        .map(|p| &p.headers[..])
        .unwrap_or(&[]);

    let get_header = |name: &str| -> String {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let body_text = detail
        .payload
        .as_ref()
        .and_then(|p| extract_body_text(p, "text/plain").or_else(|| extract_body_text(p, "text/html")));

    // internalDate is epoch millis on the wire
    let occurred_at = detail
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339());

    let payload = serde_json::json!({
        "from": get_header("From"),
        "to": get_header("To"),
        "cc": get_header("Cc"),
        "subject": get_header("Subject"),
        "date": get_header("Date"),
        "snippet": detail.snippet,
        "body": body_text,
    });

    SourceRecord {
        id: detail.id,
        thread_id: if detail.thread_id.is_empty() {
            None
        } else {
            Some(detail.thread_id)
        },
        occurred_at,
        kind: SourceKind::Mailbox,
        payload,
    }
}

/// Recursively walk MIME parts for body data matching the target MIME type.
fn extract_body_text(payload: &MessagePayload, target_mime: &str) -> Option<String> {
    if payload.mime_type == target_mime {
        if let Some(ref body) = payload.body {
            if let Some(ref data) = body.data {
                return decode_base64_text(data);
            }
        }
    }
    for part in &payload.parts {
        if let Some(text) = extract_body_text(part, target_mime) {
            return Some(text);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_list_deserialization() {
        let json = r#"{
            "messages": [
                {"id": "msg1", "threadId": "thread1"},
                {"id": "msg2", "threadId": "thread2"}
            ],
            "nextPageToken": "token123"
        }"#;

        let resp: MessageListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.messages.len(), 2);
        assert_eq!(resp.messages[0].id, "msg1");
        assert_eq!(resp.next_page_token.as_deref(), Some("token123"));
    }

    #[test]
    fn test_message_list_empty() {
        let json = r#"{"resultSizeEstimate": 0}"#;
        let resp: MessageListResponse = serde_json::from_str(json).unwrap();
        assert!(resp.messages.is_empty());
        assert!(resp.next_page_token.is_none());
    }

    #[test]
    fn test_message_to_record_headers_and_body() {
        let json = r#"{
            "id": "msg123",
            "threadId": "thread456",
            "snippet": "Hey, just checking in...",
            "internalDate": "1767225600000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "From", "value": "Jane Doe <jane@customer.com>"},
                    {"name": "To", "value": "sales@us.example.com"},
                    {"name": "Subject", "value": "Re: Renewal"}
                ],
                "parts": [
                    {"mimeType": "text/plain", "body": {"data": "aGVsbG8gd29ybGQ"}}
                ]
            }
        }"#;

        let detail: MessageDetail = serde_json::from_str(json).unwrap();
        let record = message_to_record(detail);

        assert_eq!(record.id, "msg123");
        assert_eq!(record.thread_id.as_deref(), Some("thread456"));
        assert_eq!(record.kind, SourceKind::Mailbox);
        assert_eq!(record.payload["from"], "Jane Doe <jane@customer.com>");
        assert_eq!(record.payload["body"], "hello world");
        // internalDate 1767225600000 = 2026-01-01T00:00:00Z
        assert!(record.occurred_at.as_deref().unwrap().starts_with("2026-01-01"));
    }

    #[test]
    fn test_message_without_text_body() {
        let json = r#"{
            "id": "msg9",
            "threadId": "t9",
            "snippet": "",
            "payload": {
                "mimeType": "application/pdf",
                "headers": [{"name": "From", "value": "a@b.co"}],
                "body": {"data": "JVBERi0"}
            }
        }"#;
        let detail: MessageDetail = serde_json::from_str(json).unwrap();
        let record = message_to_record(detail);
        assert!(record.payload["body"].is_null());
    }

    #[test]
    fn test_nested_mime_walk_prefers_plain_text() {
        let payload = MessagePayload {
            mime_type: "multipart/mixed".into(),
            headers: vec![],
            body: None,
            parts: vec![
                MessagePayload {
                    mime_type: "text/html".into(),
                    headers: vec![],
                    body: Some(PayloadBody {
                        data: Some("PGI-aHRtbDwvYj4".into()),
                    }),
                    parts: vec![],
                },
                MessagePayload {
                    mime_type: "text/plain".into(),
                    headers: vec![],
                    body: Some(PayloadBody {
                        data: Some("cGxhaW4".into()),
                    }),
                    parts: vec![],
                },
            ],
        };
        assert_eq!(extract_body_text(&payload, "text/plain").as_deref(), Some("plain"));
    }
}
