//! SourceRecord → CanonicalRecord transformation.
//!
//! Pure per-record functions: a failure here is caught by the page loop,
//! counted as one failed unit and never stops the page. Mailbox, telephony
//! and marketing records become communications with participant lists; CRM
//! objects become directory contacts (plus an account row when the object
//! carries one).

use serde_json::Value;
use thiserror::Error;

use crate::db::writer::{
    AccountRow, CanonicalRecord, CommunicationRow, ContactRow, KeyKind, ParticipantRow,
};
use crate::normalize::{last_n_digits, normalize_address, normalize_phone, parse_address_list};
use crate::sources::{SourceKind, SourceRecord};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Record {id} missing field {field}")]
    MissingField { id: String, field: &'static str },
    #[error("Record {id} has malformed payload: {reason}")]
    Malformed { id: String, reason: String },
}

/// Transform one fetched record. CRM objects may expand to two rows
/// (account + contact); everything else yields exactly one.
pub fn transform_record(
    record: &SourceRecord,
    default_region: &str,
) -> Result<Vec<CanonicalRecord>, TransformError> {
    if !record.payload.is_object() {
        return Err(TransformError::Malformed {
            id: record.id.clone(),
            reason: "payload is not an object".to_string(),
        });
    }
    match record.kind {
        SourceKind::Mailbox => transform_mail(record).map(|r| vec![r]),
        SourceKind::Crm => transform_crm(record),
        SourceKind::Telephony => transform_call(record, default_region).map(|r| vec![r]),
        SourceKind::Marketing => transform_event(record).map(|r| vec![r]),
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Participant rows for one address-list header.
fn email_participants(header: &str, role: &str, out: &mut Vec<ParticipantRow>) {
    for (_name, address) in parse_address_list(header) {
        let normalized = normalize_address(&address);
        out.push(ParticipantRow {
            address,
            role: role.to_string(),
            normalized_key: normalized,
            key_kind: Some(KeyKind::Email),
        });
    }
}

fn phone_participant(raw: &str, role: &str, default_region: &str) -> ParticipantRow {
    // E.164 when the number parses; trailing digits otherwise so the fuzzy
    // tier still has a key when exact normalization fails.
    let normalized = normalize_phone(raw, default_region).or_else(|| last_n_digits(raw, 10));
    ParticipantRow {
        address: raw.to_string(),
        role: role.to_string(),
        normalized_key: normalized,
        key_kind: Some(KeyKind::Phone),
    }
}

fn transform_mail(record: &SourceRecord) -> Result<CanonicalRecord, TransformError> {
    let p = &record.payload;
    let mut participants = Vec::new();
    if let Some(from) = str_field(p, "from") {
        email_participants(from, "from", &mut participants);
    }
    if let Some(to) = str_field(p, "to") {
        email_participants(to, "to", &mut participants);
    }
    if let Some(cc) = str_field(p, "cc") {
        email_participants(cc, "cc", &mut participants);
    }
    if participants.is_empty() {
        return Err(TransformError::MissingField {
            id: record.id.clone(),
            field: "from/to/cc",
        });
    }

    Ok(CanonicalRecord::Communication(CommunicationRow {
        id: record.id.clone(),
        source: record.kind.as_str().to_string(),
        thread_id: record.thread_id.clone(),
        subject: str_field(p, "subject").map(str::to_string),
        snippet: str_field(p, "snippet").map(str::to_string),
        body: str_field(p, "body").map(str::to_string),
        direction: None,
        occurred_at: record.occurred_at.clone(),
        fetched_at: chrono::Utc::now().to_rfc3339(),
        embedding: None,
        participants,
    }))
}

fn transform_call(
    record: &SourceRecord,
    default_region: &str,
) -> Result<CanonicalRecord, TransformError> {
    let p = &record.payload;
    let from = str_field(p, "from_number");
    let to = str_field(p, "to_number");
    if from.is_none() && to.is_none() {
        return Err(TransformError::MissingField {
            id: record.id.clone(),
            field: "from_number/to_number",
        });
    }

    let mut participants = Vec::new();
    if let Some(from) = from {
        participants.push(phone_participant(from, "caller", default_region));
    }
    if let Some(to) = to {
        participants.push(phone_participant(to, "callee", default_region));
    }

    let duration = p.get("duration_secs").and_then(Value::as_i64);
    let snippet = duration.map(|d| format!("call, {d}s"));

    Ok(CanonicalRecord::Communication(CommunicationRow {
        id: record.id.clone(),
        source: record.kind.as_str().to_string(),
        thread_id: None,
        subject: None,
        snippet,
        body: None,
        direction: str_field(p, "direction").map(str::to_string),
        occurred_at: record.occurred_at.clone(),
        fetched_at: chrono::Utc::now().to_rfc3339(),
        embedding: None,
        participants,
    }))
}

fn transform_event(record: &SourceRecord) -> Result<CanonicalRecord, TransformError> {
    let p = &record.payload;
    let recipient = str_field(p, "recipient").ok_or_else(|| TransformError::MissingField {
        id: record.id.clone(),
        field: "recipient",
    })?;

    let mut participants = Vec::new();
    email_participants(recipient, "recipient", &mut participants);
    if participants.is_empty() {
        // Raw recipient wasn't even address-shaped; keep the row with the
        // raw string so the unmatched counter sees it.
        participants.push(ParticipantRow {
            address: recipient.to_string(),
            role: "recipient".to_string(),
            normalized_key: normalize_address(recipient),
            key_kind: Some(KeyKind::Email),
        });
    }

    let event_type = str_field(p, "event_type").unwrap_or("event");

    Ok(CanonicalRecord::Communication(CommunicationRow {
        id: record.id.clone(),
        source: record.kind.as_str().to_string(),
        thread_id: record.thread_id.clone(),
        subject: Some(format!("campaign {event_type}")),
        snippet: None,
        body: None,
        direction: Some("outbound".to_string()),
        occurred_at: record.occurred_at.clone(),
        fetched_at: chrono::Utc::now().to_rfc3339(),
        embedding: None,
        participants,
    }))
}

fn transform_crm(record: &SourceRecord) -> Result<Vec<CanonicalRecord>, TransformError> {
    let p = &record.payload;
    let mut out = Vec::with_capacity(2);

    let account_id = str_field(p, "account_id").map(str::to_string);
    if let Some(ref aid) = account_id {
        out.push(CanonicalRecord::Account(AccountRow {
            id: aid.clone(),
            name: str_field(p, "account_name").unwrap_or_default().to_string(),
            domain: str_field(p, "account_domain").map(str::to_string),
        }));
    }

    let email = str_field(p, "email").and_then(normalize_address);
    let phone = str_field(p, "phone").map(str::to_string);
    let mobile = str_field(p, "mobile_phone").map(str::to_string);
    if email.is_none() && phone.is_none() && mobile.is_none() {
        return Err(TransformError::MissingField {
            id: record.id.clone(),
            field: "email/phone",
        });
    }

    out.push(CanonicalRecord::Contact(ContactRow {
        id: record.id.clone(),
        account_id,
        name: str_field(p, "name").unwrap_or_default().to_string(),
        email,
        secondary_email: str_field(p, "secondary_email").and_then(normalize_address),
        phone,
        mobile_phone: mobile,
    }));

    Ok(out)
}
