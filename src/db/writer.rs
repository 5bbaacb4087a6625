//! Idempotent batch writer.
//!
//! Rows are upserted keyed by natural id — writing the same batch twice
//! (retry after a crash) leaves the warehouse unchanged. Large batches are
//! chunked to bound per-transaction size; a failing chunk degrades to
//! per-row writes so one bad row cannot lose its chunk, while structural
//! errors propagate immediately.

use rusqlite::params;

use super::{DbError, Warehouse};
use crate::normalize::last_n_digits;

/// Rows per transaction.
const CHUNK_SIZE: usize = 1_000;

/// Which directory a normalized participant key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Email,
    Phone,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Email => "email",
            KeyKind::Phone => "phone",
        }
    }
}

/// One participant extracted from a communication.
#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub address: String,
    pub role: String,
    pub normalized_key: Option<String>,
    pub key_kind: Option<KeyKind>,
}

/// Warehouse-ready communication, with its participant list.
#[derive(Debug, Clone)]
pub struct CommunicationRow {
    pub id: String,
    pub source: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub body: Option<String>,
    pub direction: Option<String>,
    pub occurred_at: Option<String>,
    pub fetched_at: String,
    pub embedding: Option<String>,
    pub participants: Vec<ParticipantRow>,
}

/// Warehouse-ready directory contact (CRM objects transform to these).
#[derive(Debug, Clone)]
pub struct ContactRow {
    pub id: String,
    pub account_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub secondary_email: Option<String>,
    pub phone: Option<String>,
    pub mobile_phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: String,
    pub name: String,
    pub domain: Option<String>,
}

/// The transformed shape of one SourceRecord.
#[derive(Debug, Clone)]
pub enum CanonicalRecord {
    Communication(CommunicationRow),
    Contact(ContactRow),
    Account(AccountRow),
}

/// Partial-failure accounting for one batch write.
#[derive(Debug, Default, Clone)]
pub struct WriteStats {
    pub written: u64,
    pub failed: u64,
    /// Indices into the input slice of rows the warehouse rejected. Callers
    /// use these to keep the cursor behind any record that didn't land.
    pub rejected_rows: Vec<usize>,
}

impl Warehouse {
    /// Write a batch of canonical records, chunked and idempotent.
    ///
    /// Chunk path: all rows of a chunk in one transaction. On chunk failure,
    /// structural errors propagate; anything else retries the chunk row by
    /// row, counting each rejection as one failed unit.
    pub fn write_batch(&self, rows: &[CanonicalRecord]) -> Result<WriteStats, DbError> {
        let mut stats = WriteStats::default();

        for (chunk_index, chunk) in rows.chunks(CHUNK_SIZE).enumerate() {
            let base = chunk_index * CHUNK_SIZE;
            let chunk_result = self.with_transaction(|tx| {
                for record in chunk {
                    tx.write_one(record)?;
                }
                Ok(())
            });

            match chunk_result {
                Ok(()) => stats.written += chunk.len() as u64,
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => {
                    log::warn!(
                        "chunk write failed ({}), retrying {} rows individually",
                        e,
                        chunk.len()
                    );
                    for (offset, record) in chunk.iter().enumerate() {
                        match self.write_one(record) {
                            Ok(()) => stats.written += 1,
                            Err(e) if e.is_structural() => return Err(e),
                            Err(e) => {
                                log::warn!("row write failed: {}", e);
                                stats.failed += 1;
                                stats.rejected_rows.push(base + offset);
                            }
                        }
                    }
                }
            }
        }

        Ok(stats)
    }

    fn write_one(&self, record: &CanonicalRecord) -> Result<(), DbError> {
        match record {
            CanonicalRecord::Communication(row) => self.upsert_communication(row),
            CanonicalRecord::Contact(row) => self.upsert_contact(row),
            CanonicalRecord::Account(row) => self.upsert_account(row),
        }
    }

    /// Upsert one communication and its participants. Match-enrichment
    /// fields are left alone on conflict — a re-sync must not undo the
    /// matcher's work.
    fn upsert_communication(&self, row: &CommunicationRow) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO communications (
                id, source, thread_id, subject, snippet, body, direction,
                occurred_at, fetched_at, embedding, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(id) DO UPDATE SET
                thread_id = excluded.thread_id,
                subject = excluded.subject,
                snippet = excluded.snippet,
                body = excluded.body,
                direction = excluded.direction,
                occurred_at = excluded.occurred_at,
                fetched_at = excluded.fetched_at,
                embedding = COALESCE(excluded.embedding, communications.embedding),
                updated_at = excluded.updated_at",
            params![
                row.id,
                row.source,
                row.thread_id,
                row.subject,
                row.snippet,
                row.body,
                row.direction,
                row.occurred_at,
                row.fetched_at,
                row.embedding,
                now,
            ],
        )?;

        for p in &row.participants {
            // Participants are matched exactly once; re-syncs must not
            // clobber contact_id/confidence, hence DO NOTHING.
            self.conn.execute(
                "INSERT INTO participants (comm_id, address, role, normalized_key, key_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(comm_id, address, role) DO NOTHING",
                params![
                    row.id,
                    p.address,
                    p.role,
                    p.normalized_key,
                    p.key_kind.map(|k| k.as_str()),
                ],
            )?;
        }
        Ok(())
    }

    fn upsert_contact(&self, row: &ContactRow) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        let phone_last10 = row.phone.as_deref().and_then(|p| last_n_digits(p, 10));
        let mobile_last10 = row
            .mobile_phone
            .as_deref()
            .and_then(|p| last_n_digits(p, 10));

        self.conn.execute(
            "INSERT INTO contacts (
                id, account_id, name, email, secondary_email, phone,
                mobile_phone, phone_last10, mobile_last10, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                account_id = COALESCE(excluded.account_id, contacts.account_id),
                name = CASE WHEN excluded.name != '' THEN excluded.name ELSE contacts.name END,
                email = COALESCE(excluded.email, contacts.email),
                secondary_email = COALESCE(excluded.secondary_email, contacts.secondary_email),
                phone = COALESCE(excluded.phone, contacts.phone),
                mobile_phone = COALESCE(excluded.mobile_phone, contacts.mobile_phone),
                phone_last10 = COALESCE(excluded.phone_last10, contacts.phone_last10),
                mobile_last10 = COALESCE(excluded.mobile_last10, contacts.mobile_last10),
                updated_at = excluded.updated_at",
            params![
                row.id,
                row.account_id,
                row.name,
                row.email,
                row.secondary_email,
                row.phone,
                row.mobile_phone,
                phone_last10,
                mobile_last10,
                now,
            ],
        )?;
        Ok(())
    }

    fn upsert_account(&self, row: &AccountRow) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO accounts (id, name, domain, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = CASE WHEN excluded.name != '' THEN excluded.name ELSE accounts.name END,
                domain = COALESCE(excluded.domain, accounts.domain),
                updated_at = excluded.updated_at",
            params![row.id, row.name, row.domain, now],
        )?;
        Ok(())
    }
}
