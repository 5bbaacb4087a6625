//! Contact-directory and manual-mapping lookups for the matcher, plus the
//! bulk conditional updates that attach matches to participants.
//!
//! Lookups are bulk by design: one query per tier per key set, bound
//! through generated placeholders — never string interpolation of values.

use std::collections::HashMap;

use rusqlite::params;

use super::{DbError, Warehouse};

/// A participant awaiting resolution.
#[derive(Debug, Clone)]
pub struct UnmatchedParticipant {
    pub comm_id: String,
    pub address: String,
    pub role: String,
    pub normalized_key: Option<String>,
    pub key_kind: Option<String>,
}

/// Resolved identity for one directory key.
#[derive(Debug, Clone)]
pub struct DirectoryHit {
    pub contact_id: Option<String>,
    pub account_id: Option<String>,
}

/// One participant update produced by the matcher.
#[derive(Debug, Clone)]
pub struct ParticipantMatch {
    pub comm_id: String,
    pub address: String,
    pub role: String,
    pub contact_id: Option<String>,
    pub account_id: Option<String>,
    pub confidence: String,
}

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Warehouse {
    /// Participants not yet visited by the matcher, oldest communications
    /// first so backlogs drain in ingest order.
    pub fn unmatched_participants(
        &self,
        limit: usize,
    ) -> Result<Vec<UnmatchedParticipant>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT p.comm_id, p.address, p.role, p.normalized_key, p.key_kind
             FROM participants p
             JOIN communications c ON c.id = p.comm_id
             WHERE p.match_confidence IS NULL AND p.matched_at IS NULL
             ORDER BY c.occurred_at, p.comm_id
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(UnmatchedParticipant {
                comm_id: row.get(0)?,
                address: row.get(1)?,
                role: row.get(2)?,
                normalized_key: row.get(3)?,
                key_kind: row.get(4)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Manual overrides for a key set. Keys are normalized addresses or
    /// last-10-digit strings.
    pub fn manual_mappings_for(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, DirectoryHit>, DbError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT key, contact_id, account_id FROM manual_mappings WHERE key IN ({})",
            placeholders(keys.len())
        );
        self.hit_map(&sql, keys)
    }

    /// Exact directory lookup by normalized email (primary or secondary).
    pub fn contacts_by_email(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, DirectoryHit>, DbError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let ph = placeholders(keys.len());
        // Bind the same key list twice by offsetting the second group.
        let ph2: String = (keys.len() + 1..=keys.len() * 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT CASE WHEN email IN ({ph}) THEN email ELSE secondary_email END, id, account_id
             FROM contacts
             WHERE email IN ({ph}) OR secondary_email IN ({ph2})"
        );
        let mut doubled = keys.to_vec();
        doubled.extend_from_slice(keys);
        self.hit_map(&sql, &doubled)
    }

    /// Exact directory lookup by E.164 phone or mobile.
    pub fn contacts_by_phone(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, DirectoryHit>, DbError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let ph = placeholders(keys.len());
        let ph2: String = (keys.len() + 1..=keys.len() * 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT CASE WHEN phone IN ({ph}) THEN phone ELSE mobile_phone END, id, account_id
             FROM contacts
             WHERE phone IN ({ph}) OR mobile_phone IN ({ph2})"
        );
        let mut doubled = keys.to_vec();
        doubled.extend_from_slice(keys);
        self.hit_map(&sql, &doubled)
    }

    /// Fuzzy directory lookup by trailing-10-digit key against phone and
    /// mobile columns. Collisions across countries are accepted — the tier
    /// is labeled fuzzy for exactly that reason.
    pub fn contacts_by_last10(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, DirectoryHit>, DbError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let ph = placeholders(keys.len());
        let ph2: String = (keys.len() + 1..=keys.len() * 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT CASE WHEN phone_last10 IN ({ph}) THEN phone_last10 ELSE mobile_last10 END,
                    id, account_id
             FROM contacts
             WHERE phone_last10 IN ({ph}) OR mobile_last10 IN ({ph2})"
        );
        let mut doubled = keys.to_vec();
        doubled.extend_from_slice(keys);
        self.hit_map(&sql, &doubled)
    }

    fn hit_map(
        &self,
        sql: &str,
        bind: &[String],
    ) -> Result<HashMap<String, DirectoryHit>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let bind_refs: Vec<&dyn rusqlite::types::ToSql> =
            bind.iter().map(|k| k as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt.query_map(bind_refs.as_slice(), |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                DirectoryHit {
                    contact_id: row.get(1)?,
                    account_id: row.get(2)?,
                },
            ))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (key, hit) = row?;
            if let Some(key) = key {
                // First hit wins on duplicate directory entries; rows come
                // back in rowid order so the oldest contact sticks.
                map.entry(key).or_insert(hit);
            }
        }
        Ok(map)
    }

    /// Install or replace a manual override.
    pub fn upsert_manual_mapping(
        &self,
        key: &str,
        key_type: &str,
        contact_id: Option<&str>,
        account_id: Option<&str>,
    ) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO manual_mappings (key, key_type, contact_id, account_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                key_type = excluded.key_type,
                contact_id = excluded.contact_id,
                account_id = excluded.account_id",
            params![key, key_type, contact_id, account_id, now],
        )?;
        Ok(())
    }

    /// Attach matches to participants — one bulk transaction, falling back
    /// to per-row updates on failure so a single bad row cannot lose the
    /// batch. Conditional on the row still being unmatched. Returns the
    /// number of rows updated.
    pub fn apply_participant_matches(
        &self,
        matches: &[ParticipantMatch],
    ) -> Result<u64, DbError> {
        if matches.is_empty() {
            return Ok(0);
        }

        let bulk = self.with_transaction(|tx| {
            let mut updated = 0u64;
            for m in matches {
                updated += tx.apply_one_match(m)?;
            }
            Ok(updated)
        });

        match bulk {
            Ok(updated) => Ok(updated),
            Err(e) if e.is_structural() => Err(e),
            Err(e) => {
                log::warn!(
                    "bulk match update failed ({}), retrying {} rows individually",
                    e,
                    matches.len()
                );
                let mut updated = 0u64;
                for m in matches {
                    match self.apply_one_match(m) {
                        Ok(n) => updated += n,
                        Err(e) if e.is_structural() => return Err(e),
                        Err(e) => log::warn!(
                            "match update failed for {}/{}: {}",
                            m.comm_id,
                            m.role,
                            e
                        ),
                    }
                }
                Ok(updated)
            }
        }
    }

    fn apply_one_match(&self, m: &ParticipantMatch) -> Result<u64, DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        let n = self.conn.execute(
            "UPDATE participants SET
                contact_id = ?1, account_id = ?2, match_confidence = ?3, matched_at = ?4
             WHERE comm_id = ?5 AND address = ?6 AND role = ?7
               AND match_confidence IS NULL",
            params![
                m.contact_id,
                m.account_id,
                m.confidence,
                now,
                m.comm_id,
                m.address,
                m.role,
            ],
        )?;
        Ok(n as u64)
    }

    /// Copy sender-side matches up onto the parent communication rows.
    /// Sender roles are the originating side of each source's records.
    pub fn propagate_sender_matches(&self) -> Result<u64, DbError> {
        let n = self.conn.execute(
            "UPDATE communications SET
                matched_contact_id = (
                    SELECT p.contact_id FROM participants p
                    WHERE p.comm_id = communications.id
                      AND p.role IN ('from', 'caller', 'recipient')
                      AND p.contact_id IS NOT NULL
                    LIMIT 1
                ),
                matched_account_id = (
                    SELECT p.account_id FROM participants p
                    WHERE p.comm_id = communications.id
                      AND p.role IN ('from', 'caller', 'recipient')
                      AND p.contact_id IS NOT NULL
                    LIMIT 1
                ),
                match_confidence = (
                    SELECT p.match_confidence FROM participants p
                    WHERE p.comm_id = communications.id
                      AND p.role IN ('from', 'caller', 'recipient')
                      AND p.contact_id IS NOT NULL
                    LIMIT 1
                )
             WHERE matched_contact_id IS NULL
               AND EXISTS (
                    SELECT 1 FROM participants p
                    WHERE p.comm_id = communications.id
                      AND p.role IN ('from', 'caller', 'recipient')
                      AND p.contact_id IS NOT NULL
               )",
            [],
        )?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::writer::{CanonicalRecord, ContactRow};

    fn seed_contact(db: &Warehouse, id: &str, email: Option<&str>, phone: Option<&str>) {
        db.write_batch(&[CanonicalRecord::Contact(ContactRow {
            id: id.to_string(),
            account_id: Some(format!("acct-{id}")),
            name: id.to_string(),
            email: email.map(str::to_string),
            secondary_email: None,
            phone: phone.map(str::to_string),
            mobile_phone: None,
        })])
        .unwrap();
    }

    #[test]
    fn test_manual_mappings_bulk_lookup() {
        let db = Warehouse::open_in_memory().unwrap();
        db.upsert_manual_mapping("vip@corp.com", "email", Some("c-9"), Some("a-9"))
            .unwrap();

        let hits = db
            .manual_mappings_for(&["vip@corp.com".to_string(), "other@x.com".to_string()])
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits["vip@corp.com"].contact_id.as_deref(), Some("c-9"));
    }

    #[test]
    fn test_contacts_by_email_includes_secondary() {
        let db = Warehouse::open_in_memory().unwrap();
        seed_contact(&db, "c-1", Some("ana@acme.io"), None);
        db.conn_ref()
            .execute(
                "UPDATE contacts SET secondary_email = 'ana.alt@acme.io' WHERE id = 'c-1'",
                [],
            )
            .unwrap();

        let hits = db
            .contacts_by_email(&["ana@acme.io".to_string()])
            .unwrap();
        assert_eq!(hits["ana@acme.io"].contact_id.as_deref(), Some("c-1"));
        assert_eq!(hits["ana@acme.io"].account_id.as_deref(), Some("acct-c-1"));
    }

    #[test]
    fn test_contacts_by_phone_and_last10() {
        let db = Warehouse::open_in_memory().unwrap();
        seed_contact(&db, "c-2", None, Some("+12345678901"));

        let exact = db
            .contacts_by_phone(&["+12345678901".to_string()])
            .unwrap();
        assert_eq!(exact["+12345678901"].contact_id.as_deref(), Some("c-2"));

        let fuzzy = db.contacts_by_last10(&["2345678901".to_string()]).unwrap();
        assert_eq!(fuzzy["2345678901"].contact_id.as_deref(), Some("c-2"));
    }

    #[test]
    fn test_apply_match_is_conditional_on_unmatched() {
        let db = Warehouse::open_in_memory().unwrap();
        db.conn_ref()
            .execute(
                "INSERT INTO communications (id, source, fetched_at, created_at, updated_at)
                 VALUES ('m1', 'mailbox', 'x', 'x', 'x')",
                [],
            )
            .unwrap();
        db.conn_ref()
            .execute(
                "INSERT INTO participants (comm_id, address, role, normalized_key, key_kind)
                 VALUES ('m1', 'a@b.co', 'from', 'a@b.co', 'email')",
                [],
            )
            .unwrap();

        let m = ParticipantMatch {
            comm_id: "m1".to_string(),
            address: "a@b.co".to_string(),
            role: "from".to_string(),
            contact_id: Some("c-1".to_string()),
            account_id: None,
            confidence: "exact".to_string(),
        };
        assert_eq!(db.apply_participant_matches(&[m.clone()]).unwrap(), 1);
        // Second application is a no-op: the row is already matched.
        assert_eq!(db.apply_participant_matches(&[m]).unwrap(), 0);
    }

    #[test]
    fn test_propagate_sender_matches() {
        let db = Warehouse::open_in_memory().unwrap();
        db.conn_ref()
            .execute_batch(
                "INSERT INTO communications (id, source, fetched_at, created_at, updated_at)
                 VALUES ('m1', 'mailbox', 'x', 'x', 'x');
                 INSERT INTO participants (comm_id, address, role, contact_id, account_id, match_confidence)
                 VALUES ('m1', 'a@b.co', 'from', 'c-1', 'a-1', 'manual');",
            )
            .unwrap();

        assert_eq!(db.propagate_sender_matches().unwrap(), 1);
        let (cid, conf): (Option<String>, Option<String>) = db
            .conn_ref()
            .query_row(
                "SELECT matched_contact_id, match_confidence FROM communications WHERE id = 'm1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(cid.as_deref(), Some("c-1"));
        assert_eq!(conf.as_deref(), Some("manual"));
    }
}
