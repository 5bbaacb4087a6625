//! Per-(source, scope) sync cursor store.
//!
//! The watermark is a single TEXT value — an RFC3339 timestamp or a
//! zero-padded source-native id — so lexicographic comparison is the
//! ordering. A keyed upsert with a SQL-side guard keeps it monotonic: a
//! concurrent or replayed writer can never move it backward.

use rusqlite::params;

use super::{DbError, Warehouse};

impl Warehouse {
    /// Last successfully processed position for a scope, if one exists.
    pub fn watermark(&self, source: &str, scope: &str) -> Result<Option<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT watermark FROM sync_cursors WHERE source = ?1 AND scope = ?2")?;
        let mut rows = stmt.query_map(params![source, scope], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Advance the watermark. Only called after the corresponding batch is
    /// durably written. The CASE guard rejects backward movement, so a
    /// crash-replay of an older batch leaves the cursor untouched.
    pub fn advance_watermark(
        &self,
        source: &str,
        scope: &str,
        new_watermark: &str,
    ) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO sync_cursors (source, scope, watermark, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source, scope) DO UPDATE SET
                watermark = CASE
                    WHEN excluded.watermark > sync_cursors.watermark THEN excluded.watermark
                    ELSE sync_cursors.watermark
                END,
                updated_at = excluded.updated_at",
            params![source, scope, new_watermark, now],
        )?;
        Ok(())
    }

    /// Drop a scope's cursor, forcing the next run into a full scan. Used
    /// when the provider reports the stored position is no longer
    /// resolvable.
    pub fn clear_watermark(&self, source: &str, scope: &str) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM sync_cursors WHERE source = ?1 AND scope = ?2",
            params![source, scope],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_absent_initially() {
        let db = Warehouse::open_in_memory().unwrap();
        assert!(db.watermark("mailbox", "acct-1").unwrap().is_none());
    }

    #[test]
    fn test_advance_and_read_back() {
        let db = Warehouse::open_in_memory().unwrap();
        db.advance_watermark("mailbox", "acct-1", "2026-02-01T00:00:00Z")
            .unwrap();
        assert_eq!(
            db.watermark("mailbox", "acct-1").unwrap().as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
    }

    #[test]
    fn test_watermark_never_moves_backward() {
        let db = Warehouse::open_in_memory().unwrap();
        db.advance_watermark("mailbox", "acct-1", "2026-02-05T00:00:00Z")
            .unwrap();
        db.advance_watermark("mailbox", "acct-1", "2026-02-01T00:00:00Z")
            .unwrap();
        assert_eq!(
            db.watermark("mailbox", "acct-1").unwrap().as_deref(),
            Some("2026-02-05T00:00:00Z")
        );
    }

    #[test]
    fn test_monotonic_over_run_sequence() {
        let db = Warehouse::open_in_memory().unwrap();
        let marks = [
            "2026-01-01T00:00:00Z",
            "2026-01-03T00:00:00Z",
            "2026-01-02T00:00:00Z", // replayed older batch
            "2026-01-09T00:00:00Z",
        ];
        let mut last = String::new();
        for m in marks {
            db.advance_watermark("crm", "default", m).unwrap();
            let current = db.watermark("crm", "default").unwrap().unwrap();
            assert!(current >= last, "watermark regressed: {last} -> {current}");
            last = current;
        }
        assert_eq!(last, "2026-01-09T00:00:00Z");
    }

    #[test]
    fn test_scopes_are_independent() {
        let db = Warehouse::open_in_memory().unwrap();
        db.advance_watermark("mailbox", "a", "2026-02-01T00:00:00Z")
            .unwrap();
        db.advance_watermark("mailbox", "b", "2026-01-01T00:00:00Z")
            .unwrap();
        assert_ne!(
            db.watermark("mailbox", "a").unwrap(),
            db.watermark("mailbox", "b").unwrap()
        );
    }

    #[test]
    fn test_clear_watermark() {
        let db = Warehouse::open_in_memory().unwrap();
        db.advance_watermark("mailbox", "a", "x").unwrap();
        db.clear_watermark("mailbox", "a").unwrap();
        assert!(db.watermark("mailbox", "a").unwrap().is_none());
    }
}
