//! Tiered participant-to-contact matcher.
//!
//! A pass drains unmatched participants in bulk: dedupe their normalized
//! keys, run one directory query per tier, then resolve each participant in
//! strict priority order. Manual overrides always win, exact directory hits
//! come second, trailing-10-digit phone hits are last and labeled fuzzy.
//! Participants with no hit stay eligible — a later CRM sync can add the
//! contact they need — so a pass never marks them visited.

use std::collections::HashSet;

use uuid::Uuid;

use crate::db::directory::{DirectoryHit, ParticipantMatch};
use crate::db::runs::{RunRecord, RunStatus};
use crate::db::{DbError, Warehouse};
use crate::error::RunError;
use crate::normalize::last_n_digits;

/// How a participant was resolved. Ordering is the tier priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchConfidence {
    Manual,
    Exact,
    Fuzzy,
}

impl MatchConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchConfidence::Manual => "manual",
            MatchConfidence::Exact => "exact",
            MatchConfidence::Fuzzy => "fuzzy",
        }
    }
}

/// Accounting for one matcher pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchStats {
    /// Participants examined.
    pub processed: u64,
    /// Rows updated with a resolved contact.
    pub matched: u64,
    /// Participants with no directory hit in any tier.
    pub unmatched: u64,
    /// Resolutions that failed to apply (row changed underneath us).
    pub errors: u64,
}

/// Run one bounded matcher pass and append a ledger row for it, exactly
/// like a sync run. `batch_limit` caps the participants examined.
pub fn run_match_pass(db: &Warehouse, batch_limit: usize) -> Result<RunRecord, RunError> {
    let run_id = Uuid::new_v4().to_string();
    let started_at = chrono::Utc::now().to_rfc3339();

    let stats = match_batch(db, batch_limit)?;

    let status = if stats.errors == 0 {
        RunStatus::Success
    } else if stats.matched > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    };

    let run = RunRecord {
        id: run_id,
        source: "matcher".to_string(),
        scope: "default".to_string(),
        mode: "full".to_string(),
        status: status.as_str().to_string(),
        processed: stats.processed,
        failed: stats.errors,
        matched: stats.matched,
        started_at,
        finished_at: Some(chrono::Utc::now().to_rfc3339()),
        error: None,
    };
    db.record_run(&run)?;
    log::info!(
        "matcher pass finished: processed={} matched={} unmatched={}",
        stats.processed,
        stats.matched,
        stats.unmatched
    );
    Ok(run)
}

/// One batch: load, look up per tier, resolve, apply, propagate.
pub fn match_batch(db: &Warehouse, limit: usize) -> Result<MatchStats, DbError> {
    let participants = db.unmatched_participants(limit)?;
    let mut stats = MatchStats {
        processed: participants.len() as u64,
        ..MatchStats::default()
    };
    if participants.is_empty() {
        return Ok(stats);
    }

    // Dedupe keys per tier. Manual mappings are keyed by normalized address
    // or trailing digits, so phone keys contribute both forms.
    let mut email_keys: HashSet<String> = HashSet::new();
    let mut phone_keys: HashSet<String> = HashSet::new();
    let mut last10_keys: HashSet<String> = HashSet::new();
    for p in &participants {
        let Some(key) = p.normalized_key.as_deref() else {
            continue;
        };
        match p.key_kind.as_deref() {
            Some("email") => {
                email_keys.insert(key.to_string());
            }
            Some("phone") => {
                phone_keys.insert(key.to_string());
                if let Some(l) = last_n_digits(key, 10) {
                    last10_keys.insert(l);
                }
            }
            _ => {}
        }
    }

    let mut manual_keys: Vec<String> = email_keys
        .iter()
        .chain(phone_keys.iter())
        .chain(last10_keys.iter())
        .cloned()
        .collect();
    manual_keys.sort();
    manual_keys.dedup();
    let email_vec: Vec<String> = email_keys.into_iter().collect();
    let phone_vec: Vec<String> = phone_keys.into_iter().collect();
    let last10_vec: Vec<String> = last10_keys.into_iter().collect();

    // One query per tier, whatever the batch size.
    let manual = db.manual_mappings_for(&manual_keys)?;
    let by_email = db.contacts_by_email(&email_vec)?;
    let by_phone = db.contacts_by_phone(&phone_vec)?;
    let by_last10 = db.contacts_by_last10(&last10_vec)?;

    let mut matches: Vec<ParticipantMatch> = Vec::new();
    for p in &participants {
        let Some(key) = p.normalized_key.as_deref() else {
            stats.unmatched += 1;
            continue;
        };
        let resolved: Option<(&DirectoryHit, MatchConfidence)> = match p.key_kind.as_deref() {
            Some("email") => manual
                .get(key)
                .map(|h| (h, MatchConfidence::Manual))
                .or_else(|| by_email.get(key).map(|h| (h, MatchConfidence::Exact))),
            Some("phone") => {
                let last10 = last_n_digits(key, 10);
                manual
                    .get(key)
                    .map(|h| (h, MatchConfidence::Manual))
                    .or_else(|| {
                        last10
                            .as_deref()
                            .and_then(|l| manual.get(l))
                            .map(|h| (h, MatchConfidence::Manual))
                    })
                    .or_else(|| by_phone.get(key).map(|h| (h, MatchConfidence::Exact)))
                    .or_else(|| {
                        last10
                            .as_deref()
                            .and_then(|l| by_last10.get(l))
                            .map(|h| (h, MatchConfidence::Fuzzy))
                    })
            }
            _ => None,
        };

        match resolved {
            Some((hit, confidence)) => matches.push(ParticipantMatch {
                comm_id: p.comm_id.clone(),
                address: p.address.clone(),
                role: p.role.clone(),
                contact_id: hit.contact_id.clone(),
                account_id: hit.account_id.clone(),
                confidence: confidence.as_str().to_string(),
            }),
            None => stats.unmatched += 1,
        }
    }

    let applied = db.apply_participant_matches(&matches)?;
    stats.matched = applied;
    stats.errors = (matches.len() as u64).saturating_sub(applied);

    db.propagate_sender_matches()?;
    Ok(stats)
}
