//! Sync run orchestration.
//!
//! One invocation drives the whole cycle: resolve the cursor, page through
//! the remote source, transform, write, advance the watermark and append
//! exactly one ledger row. Per-record failures degrade the run to partial;
//! only dead auth or an unusable warehouse aborts it. The cursor only moves
//! after the rows behind it are durably written, so a crash mid-run re-syncs
//! records instead of losing them.

pub mod transform;

use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::db::runs::{RunRecord, RunStatus, SyncMode};
use crate::db::writer::CanonicalRecord;
use crate::db::Warehouse;
use crate::error::{FetchError, RecordOutcome, RunError};
use crate::net::RateLimiter;
use crate::provider::IntelligenceProvider;
use crate::sources::{build_source, fetch_page, RemoteSource, SourceKind};

/// Running totals across pages.
#[derive(Default)]
struct Tally {
    /// Records listed by the source, whatever their outcome.
    fetched: usize,
    /// Source records whose rows were all durably written.
    processed: u64,
    /// Skipped, fetch-failed, transform-failed or write-rejected records.
    failed: u64,
    /// Highest position among durably written records.
    max_position: Option<String>,
    /// Provider-suggested watermark, adopted only from pages that landed.
    cursor_hint: Option<String>,
    /// The wall-clock budget stopped fetching before the source ran dry.
    truncated: bool,
    error: Option<String>,
}

impl Tally {
    fn note_position(&mut self, pos: &str) {
        if self.max_position.as_deref().map(|m| pos > m).unwrap_or(true) {
            self.max_position = Some(pos.to_string());
        }
    }
}

/// Sync one source. Validation failures (unknown or disabled source) are
/// rejected here, before any fetch and before a run record exists.
pub async fn run_sync(
    db: &Mutex<Warehouse>,
    config: &Config,
    provider: Option<&dyn IntelligenceProvider>,
    kind: SourceKind,
    scope: &str,
    mode: SyncMode,
) -> Result<RunRecord, RunError> {
    let source = build_source(kind, config)
        .ok_or_else(|| RunError::Validation(format!("source {kind} is not enabled")))?;
    run_sync_with(db, config, provider, source.as_ref(), scope, mode).await
}

/// Sync from an already-built source. The concrete client is behind the
/// trait so tests drive the full run against a scripted source.
pub async fn run_sync_with(
    db: &Mutex<Warehouse>,
    config: &Config,
    provider: Option<&dyn IntelligenceProvider>,
    source: &dyn RemoteSource,
    scope: &str,
    mode: SyncMode,
) -> Result<RunRecord, RunError> {
    let kind = source.kind().as_str();
    let run_id = Uuid::new_v4().to_string();
    let started_at = chrono::Utc::now().to_rfc3339();
    let limiter = RateLimiter::new(source.rate_limit_profile());

    let watermark = match mode {
        SyncMode::Full => None,
        SyncMode::Incremental => db.lock().await.watermark(kind, scope)?,
    };
    // Incremental without a stored cursor is a full scan.
    let mut effective_mode = if watermark.is_none() {
        SyncMode::Full
    } else {
        mode
    };
    log::info!(
        "sync {kind} scope={scope} mode={} from={:?}",
        effective_mode.as_str(),
        watermark
    );

    let mut tally = Tally::default();
    let outcome = drive_pages(
        db,
        config,
        provider,
        source,
        &limiter,
        watermark.as_deref(),
        &mut tally,
    )
    .await;

    match outcome {
        Ok(()) => {}
        // The provider no longer resolves our stored position. Drop the
        // cursor and rerun as a full scan within the same invocation.
        Err(RunError::Fetch(FetchError::WatermarkExpired))
            if effective_mode == SyncMode::Incremental =>
        {
            log::warn!("{kind} scope={scope}: watermark expired, restarting as full scan");
            db.lock().await.clear_watermark(kind, scope)?;
            effective_mode = SyncMode::Full;
            tally = Tally::default();
            if let Err(e) =
                drive_pages(db, config, provider, source, &limiter, None, &mut tally).await
            {
                tally.error = Some(e.to_string());
            }
        }
        Err(e) => {
            // A broken warehouse can't hold a ledger row either.
            if matches!(&e, RunError::Db(d) if d.is_structural()) {
                return Err(e);
            }
            log::error!("sync {kind} scope={scope} aborted: {e}");
            tally.error = Some(e.to_string());
        }
    }

    // Advance the cursor for whatever made it to disk, even on an aborted
    // run. The SQL-side guard keeps this monotonic.
    {
        let guard = db.lock().await;
        if let Some(pos) = &tally.max_position {
            guard.advance_watermark(kind, scope, pos)?;
        }
        if let Some(hint) = &tally.cursor_hint {
            guard.advance_watermark(kind, scope, hint)?;
        }
    }

    let status = if tally.error.is_some() || tally.failed > 0 {
        if tally.processed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    } else if tally.truncated {
        // Clean counts, but the source wasn't drained.
        RunStatus::Partial
    } else {
        RunStatus::Success
    };

    let run = RunRecord {
        id: run_id,
        source: kind.to_string(),
        scope: scope.to_string(),
        mode: effective_mode.as_str().to_string(),
        status: status.as_str().to_string(),
        processed: tally.processed,
        failed: tally.failed,
        matched: 0,
        started_at,
        finished_at: Some(chrono::Utc::now().to_rfc3339()),
        error: tally.error,
    };
    db.lock().await.record_run(&run)?;
    log::info!(
        "sync {kind} scope={scope} finished: status={} processed={} failed={}",
        run.status,
        run.processed,
        run.failed
    );
    Ok(run)
}

/// Page loop: fetch, transform, write, repeat until the source runs dry or
/// a safety cap fires. The record cap stops the loop cleanly; the wall-clock
/// budget marks the run truncated so it reports partial. Either way the
/// cursor reflects what was written, so the next run resumes here.
async fn drive_pages(
    db: &Mutex<Warehouse>,
    config: &Config,
    provider: Option<&dyn IntelligenceProvider>,
    source: &dyn RemoteSource,
    limiter: &RateLimiter,
    watermark: Option<&str>,
    tally: &mut Tally,
) -> Result<(), RunError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.run_budget_secs);
    let mut page_token: Option<String> = None;

    loop {
        let page = fetch_page(source, limiter, watermark, page_token.as_deref()).await?;

        let mut batch: Vec<CanonicalRecord> = Vec::new();
        // One entry per transformed source record: its stream position and
        // the range of rows it contributed to `batch`. A CRM record can
        // expand to several rows but still counts as one record.
        let mut pending: Vec<(String, std::ops::Range<usize>)> = Vec::new();
        for outcome in page.outcomes {
            tally.fetched += 1;
            match outcome {
                RecordOutcome::Ok(record) => {
                    match transform::transform_record(&record, &config.default_region) {
                        Ok(rows) => {
                            let start = batch.len();
                            batch.extend(rows);
                            let pos =
                                record.occurred_at.clone().unwrap_or_else(|| record.id.clone());
                            pending.push((pos, start..batch.len()));
                        }
                        Err(e) => {
                            log::warn!("transform failed: {e}");
                            tally.failed += 1;
                        }
                    }
                }
                RecordOutcome::Skipped { .. } | RecordOutcome::Failed { .. } => tally.failed += 1,
            }
        }

        // Best-effort embedding enrichment. Provider trouble is logged and
        // the row is written without a vector; a later re-sync can fill it.
        if let Some(provider) = provider {
            for row in &mut batch {
                let CanonicalRecord::Communication(comm) = row else {
                    continue;
                };
                if comm.embedding.is_some() {
                    continue;
                }
                let Some(body) = comm.body.as_deref() else {
                    continue;
                };
                match provider.embed(body).await {
                    Ok(vector) => comm.embedding = serde_json::to_string(&vector).ok(),
                    Err(e) => log::warn!("embedding skipped for {}: {e}", comm.id),
                }
            }
        }

        if !batch.is_empty() {
            let stats = db.lock().await.write_batch(&batch)?;
            let rejected: std::collections::HashSet<usize> =
                stats.rejected_rows.iter().copied().collect();
            for (pos, rows) in &pending {
                if rows.clone().any(|i| rejected.contains(&i)) {
                    // The cursor must stay behind a record that didn't land,
                    // so its position is never noted.
                    tally.failed += 1;
                } else {
                    tally.processed += 1;
                    tally.note_position(pos);
                }
            }
            // A hint is only trustworthy once the page it came with is on
            // disk; nothing written means nothing to advance over.
            if stats.written > 0 && page.cursor_hint.is_some() {
                tally.cursor_hint = page.cursor_hint;
            }
        }

        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
        if tally.fetched >= config.max_records_per_run {
            log::info!(
                "{}: record cap reached at {}, stopping early",
                source.kind(),
                tally.fetched
            );
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            log::info!("{}: run budget exhausted, stopping early", source.kind());
            tally.truncated = true;
            break;
        }
    }
    Ok(())
}
