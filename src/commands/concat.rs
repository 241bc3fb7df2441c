use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::commands::{CommandReport, error_code};
use crate::daily::archive_path::{ArchivePathResolver, LookupTables};
use crate::daily::audit;
use crate::daily::config::{self, EprofileConfig};
use crate::daily::dataset::JsonDatasetCodec;
use crate::daily::fragment::{Fragment, InstrumentDay, scan_incoming};
use crate::daily::ledger::{FileLedger, PromotionLedger, PromotionRecord, PromotionState};
use crate::daily::merge::{MergeEngine, MergeOutcome};
use crate::daily::paths::{EprofilePaths, resolve_paths};
use crate::daily::tier::TierResolver;
use crate::daily::util::file_hash;
use crate::daily::warn::{self, WarnEvent};

struct GroupContext<'a> {
    paths: &'a EprofilePaths,
    cfg: &'a EprofileConfig,
    tiers: TierResolver<'a>,
    engine: MergeEngine<'a>,
    ledger: &'a dyn PromotionLedger,
    now: DateTime<Utc>,
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = config::load_config()?;
    run_with(&paths, &cfg, Utc::now())
}

pub fn run_with(
    paths: &EprofilePaths,
    cfg: &EprofileConfig,
    now: DateTime<Utc>,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("concat");
    let scan = scan_incoming(&paths.incoming_dir)?;
    report.detail(format!("incoming_dir={}", paths.incoming_dir.display()));
    report.detail(format!("quarantine_dir={}", paths.quarantine_dir.display()));
    report.detail(format!("groups={}", scan.groups.len()));
    report.detail(format!("fragments={}", scan.fragment_count()));
    for name in &scan.skipped {
        report.detail(format!("skipped.unparseable={name}"));
    }

    let tables = LookupTables::with_overrides(&cfg.lookup.instruments, &cfg.lookup.operators);
    let codec = JsonDatasetCodec;
    let ledger = FileLedger::new(&paths.ledger_file);
    let ctx = GroupContext {
        paths,
        cfg,
        tiers: TierResolver::new(paths, &codec, ArchivePathResolver::new(&tables)),
        engine: MergeEngine::new(&codec, cfg.concat.tool_name.clone(), cfg.concat.history_tz()?),
        ledger: &ledger,
        now,
    };

    let mut written = 0usize;
    let mut unchanged = 0usize;
    let mut blocked = 0usize;
    for (day, fragments) in &scan.groups {
        let name = day.daily_file_name();
        match concat_group(&ctx, day, fragments) {
            Ok(GroupOutcome::Written(line)) => {
                written += 1;
                report.detail(line.clone());
                log_audit(paths, "ok", &line);
            }
            Ok(GroupOutcome::Unchanged) => {
                unchanged += 1;
                report.detail(format!("{name}: unchanged, all fragments already merged"));
            }
            Ok(GroupOutcome::Blocked { retry_count }) => {
                blocked += 1;
                let reason = format!(
                    "promotion failed permanently after {retry_count} attempts; \
                     {} fragment(s) left in incoming until the ledger record is reset",
                    fragments.len()
                );
                warn::emit(WarnEvent {
                    code: "PROMOTION_FAILED_BLOCKS_MERGE",
                    stage: "concat",
                    action: "merge-group",
                    target: &name,
                    source: &paths.incoming_dir.display().to_string(),
                    retry: "operator-reset",
                    reason: "record-failed",
                    err: &reason,
                });
                report.issue(format!("{name}: {reason}"));
                log_audit(paths, "blocked", &format!("{name}: {reason}"));
            }
            Err(err) => {
                let code = error_code(&err, "CONCAT_FAILED");
                warn::emit(WarnEvent {
                    code,
                    stage: "concat",
                    action: "merge-group",
                    target: &name,
                    source: &paths.incoming_dir.display().to_string(),
                    retry: "retry-next-run",
                    reason: "group-skipped",
                    err: &format!("{err:#}"),
                });
                report.issue(format!("{name}: {code}: {err:#}"));
                log_audit(paths, "failed", &format!("{name}: {err:#}"));
            }
        }
    }
    report.detail(format!("written={written}"));
    report.detail(format!("unchanged={unchanged}"));
    report.detail(format!("blocked={blocked}"));
    Ok(report)
}

enum GroupOutcome {
    Written(String),
    Unchanged,
    /// The day's ledger record is `Failed`; nothing is merged until an
    /// operator resets it.
    Blocked { retry_count: u32 },
}

/// Merge one instrument-day into quarantine and restart its promotion.
fn concat_group(
    ctx: &GroupContext<'_>,
    day: &InstrumentDay,
    fragments: &[Fragment],
) -> Result<GroupOutcome> {
    let name = day.daily_file_name();
    let existing = ctx.ledger.get(&name)?;
    if let Some(record) = existing.as_ref().filter(|r| r.state == PromotionState::Failed) {
        return Ok(GroupOutcome::Blocked {
            retry_count: record.retry_count,
        });
    }

    let prior = ctx.tiers.locate(day, fragments)?;

    let mut batch = fragments.to_vec();
    let mut backfilled = 0usize;
    if prior.is_some()
        && ctx.cfg.concat.backfill_archived_singles
        && fragments.len() < ctx.cfg.concat.full_day_fragments
    {
        let extra = ctx.tiers.archived_singles(day, fragments)?;
        backfilled = extra.len();
        batch.extend(extra);
    }

    let outcome = ctx.engine.merge(
        day,
        &batch,
        prior.as_ref(),
        &ctx.paths.quarantine_dir,
        ctx.now,
    )?;
    let MergeOutcome::Written {
        path,
        added,
        observations,
    } = outcome
    else {
        return Ok(GroupOutcome::Unchanged);
    };

    // The new version restarts promotion; only a failed record holds it back.
    let superseded = existing.map(|old| old.state.as_str());
    let now_secs = u64::try_from(ctx.now.timestamp()).unwrap_or(0);
    let record = PromotionRecord::quarantined(name, now_secs, file_hash(&path).ok());
    ctx.ledger.upsert(&record)?;

    let prior_note = prior
        .map(|hit| format!("prior={}", hit.tier))
        .unwrap_or_else(|| "prior=none".to_string());
    let mut line = format!(
        "{}: wrote {} ({prior_note} added={} backfilled={backfilled} observations={observations})",
        day,
        path.display(),
        added.len()
    );
    if let Some(state) = superseded {
        line.push_str(&format!(" superseded={state}"));
    }
    Ok(GroupOutcome::Written(line))
}

fn log_audit(paths: &EprofilePaths, status: &str, message: &str) {
    if let Err(err) = audit::append_event(paths, "concat", status, message) {
        warn::emit(WarnEvent {
            code: "AUDIT_WRITE_FAILED",
            stage: "concat",
            action: "append-audit",
            target: &paths.logs_dir.display().to_string(),
            source: "",
            retry: "none",
            reason: "audit-log-unwritable",
            err: &format!("{err:#}"),
        });
    }
}
