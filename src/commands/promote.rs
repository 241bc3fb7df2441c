use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::daily::archive_path::{ArchivePathResolver, LookupTables};
use crate::daily::audit;
use crate::daily::cleaner::{ArrivalsDeleter, Cleaner, DirectDeleter, FragmentDeleter};
use crate::daily::config::{self, DeletionPolicy, EprofileConfig};
use crate::daily::dataset::JsonDatasetCodec;
use crate::daily::ledger::{FileLedger, PromotionLedger, PromotionRecord, PromotionState};
use crate::daily::paths::{EprofilePaths, resolve_paths};
use crate::daily::promotion::{PromotionPolicy, PromotionStateMachine, StepOutcome};
use crate::daily::transfer::{RemoteTransfer, RsyncTransfer};
use crate::daily::util::now_epoch_secs;
use crate::daily::warn::{self, WarnEvent};

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = config::load_config()?;
    let transfer = RsyncTransfer::new(
        cfg.transfer.rsync_bin.clone(),
        cfg.transfer.password_file.as_ref().map(PathBuf::from),
        cfg.transfer.timeout_secs,
    );
    run_with(&paths, &cfg, &transfer, now_epoch_secs()?)
}

fn deleter_for(cfg: &EprofileConfig) -> Option<Box<dyn FragmentDeleter>> {
    match cfg.cleanup.deletion {
        DeletionPolicy::NoDeletion => None,
        DeletionPolicy::Direct => Some(Box::new(DirectDeleter)),
        DeletionPolicy::Arrivals => Some(Box::new(ArrivalsDeleter::new(
            cfg.cleanup.arrivals_deleter_bin.clone(),
            cfg.transfer.timeout_secs,
        ))),
    }
}

pub fn run_with(
    paths: &EprofilePaths,
    cfg: &EprofileConfig,
    transfer: &dyn RemoteTransfer,
    now: u64,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("promote");
    let ledger = FileLedger::new(&paths.ledger_file);
    let records = match ledger.records() {
        Ok(records) => records,
        Err(err) => {
            report.issue(format!("{}: {err}", err.code().as_str()));
            return Ok(report);
        }
    };

    let tables = LookupTables::with_overrides(&cfg.lookup.instruments, &cfg.lookup.operators);
    let codec = JsonDatasetCodec;
    let machine = PromotionStateMachine::new(
        paths,
        &codec,
        transfer,
        ArchivePathResolver::new(&tables),
        PromotionPolicy::from(&cfg.promotion),
        Some(cfg.transfer.destination.clone()),
    );
    let deleter = deleter_for(cfg);
    report.detail(format!("ledger_file={}", ledger.path().display()));
    report.detail(format!("records={}", records.len()));
    report.detail(format!("deletion={}", cfg.cleanup.deletion.as_str()));

    let mut states = BTreeMap::new();
    for mut record in records {
        step_record(&mut report, paths, &ledger, &machine, &mut record, now);
        if let Some(deleter) = deleter.as_deref() {
            clean_record(&mut report, paths, &ledger, deleter, &mut record);
        }
        *states.entry(record.state.as_str()).or_insert(0usize) += 1;
    }
    for (state, count) in states {
        report.detail(format!("state.{state}={count}"));
    }
    Ok(report)
}

fn step_record(
    report: &mut CommandReport,
    paths: &EprofilePaths,
    ledger: &dyn PromotionLedger,
    machine: &PromotionStateMachine<'_>,
    record: &mut PromotionRecord,
    now: u64,
) {
    let outcome = machine.step(record, now);
    match &outcome {
        StepOutcome::NotEligible | StepOutcome::Terminal => return,
        StepOutcome::Waiting(reason) => {
            report.detail(format!("{}: waiting ({reason})", record.name));
            return;
        }
        StepOutcome::Promoted { from, to } => {
            let line = format!("{}: {} -> {}", record.name, from.as_str(), to.as_str());
            report.detail(line.clone());
            log_audit(paths, "ok", &line);
        }
        StepOutcome::Retry {
            retry_count,
            reason,
        } => {
            emit_failure(record, "retry-next-cycle", reason);
            report.issue(format!(
                "{}: promotion attempt {retry_count} failed: {reason}",
                record.name
            ));
            log_audit(paths, "retry", &format!("{}: {reason}", record.name));
        }
        StepOutcome::Failed(reason) => {
            emit_failure(record, "none", reason);
            report.issue(format!(
                "{}: promotion failed permanently after {} attempts: {reason}",
                record.name, record.retry_count
            ));
            log_audit(paths, "failed", &format!("{}: {reason}", record.name));
        }
    }

    if let Err(err) = ledger.upsert(record) {
        report.issue(format!("{}: {}: {err}", record.name, err.code().as_str()));
    }
}

fn clean_record(
    report: &mut CommandReport,
    paths: &EprofilePaths,
    ledger: &dyn PromotionLedger,
    deleter: &dyn FragmentDeleter,
    record: &mut PromotionRecord,
) {
    if record.state != PromotionState::Archived || record.cleaned {
        return;
    }
    let cleaner = Cleaner::new(deleter, &paths.archive_root, &paths.incoming_dir);
    let outcome = cleaner.clean(record);
    let line = format!(
        "{}: cleaned deleted={} pruned_dirs={}",
        record.name,
        outcome.deleted.len(),
        outcome.pruned.len()
    );
    report.detail(line.clone());
    for failure in &outcome.failures {
        warn::emit(WarnEvent {
            code: "CLEANUP_FAILED",
            stage: "cleanup",
            action: "delete-fragment",
            target: &record.name,
            source: "",
            retry: "retry-next-cycle",
            reason: "fragment-delete-failed",
            err: failure,
        });
        report.issue(format!("{}: cleanup: {failure}", record.name));
    }
    let status = if record.cleaned { "ok" } else { "partial" };
    if let Err(err) = audit::append_event(paths, "cleanup", status, &line) {
        report.issue(format!("audit log write failed: {err:#}"));
    }
    if let Err(err) = ledger.upsert(record) {
        report.issue(format!("{}: {}: {err}", record.name, err.code().as_str()));
    }
}

fn emit_failure(record: &PromotionRecord, retry: &str, reason: &str) {
    warn::emit(WarnEvent {
        code: "PROMOTION_ATTEMPT_FAILED",
        stage: "promote",
        action: record.state.as_str(),
        target: &record.name,
        source: "",
        retry,
        reason: "promotion-attempt-failed",
        err: reason,
    });
}

fn log_audit(paths: &EprofilePaths, status: &str, message: &str) {
    if let Err(err) = audit::append_event(paths, "promote", status, message) {
        eprintln!("eprofile audit warning: {err:#}");
    }
}
