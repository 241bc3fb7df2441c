use anyhow::Result;
use std::collections::BTreeMap;
use std::env;

use crate::commands::CommandReport;
use crate::daily::archive_path::LookupTables;
use crate::daily::config;
use crate::daily::ledger::{FileLedger, PromotionLedger, PromotionState};
use crate::daily::paths::resolve_paths;

include!(concat!(env!("OUT_DIR"), "/eprofile_env_allowlist.rs"));

fn overridden_env_keys() -> Vec<&'static str> {
    GENERATED_EPROFILE_ENV_ALLOWLIST
        .iter()
        .copied()
        .filter(|key| env::var_os(key).is_some_and(|v| !v.is_empty()))
        .collect()
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("build_uuid={}", env!("BUILD_UUID")));
    report.detail(format!("home={}", paths.home.display()));
    for (name, path) in [
        ("incoming_dir", &paths.incoming_dir),
        ("quarantine_dir", &paths.quarantine_dir),
        ("ready_dir", &paths.ready_dir),
        ("archive_root", &paths.archive_root),
        ("daily_archive_root", &paths.daily_archive_root),
        ("logs_dir", &paths.logs_dir),
    ] {
        let state = if path.exists() { "ok" } else { "missing" };
        report.detail(format!("path.{name}={} ({state})", path.display()));
    }
    if !paths.incoming_dir.exists() {
        report.issue(format!(
            "missing incoming dir {} (set EPROFILE_INCOMING_DIR)",
            paths.incoming_dir.display()
        ));
    }

    match config::resolve_config_path() {
        Some(path) if path.exists() => report.detail(format!("config_file={}", path.display())),
        Some(path) => report.detail(format!("config_file={} (absent, defaults)", path.display())),
        None => report.detail("config_file=unresolved (defaults)"),
    }
    match config::load_config() {
        Ok(cfg) => {
            let tables =
                LookupTables::with_overrides(&cfg.lookup.instruments, &cfg.lookup.operators);
            let (instruments, operators) = tables.counts();
            report.detail(format!("concat.tool_name={}", cfg.concat.tool_name));
            report.detail(format!("concat.history_timezone={}", cfg.concat.history_timezone));
            report.detail(format!(
                "concat.backfill_archived_singles={}",
                cfg.concat.backfill_archived_singles
            ));
            report.detail(format!("promotion.quarantine_hours={}", cfg.promotion.quarantine_hours));
            report.detail(format!("promotion.settle_secs={}", cfg.promotion.settle_secs));
            report.detail(format!("promotion.max_cycles={}", cfg.promotion.max_cycles));
            report.detail(format!(
                "promotion.attempts_per_cycle={}",
                cfg.promotion.attempts_per_cycle
            ));
            report.detail(format!("cleanup.deletion={}", cfg.cleanup.deletion.as_str()));
            report.detail(format!("lookup.instruments={instruments}"));
            report.detail(format!("lookup.operators={operators}"));
            if cfg.transfer.destination.is_empty() {
                report.issue(
                    "transfer destination not set (EPROFILE_TRANSFER_DEST or [transfer].destination)",
                );
            } else {
                report.detail(format!("transfer.destination={}", cfg.transfer.destination));
            }
        }
        Err(err) => report.issue(format!("config invalid: {err:#}")),
    }

    let ledger = FileLedger::new(&paths.ledger_file);
    report.detail(format!("ledger_file={}", ledger.path().display()));
    match ledger.records() {
        Ok(records) => {
            let mut counts = BTreeMap::new();
            for record in &records {
                *counts.entry(record.state).or_insert(0usize) += 1;
            }
            for (state, count) in &counts {
                report.detail(format!("ledger.{}={count}", state.as_str()));
            }
            let pending_cleanup = records
                .iter()
                .filter(|r| r.state == PromotionState::Archived && !r.cleaned)
                .count();
            report.detail(format!("ledger.pending_cleanup={pending_cleanup}"));
            if let Some(failed) = counts.get(&PromotionState::Failed) {
                report.issue(format!(
                    "{failed} daily file(s) failed promotion permanently; see ledger last_error"
                ));
            }
        }
        Err(err) => report.issue(format!("{}: {err}", err.code().as_str())),
    }

    let overrides = overridden_env_keys();
    report.detail(format!(
        "env.overrides={}",
        if overrides.is_empty() {
            "none".to_string()
        } else {
            overrides.join(",")
        }
    ));

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::GENERATED_EPROFILE_ENV_ALLOWLIST;

    #[test]
    fn allowlist_covers_path_and_config_keys() {
        for key in ["EPROFILE_HOME", "EPROFILE_CONFIG_PATH", "EPROFILE_TRANSFER_DEST"] {
            assert!(GENERATED_EPROFILE_ENV_ALLOWLIST.contains(&key), "{key}");
        }
    }
}
