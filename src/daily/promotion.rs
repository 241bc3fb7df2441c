//! Quarantine → ready-to-ingest → archived, with a bounded retry counter.
//!
//! A step never aborts the pass: every problem with a single record is
//! folded into that record as a failed attempt.

use crate::daily::archive_path::{ArchiveLocation, ArchivePathResolver, InstrumentMetadata};
use crate::daily::config::PromotionConfig;
use crate::daily::dataset::{Dataset, DatasetCodec};
use crate::daily::fragment::InstrumentDay;
use crate::daily::ledger::{PromotionRecord, PromotionState};
use crate::daily::paths::EprofilePaths;
use crate::daily::provenance::Provenance;
use crate::daily::transfer::{RemoteTransfer, destination_for};
use crate::daily::util::{file_age_secs, file_hash, move_file};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionPolicy {
    pub quarantine_secs: u64,
    pub settle_secs: u64,
    pub max_cycles: u32,
    pub attempts_per_cycle: u32,
    pub retry_interval_secs: u64,
}

impl From<&PromotionConfig> for PromotionPolicy {
    fn from(cfg: &PromotionConfig) -> Self {
        Self {
            quarantine_secs: cfg.quarantine_hours.saturating_mul(3_600),
            settle_secs: cfg.settle_secs,
            max_cycles: cfg.max_cycles,
            attempts_per_cycle: cfg.attempts_per_cycle,
            retry_interval_secs: cfg.retry_interval_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// `next_eligible` lies in the future.
    NotEligible,
    /// A time gate has not opened yet; no retry is consumed.
    Waiting(String),
    Promoted {
        from: PromotionState,
        to: PromotionState,
    },
    Retry {
        retry_count: u32,
        reason: String,
    },
    Failed(String),
    /// Archived or Failed; nothing left to do.
    Terminal,
}

impl StepOutcome {
    pub fn changed_record(&self) -> bool {
        matches!(
            self,
            Self::Promoted { .. } | Self::Retry { .. } | Self::Failed(_)
        )
    }
}

pub struct PromotionStateMachine<'a> {
    paths: &'a EprofilePaths,
    codec: &'a dyn DatasetCodec,
    transfer: &'a dyn RemoteTransfer,
    resolver: ArchivePathResolver<'a>,
    policy: PromotionPolicy,
    destination_base: Option<String>,
}

impl<'a> PromotionStateMachine<'a> {
    pub fn new(
        paths: &'a EprofilePaths,
        codec: &'a dyn DatasetCodec,
        transfer: &'a dyn RemoteTransfer,
        resolver: ArchivePathResolver<'a>,
        policy: PromotionPolicy,
        destination_base: Option<String>,
    ) -> Self {
        Self {
            paths,
            codec,
            transfer,
            resolver,
            policy,
            destination_base: destination_base.filter(|d| !d.trim().is_empty()),
        }
    }

    pub fn step(&self, record: &mut PromotionRecord, now: u64) -> StepOutcome {
        match record.state {
            PromotionState::Archived | PromotionState::Failed => return StepOutcome::Terminal,
            _ if !record.is_eligible(now) => return StepOutcome::NotEligible,
            _ => {}
        }

        let attempt = match record.state {
            PromotionState::Quarantine => self.leave_quarantine(record, now),
            PromotionState::ReadyToIngest => self.archive(record, now),
            PromotionState::Archived | PromotionState::Failed => return StepOutcome::Terminal,
        };
        match attempt {
            Ok(outcome) => {
                if outcome.changed_record() {
                    record.last_error = None;
                    record.updated_at_epoch_secs = now;
                }
                outcome
            }
            Err(reason) => self.record_failure(record, reason, now),
        }
    }

    fn leave_quarantine(
        &self,
        record: &mut PromotionRecord,
        now: u64,
    ) -> Result<StepOutcome, String> {
        let from = self.paths.quarantine_dir.join(&record.name);
        let to = self.paths.ready_dir.join(&record.name);

        // A crash between the move and the ledger write leaves the file
        // already in the ready tier.
        if !from.exists() && to.exists() {
            record.state = PromotionState::ReadyToIngest;
            return Ok(StepOutcome::Promoted {
                from: PromotionState::Quarantine,
                to: PromotionState::ReadyToIngest,
            });
        }

        let age = now.saturating_sub(record.quarantined_at_epoch_secs);
        if age < self.policy.quarantine_secs {
            return Ok(StepOutcome::Waiting(format!(
                "in quarantine for {age}s of {}s",
                self.policy.quarantine_secs
            )));
        }

        self.check_valid(&from)?;
        move_file(&from, &to).map_err(|err| format!("{err:#}"))?;
        record.state = PromotionState::ReadyToIngest;
        Ok(StepOutcome::Promoted {
            from: PromotionState::Quarantine,
            to: PromotionState::ReadyToIngest,
        })
    }

    fn archive(&self, record: &mut PromotionRecord, now: u64) -> Result<StepOutcome, String> {
        let local = self.paths.ready_dir.join(&record.name);
        let archived = StepOutcome::Promoted {
            from: PromotionState::ReadyToIngest,
            to: PromotionState::Archived,
        };

        if !local.exists() {
            // Delivered on an earlier pass that did not get to record it.
            if !record.provenance.is_empty() {
                record.state = PromotionState::Archived;
                return Ok(archived);
            }
            return Err(format!("{} is missing", local.display()));
        }

        let Some(base) = self.destination_base.as_deref() else {
            return Ok(StepOutcome::Waiting(
                "no transfer destination configured".to_string(),
            ));
        };

        let age = file_age_secs(&local, now).map_err(|err| format!("{err:#}"))?;
        if age < self.policy.settle_secs {
            return Ok(StepOutcome::Waiting(format!(
                "settling for {age}s of {}s",
                self.policy.settle_secs
            )));
        }

        let dataset = self.check_valid(&local)?;
        let day = InstrumentDay::from_daily_name(&record.name)
            .ok_or_else(|| format!("`{}` is not a daily file name", record.name))?;
        let location = self.capture(record, &dataset, &local, &day)?;

        // The archive already holds a version at least as large; the
        // delivery is skipped and the local copy dropped.
        let in_archive = location
            .daily_dir(&self.paths.daily_archive_root)
            .join(&record.name);
        if already_archived(&in_archive, &local) {
            fs::remove_file(&local).map_err(|err| format!("{}: {err}", local.display()))?;
            record.state = PromotionState::Archived;
            return Ok(archived);
        }

        let destination = destination_for(base, &day.wigos);
        let mut last_err = None;
        for _ in 0..self.policy.attempts_per_cycle {
            let delivered = self.transfer.deliver(&local, &destination);
            if !local.exists() {
                record.state = PromotionState::Archived;
                return Ok(archived);
            }
            last_err = Some(match delivered {
                Ok(()) => format!("{} still present after transfer", local.display()),
                Err(err) => err.to_string(),
            });
        }
        Err(last_err.unwrap_or_else(|| "no transfer attempted".to_string()))
    }

    /// Record what cleanup needs before the local copy disappears.
    fn capture(
        &self,
        record: &mut PromotionRecord,
        dataset: &Dataset,
        local: &Path,
        day: &InstrumentDay,
    ) -> Result<ArchiveLocation, String> {
        let provenance = Provenance::parse(dataset.attr_text("history").unwrap_or_default());
        let meta = InstrumentMetadata::from_dataset(dataset, local).map_err(|err| err.to_string())?;
        let location = self
            .resolver
            .resolve(&meta, day.date)
            .map_err(|err| err.to_string())?;

        record.provenance = provenance.names().map(str::to_string).collect();
        record.single_file_dir = Some(location.single_file_dir(&self.paths.archive_root));
        record.content_hash = Some(file_hash(local).map_err(|err| format!("{err:#}"))?);
        Ok(location)
    }

    fn check_valid(&self, path: &Path) -> Result<Dataset, String> {
        let meta = fs::metadata(path).map_err(|err| format!("{}: {err}", path.display()))?;
        if meta.len() == 0 {
            return Err(format!("{} is empty", path.display()));
        }
        self.codec.read(path).map_err(|err| err.to_string())
    }

    fn record_failure(
        &self,
        record: &mut PromotionRecord,
        reason: String,
        now: u64,
    ) -> StepOutcome {
        record.retry_count = record.retry_count.saturating_add(1);
        record.last_error = Some(reason.clone());
        record.updated_at_epoch_secs = now;
        if record.retry_count >= self.policy.max_cycles {
            record.state = PromotionState::Failed;
            return StepOutcome::Failed(reason);
        }
        record.next_eligible_epoch_secs = now.saturating_add(self.policy.retry_interval_secs);
        StepOutcome::Retry {
            retry_count: record.retry_count,
            reason,
        }
    }
}

fn already_archived(in_archive: &Path, local: &Path) -> bool {
    match (fs::metadata(in_archive), fs::metadata(local)) {
        (Ok(archived), Ok(local)) => archived.len() >= local.len(),
        _ => false,
    }
}
