use crate::error::{EprofileError, EprofileResult};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionState {
    Quarantine,
    ReadyToIngest,
    Archived,
    Failed,
}

impl PromotionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quarantine => "quarantine",
            Self::ReadyToIngest => "ready_to_ingest",
            Self::Archived => "archived",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionRecord {
    pub name: String,
    pub state: PromotionState,
    pub retry_count: u32,
    pub next_eligible_epoch_secs: u64,
    pub quarantined_at_epoch_secs: u64,
    pub content_hash: Option<String>,
    pub provenance: Vec<String>,
    pub single_file_dir: Option<PathBuf>,
    pub cleaned: bool,
    pub last_error: Option<String>,
    pub updated_at_epoch_secs: u64,
}

impl Default for PromotionRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            state: PromotionState::Quarantine,
            retry_count: 0,
            next_eligible_epoch_secs: 0,
            quarantined_at_epoch_secs: 0,
            content_hash: None,
            provenance: Vec::new(),
            single_file_dir: None,
            cleaned: false,
            last_error: None,
            updated_at_epoch_secs: 0,
        }
    }
}

impl PromotionRecord {
    /// Fresh record for a daily file that has just been (re)written into
    /// quarantine.
    pub fn quarantined(name: impl Into<String>, now_epoch_secs: u64, hash: Option<String>) -> Self {
        Self {
            name: name.into(),
            quarantined_at_epoch_secs: now_epoch_secs,
            content_hash: hash,
            updated_at_epoch_secs: now_epoch_secs,
            ..Self::default()
        }
    }

    pub fn is_eligible(&self, now_epoch_secs: u64) -> bool {
        self.next_eligible_epoch_secs <= now_epoch_secs
    }
}

pub trait PromotionLedger {
    fn get(&self, name: &str) -> EprofileResult<Option<PromotionRecord>>;
    fn upsert(&self, record: &PromotionRecord) -> EprofileResult<()>;
    fn records(&self) -> EprofileResult<Vec<PromotionRecord>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct LedgerFile {
    schema_version: u32,
    records: BTreeMap<String, PromotionRecord>,
}

/// Ledger kept as one JSON document. Every access holds an advisory lock on
/// a sibling `.lock` file; writes go through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileLedger {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "promotion_ledger".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn err(&self, reason: impl Into<String>) -> EprofileError {
        EprofileError::Ledger {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn with_lock<T>(
        &self,
        exclusive: bool,
        op: impl FnOnce(&mut LedgerFile) -> EprofileResult<(T, bool)>,
    ) -> EprofileResult<T> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| self.err(format!("failed to create {}: {e}", parent.display())))?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                self.err(format!(
                    "failed to open lock {}: {e}",
                    self.lock_path.display()
                ))
            })?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&lock_file)
        } else {
            FileExt::lock_shared(&lock_file)
        };
        locked.map_err(|e| self.err(format!("failed to lock: {e}")))?;

        let mut ledger = self.load()?;
        let (out, dirty) = op(&mut ledger)?;
        if dirty {
            self.save(&ledger)?;
        }
        drop(lock_file);
        Ok(out)
    }

    fn load(&self) -> EprofileResult<LedgerFile> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(LedgerFile {
                    schema_version: 1,
                    ..LedgerFile::default()
                });
            }
            Err(e) => return Err(self.err(format!("failed to read: {e}"))),
        };
        serde_json::from_str(&raw).map_err(|e| self.err(format!("failed to parse: {e}")))
    }

    fn save(&self, ledger: &LedgerFile) -> EprofileResult<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| self.err("ledger path has no parent"))?;
        let data = serde_json::to_vec_pretty(ledger).map_err(|e| self.err(e.to_string()))?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| self.err(format!("failed to create temp file: {e}")))?;
        temp.write_all(&data)
            .and_then(|_| temp.write_all(b"\n"))
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| self.err(format!("failed to write temp file: {e}")))?;
        temp.persist(&self.path)
            .map_err(|e| self.err(format!("failed to persist: {e}")))?;
        Ok(())
    }
}

impl PromotionLedger for FileLedger {
    fn get(&self, name: &str) -> EprofileResult<Option<PromotionRecord>> {
        self.with_lock(false, |ledger| Ok((ledger.records.get(name).cloned(), false)))
    }

    fn upsert(&self, record: &PromotionRecord) -> EprofileResult<()> {
        if record.name.trim().is_empty() {
            return Err(self.err("record name cannot be empty"));
        }
        self.with_lock(true, |ledger| {
            if ledger.schema_version == 0 {
                ledger.schema_version = 1;
            }
            ledger
                .records
                .insert(record.name.clone(), record.clone());
            Ok(((), true))
        })
    }

    fn records(&self) -> EprofileResult<Vec<PromotionRecord>> {
        self.with_lock(false, |ledger| {
            Ok((ledger.records.values().cloned().collect(), false))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_ledger_reads_empty() {
        let tmp = tempdir().expect("tempdir");
        let ledger = FileLedger::new(tmp.path().join("state/ledger.json"));
        assert!(ledger.records().expect("records").is_empty());
        assert!(ledger.get("L2_X_A20210601.nc").expect("get").is_none());
    }

    #[test]
    fn upsert_replaces_record_by_name() {
        let tmp = tempdir().expect("tempdir");
        let ledger = FileLedger::new(tmp.path().join("state/ledger.json"));
        let mut record = PromotionRecord::quarantined("L2_X_A20210601.nc", 100, None);
        ledger.upsert(&record).expect("insert");

        record.state = PromotionState::ReadyToIngest;
        record.retry_count = 2;
        ledger.upsert(&record).expect("update");

        let all = ledger.records().expect("records");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, PromotionState::ReadyToIngest);
        assert_eq!(all[0].retry_count, 2);
        assert!(tmp.path().join("state/ledger.json.lock").exists());
    }

    #[test]
    fn corrupt_ledger_is_an_error() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.json");
        fs::write(&path, "{not json").expect("write");
        let err = FileLedger::new(&path).records().expect_err("corrupt");
        assert!(matches!(err, EprofileError::Ledger { .. }));
    }

    #[test]
    fn eligibility_follows_next_eligible_time() {
        let mut record = PromotionRecord::quarantined("x", 0, None);
        record.next_eligible_epoch_secs = 50;
        assert!(!record.is_eligible(49));
        assert!(record.is_eligible(50));
    }
}
