use crate::daily::ledger::{PromotionRecord, PromotionState};
use crate::daily::util::{resolve_bin, run_command_with_optional_timeout};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// day → month → year → instrument → station
const PRUNE_LEVELS: usize = 5;

pub trait FragmentDeleter {
    fn remove_file(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDeleter;

impl FragmentDeleter for DirectDeleter {
    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }
}

/// Hands each path to the external arrivals deleter (`<bin> <path>`), which
/// keeps the arrivals bookkeeping in sync with the removal.
#[derive(Debug, Clone)]
pub struct ArrivalsDeleter {
    bin: String,
    timeout_secs: Option<u64>,
}

impl ArrivalsDeleter {
    pub fn new(bin: impl Into<String>, timeout_secs: Option<u64>) -> Self {
        Self {
            bin: bin.into(),
            timeout_secs,
        }
    }
}

impl FragmentDeleter for ArrivalsDeleter {
    fn remove_file(&self, path: &Path) -> Result<()> {
        let bin = resolve_bin(&self.bin)?;
        let mut cmd = Command::new(&bin);
        cmd.arg(path);
        let output = run_command_with_optional_timeout(&mut cmd, self.timeout_secs)
            .with_context(|| format!("failed to run `{}`", bin.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "arrivals deleter failed for {}\nstderr: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub deleted: Vec<PathBuf>,
    pub pruned: Vec<PathBuf>,
    pub failures: Vec<String>,
}

pub struct Cleaner<'a> {
    deleter: &'a dyn FragmentDeleter,
    archive_root: &'a Path,
    incoming_dir: &'a Path,
}

impl<'a> Cleaner<'a> {
    pub fn new(
        deleter: &'a dyn FragmentDeleter,
        archive_root: &'a Path,
        incoming_dir: &'a Path,
    ) -> Self {
        Self {
            deleter,
            archive_root,
            incoming_dir,
        }
    }

    /// Delete the fragments recorded in an archived record's provenance.
    /// Records in any other state are left alone.
    pub fn clean(&self, record: &mut PromotionRecord) -> CleanupOutcome {
        let mut out = CleanupOutcome::default();
        if record.state != PromotionState::Archived || record.cleaned {
            return out;
        }

        let mut dirs = Vec::with_capacity(2);
        if let Some(single) = &record.single_file_dir {
            dirs.push(single.clone());
        }
        dirs.push(self.incoming_dir.to_path_buf());

        for name in &record.provenance {
            for dir in &dirs {
                let path = dir.join(name);
                if !path.is_file() {
                    continue;
                }
                match self.deleter.remove_file(&path) {
                    Ok(()) => out.deleted.push(path),
                    Err(err) => out.failures.push(format!("{err:#}")),
                }
            }
        }

        if let Some(single) = &record.single_file_dir {
            match prune_empty_ancestors(single, self.archive_root, PRUNE_LEVELS) {
                Ok(mut pruned) => out.pruned.append(&mut pruned),
                Err(err) => out.failures.push(format!("{err:#}")),
            }
        }

        if out.failures.is_empty() {
            record.cleaned = true;
        }
        out
    }
}

/// Remove `start` and then its parents while they are empty, at most
/// `levels` directories and never `root` or anything outside it.
pub fn prune_empty_ancestors(start: &Path, root: &Path, levels: usize) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut current = Some(start);
    for _ in 0..levels {
        let Some(dir) = current else {
            break;
        };
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if dir.exists() {
            let mut entries =
                fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
            if entries.next().is_some() {
                break;
            }
            fs::remove_dir(dir).with_context(|| format!("failed to remove {}", dir.display()))?;
            removed.push(dir.to_path_buf());
        }
        current = dir.parent();
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FRAG_A: &str = "L2_0-20000-0-06610_A202106010000.nc";
    const FRAG_B: &str = "L2_0-20000-0-06610_A202106010005.nc";

    fn archived_record(single: &Path) -> PromotionRecord {
        let mut record = PromotionRecord::quarantined("L2_0-20000-0-06610_A20210601.nc", 0, None);
        record.state = PromotionState::Archived;
        record.provenance = vec![FRAG_A.to_string(), FRAG_B.to_string()];
        record.single_file_dir = Some(single.to_path_buf());
        record
    }

    #[test]
    fn deletes_fragments_and_prunes_up_to_first_non_empty_dir() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("archive");
        let station = root.join("switzerland/payerne");
        let single = station.join("meteoswiss-lufft-chm15k_X/2021/06/01");
        let sibling = station.join("meteoswiss-vaisala-cl51_Y");
        let incoming = tmp.path().join("incoming");
        for dir in [&single, &sibling, &incoming] {
            fs::create_dir_all(dir).expect("mkdir");
        }
        fs::write(single.join(FRAG_A), "a").expect("a");
        fs::write(incoming.join(FRAG_B), "b").expect("b");
        fs::write(incoming.join("unrelated.nc"), "c").expect("c");

        let mut record = archived_record(&single);
        let outcome = Cleaner::new(&DirectDeleter, &root, &incoming).clean(&mut record);

        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.deleted.len(), 2);
        assert!(record.cleaned);
        assert!(!station.join("meteoswiss-lufft-chm15k_X").exists());
        assert!(sibling.exists());
        assert!(incoming.join("unrelated.nc").exists());
    }

    #[test]
    fn non_archived_records_are_never_cleaned() {
        let tmp = tempdir().expect("tempdir");
        let single = tmp.path().join("archive/a/b/c/2021/06/01");
        fs::create_dir_all(&single).expect("mkdir");
        fs::write(single.join(FRAG_A), "a").expect("a");

        let mut record = archived_record(&single);
        record.state = PromotionState::ReadyToIngest;
        let outcome = Cleaner::new(&DirectDeleter, &tmp.path().join("archive"), tmp.path())
            .clean(&mut record);

        assert_eq!(outcome, CleanupOutcome::default());
        assert!(single.join(FRAG_A).exists());
        assert!(!record.cleaned);
    }

    #[test]
    fn pruning_stops_at_root() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("archive");
        let leaf = root.join("x/y");
        fs::create_dir_all(&leaf).expect("mkdir");

        let removed = prune_empty_ancestors(&leaf, &root, 5).expect("prune");
        assert_eq!(removed, vec![root.join("x/y"), root.join("x")]);
        assert!(root.exists());
    }

    #[test]
    fn pruning_outside_root_is_refused() {
        let tmp = tempdir().expect("tempdir");
        let outside = tmp.path().join("elsewhere");
        fs::create_dir_all(&outside).expect("mkdir");
        let removed =
            prune_empty_ancestors(&outside, &tmp.path().join("archive"), 5).expect("prune");
        assert!(removed.is_empty());
        assert!(outside.exists());
    }

    struct FailingDeleter;

    impl FragmentDeleter for FailingDeleter {
        fn remove_file(&self, path: &Path) -> Result<()> {
            anyhow::bail!("permission denied for {}", path.display())
        }
    }

    #[test]
    fn failed_deletion_leaves_record_uncleaned() {
        let tmp = tempdir().expect("tempdir");
        let single = tmp.path().join("archive/a/b/c/2021/06/01");
        fs::create_dir_all(&single).expect("mkdir");
        fs::write(single.join(FRAG_A), "a").expect("a");

        let mut record = archived_record(&single);
        let outcome = Cleaner::new(&FailingDeleter, &tmp.path().join("archive"), tmp.path())
            .clean(&mut record);
        assert_eq!(outcome.failures.len(), 1);
        assert!(!record.cleaned);
        assert!(single.join(FRAG_A).exists());
    }
}
