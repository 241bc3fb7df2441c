use crate::daily::paths::EprofilePaths;
use crate::daily::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;

pub const AUDIT_FILE: &str = "audit.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn append_event(paths: &EprofilePaths, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = paths.logs_dir.join(AUDIT_FILE);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daily::paths::test_paths;
    use tempfile::tempdir;

    #[test]
    fn events_are_appended_as_json_lines() {
        let tmp = tempdir().expect("tempdir");
        let paths = test_paths(tmp.path());
        append_event(&paths, "concat", "ok", "wrote L2_X_A20210601.nc").expect("first");
        append_event(&paths, "promote", "retry", "transfer failed").expect("second");

        let raw = fs::read_to_string(paths.logs_dir.join(AUDIT_FILE)).expect("read");
        let events = raw
            .lines()
            .map(|l| serde_json::from_str::<AuditEvent>(l).expect("json"))
            .collect::<Vec<_>>();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, "concat");
        assert_eq!(events[1].status, "retry");
    }
}
