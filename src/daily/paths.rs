use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EprofilePaths {
    pub home: PathBuf,
    pub incoming_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub ready_dir: PathBuf,
    pub archive_root: PathBuf,
    pub daily_archive_root: PathBuf,
    pub ledger_file: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<EprofilePaths> {
    let home_dir = required_home_dir()?;
    let home = env_or_default_path("EPROFILE_HOME", home_dir.join("eprofile"));

    let incoming_dir = env_or_default_path("EPROFILE_INCOMING_DIR", home.join("source_files"));
    let quarantine_dir = env_or_default_path("EPROFILE_QUARANTINE_DIR", home.join("quarantine"));
    let ready_dir = env_or_default_path("EPROFILE_READY_DIR", home.join("readyToIngest"));
    let archive_root = env_or_default_path("EPROFILE_ARCHIVE_ROOT", home.join("archive"));
    let daily_archive_root = env_or_default_path(
        "EPROFILE_DAILY_ARCHIVE_ROOT",
        archive_root.join("daily_files"),
    );
    let ledger_file = env_or_default_path(
        "EPROFILE_LEDGER_FILE",
        home.join("state").join("promotion_ledger.json"),
    );
    let logs_dir = env_or_default_path("EPROFILE_LOGS_DIR", home.join("logs"));

    Ok(EprofilePaths {
        home,
        incoming_dir,
        quarantine_dir,
        ready_dir,
        archive_root,
        daily_archive_root,
        ledger_file,
        logs_dir,
    })
}

#[cfg(test)]
pub(crate) fn test_paths(root: &std::path::Path) -> EprofilePaths {
    EprofilePaths {
        home: root.to_path_buf(),
        incoming_dir: root.join("source_files"),
        quarantine_dir: root.join("quarantine"),
        ready_dir: root.join("readyToIngest"),
        archive_root: root.join("archive"),
        daily_archive_root: root.join("archive/daily_files"),
        ledger_file: root.join("state/promotion_ledger.json"),
        logs_dir: root.join("logs"),
    }
}
