use crate::daily::util::{resolve_bin, run_command_with_optional_timeout};
use crate::error::{EprofileError, EprofileResult};
use std::path::{Path, PathBuf};
use std::process::Command;

pub trait RemoteTransfer {
    /// Push `local` to `destination`. The local file is expected to be gone
    /// afterwards; callers confirm success by its absence.
    fn deliver(&self, local: &Path, destination: &str) -> EprofileResult<()>;
}

/// `<base>/block-NN/` when the fourth `-` part of the WIGOS id has five
/// characters (a WMO block and station number), `<base>/misc/` otherwise.
pub fn destination_for(base: &str, wigos: &str) -> String {
    let base = base.trim_end_matches('/');
    match wigos.split('-').nth(3) {
        Some(station) if station.chars().count() == 5 => {
            let block: String = station.chars().take(2).collect();
            format!("{base}/block-{block}/")
        }
        _ => format!("{base}/misc/"),
    }
}

#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    bin: String,
    password_file: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

impl RsyncTransfer {
    pub fn new(
        bin: impl Into<String>,
        password_file: Option<PathBuf>,
        timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            bin: bin.into(),
            password_file,
            timeout_secs,
        }
    }
}

impl RemoteTransfer for RsyncTransfer {
    fn deliver(&self, local: &Path, destination: &str) -> EprofileResult<()> {
        let failure = |reason: String| EprofileError::TransferFailure {
            path: local.to_path_buf(),
            destination: destination.to_string(),
            reason,
        };
        let bin = resolve_bin(&self.bin).map_err(|err| failure(format!("{err:#}")))?;

        let mut cmd = Command::new(&bin);
        cmd.arg("-av");
        if let Some(password_file) = &self.password_file {
            cmd.arg(format!("--password-file={}", password_file.display()));
        }
        cmd.arg("--remove-source-files").arg(local).arg(destination);

        let output = run_command_with_optional_timeout(&mut cmd, self.timeout_secs)
            .map_err(|err| failure(format!("failed to run `{}`: {err:#}", bin.display())))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(failure(format!(
                "rsync exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if !stderr.trim().is_empty() {
            return Err(failure(format!("rsync reported: {}", stderr.trim())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wmo_station_ids_route_to_block_dirs() {
        assert_eq!(
            destination_for("eprofile@arrivals::incoming/", "0-20000-0-06610"),
            "eprofile@arrivals::incoming/block-06/"
        );
        assert_eq!(
            destination_for("eprofile@arrivals::incoming", "0-20008-0-UGR"),
            "eprofile@arrivals::incoming/misc/"
        );
        assert_eq!(destination_for("/remote", "12345"), "/remote/misc/");
    }

    #[cfg(unix)]
    #[test]
    fn rsync_stderr_counts_as_failure() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let script = tmp.path().join("fake-rsync");
        std::fs::write(&script, "#!/bin/sh\necho 'auth failed' >&2\nexit 0\n").expect("script");
        let mut perms = std::fs::metadata(&script).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).expect("chmod");
        let local = tmp.path().join("L2_X_A20210601.nc");
        std::fs::write(&local, "{}").expect("local");

        let transfer = RsyncTransfer::new(script.to_string_lossy(), None, Some(5));
        let err = transfer.deliver(&local, "/remote/misc/").expect_err("stderr");
        assert!(matches!(err, EprofileError::TransferFailure { .. }));
        assert!(err.to_string().contains("auth failed"));
    }
}
