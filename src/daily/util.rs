use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Seconds since `path` was last modified, saturating at zero for clocks
/// that run behind the file system.
pub fn file_age_secs(path: &Path, now_epoch_secs: u64) -> Result<u64> {
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let modified_secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(now_epoch_secs.saturating_sub(modified_secs))
}

pub fn file_hash(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    match fs::rename(from, to) {
        Ok(_) => Ok(()),
        Err(rename_err) => {
            if matches!(
                rename_err.kind(),
                ErrorKind::CrossesDevices | ErrorKind::PermissionDenied
            ) {
                fs::copy(from, to).with_context(|| {
                    format!("failed to copy {} to {}", from.display(), to.display())
                })?;
                fs::remove_file(from)
                    .with_context(|| format!("failed to remove {}", from.display()))?;
                Ok(())
            } else {
                Err(rename_err).with_context(|| {
                    format!("failed to move {} to {}", from.display(), to.display())
                })
            }
        }
    }
}

/// Use `configured` when it names an existing file, otherwise look it up on
/// `PATH`.
pub fn resolve_bin(configured: &str) -> Result<PathBuf> {
    let candidate = Path::new(configured);
    if candidate.is_file() {
        return Ok(candidate.to_path_buf());
    }
    which::which(configured).with_context(|| format!("`{configured}` binary not found on PATH"))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Run `cmd` to completion, killing it after `timeout_secs`. Both pipes are
/// read on their own threads so a chatty child never stalls on a full pipe.
pub fn run_command_with_optional_timeout(
    cmd: &mut Command,
    timeout_secs: Option<u64>,
) -> Result<Output> {
    let Some(timeout_secs) = timeout_secs else {
        return Ok(cmd.output()?);
    };
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("command timed out after {timeout_secs}s");
        }
        thread::sleep(Duration::from_millis(50));
    };

    let join = |handle: thread::JoinHandle<Vec<u8>>| {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("output reader thread panicked"))
    };
    Ok(Output {
        status,
        stdout: join(stdout)?,
        stderr: join(stderr)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn move_file_creates_parent_and_removes_source() {
        let tmp = tempdir().expect("tempdir");
        let from = tmp.path().join("a.nc");
        let to = tmp.path().join("nested/dir/a.nc");
        fs::write(&from, "payload").expect("write");

        move_file(&from, &to).expect("move");

        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).expect("read"), "payload");
    }

    #[test]
    fn file_hash_is_stable_for_same_content() {
        let tmp = tempdir().expect("tempdir");
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&a, "same").expect("write a");
        fs::write(&b, "same").expect("write b");
        assert_eq!(file_hash(&a).expect("a"), file_hash(&b).expect("b"));
    }

    #[cfg(unix)]
    #[test]
    fn large_output_does_not_stall_a_timed_command() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("head -c 300000 /dev/zero; head -c 200000 /dev/zero >&2");
        let output = run_command_with_optional_timeout(&mut cmd, Some(20)).expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), 300_000);
        assert_eq!(output.stderr.len(), 200_000);
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_is_killed_at_the_deadline() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let err = run_command_with_optional_timeout(&mut cmd, Some(1)).expect_err("timeout");
        assert!(err.to_string().contains("timed out after 1s"));
    }
}
