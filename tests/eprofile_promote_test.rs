use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const FRAGMENT: &str = "L2_0-20000-0-06610_A202106010000.nc";
const DAILY: &str = "L2_0-20000-0-06610_A20210601.nc";

fn write_fragment(dir: &Path) {
    fs::create_dir_all(dir).expect("mkdir incoming");
    let body = json!({
        "dims": { "time": 1 },
        "attrs": {
            "title": "E-PROFILE ALC METEOSWISS",
            "site_location": "Payerne_ALC,Switzerland",
            "instrument_type": "CHM15k",
            "instrument_id": "TUB140005"
        },
        "variables": {
            "time": {
                "dims": ["time"],
                "dtype": "float64",
                "attrs": { "units": "days since 1970-01-01 00:00:00.000" },
                "values": [18779.0]
            },
            "cloud_base_height": {
                "dims": ["time"],
                "dtype": "float32",
                "values": [850.0]
            }
        }
    });
    fs::write(dir.join(FRAGMENT), serde_json::to_vec(&body).expect("json")).expect("write");
}

fn write_script(path: &Path, script: &str) {
    fs::write(path, script).expect("write fake rsync");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }
}

fn write_fake_rsync(path: &Path) {
    write_script(
        path,
        r#"#!/usr/bin/env bash
set -euo pipefail
src="${@: -2:1}"
dest="${@: -1}"
mkdir -p "$dest"
cp "$src" "$dest"
rm "$src"
echo "sent 1 file"
"#,
    );
}

fn write_failing_rsync(path: &Path) {
    write_script(
        path,
        "#!/usr/bin/env bash\necho '@ERROR: auth failed on module eprofile' >&2\nexit 5\n",
    );
}

fn eprofile_cmd(home: &Path, rsync: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("eprofile-daily");
    cmd.current_dir(home)
        .env("EPROFILE_HOME", home)
        .env("EPROFILE_CONFIG_PATH", home.join("eprofile.toml"))
        .env("EPROFILE_QUARANTINE_HOURS", "0")
        .env("EPROFILE_SETTLE_SECS", "0")
        .env("EPROFILE_RSYNC_BIN", rsync)
        .env("EPROFILE_TRANSFER_DEST", home.join("remote"));
    cmd
}

fn ledger_record(home: &Path) -> Value {
    let raw = fs::read(home.join("state/promotion_ledger.json")).expect("ledger");
    let ledger: Value = serde_json::from_slice(&raw).expect("ledger json");
    ledger["records"][DAILY].clone()
}

#[cfg(unix)]
#[test]
fn cycle_then_promote_archives_and_cleans_fragments() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    let rsync = home.join("fake-rsync");
    write_fake_rsync(&rsync);
    write_fragment(&home.join("source_files"));

    eprofile_cmd(home, &rsync)
        .env("EPROFILE_DELETION", "direct")
        .arg("cycle")
        .assert()
        .success()
        .stdout(predicate::str::contains("quarantine -> ready_to_ingest"));
    assert!(home.join("readyToIngest").join(DAILY).exists());
    assert_eq!(ledger_record(home)["state"], "ready_to_ingest");

    eprofile_cmd(home, &rsync)
        .env("EPROFILE_DELETION", "direct")
        .arg("promote")
        .assert()
        .success()
        .stdout(predicate::str::contains("ready_to_ingest -> archived"));

    assert!(home.join("remote/block-06").join(DAILY).exists());
    assert!(!home.join("readyToIngest").join(DAILY).exists());
    assert!(!home.join("source_files").join(FRAGMENT).exists());

    let record = ledger_record(home);
    assert_eq!(record["state"], "archived");
    assert_eq!(record["cleaned"], true);
    assert_eq!(record["provenance"], json!([FRAGMENT]));
    assert!(
        record["single_file_dir"]
            .as_str()
            .expect("single dir")
            .ends_with("archive/switzerland/payerne/meteoswiss-lufft-chm15k_TUB140005/2021/06/01")
    );
}

#[cfg(unix)]
#[test]
fn exhausted_retries_mark_record_failed() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    let rsync = home.join("fake-rsync");
    write_failing_rsync(&rsync);
    write_fragment(&home.join("source_files"));

    eprofile_cmd(home, &rsync).arg("cycle").assert().success();

    eprofile_cmd(home, &rsync)
        .env("EPROFILE_MAX_CYCLES", "1")
        .arg("promote")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("failed permanently"))
        .stderr(predicate::str::contains("EPROFILE_WARN code=PROMOTION_ATTEMPT_FAILED"));

    let record = ledger_record(home);
    assert_eq!(record["state"], "failed");
    assert_eq!(record["retry_count"], 1);
    assert!(
        record["last_error"]
            .as_str()
            .expect("last error")
            .contains("auth failed")
    );
    assert!(home.join("readyToIngest").join(DAILY).exists());
    assert!(home.join("source_files").join(FRAGMENT).exists());

    eprofile_cmd(home, &rsync)
        .arg("status")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("ledger.failed=1"));
}

#[test]
fn status_lists_env_overrides() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    fs::create_dir_all(home.join("source_files")).expect("incoming");

    eprofile_cmd(home, Path::new("rsync"))
        .arg("--json")
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("EPROFILE_QUARANTINE_HOURS"))
        .stdout(predicate::str::contains("transfer.destination="));
}
