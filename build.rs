use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const ENV_PREFIX: &str = "EPROFILE_";

fn source_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut pending = vec![root.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn is_env_key(text: &str) -> bool {
    text.strip_prefix(ENV_PREFIX).is_some_and(|rest| {
        !rest.is_empty()
            && rest
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
    })
}

/// Every piece between two `"` that is exactly an env key. Identifiers and
/// log prefixes that only contain the prefix never match.
fn env_keys_in(source: &str) -> impl Iterator<Item = &str> {
    source.split('"').filter(|piece| is_env_key(piece))
}

fn render_allowlist(keys: &BTreeSet<String>) -> String {
    let mut out = String::from("pub const GENERATED_EPROFILE_ENV_ALLOWLIST: &[&str] = &[\n");
    for key in keys {
        out.push_str(&format!("    {key:?},\n"));
    }
    out.push_str("];\n");
    out
}

fn main() -> std::io::Result<()> {
    let mut keys = BTreeSet::new();
    for file in source_files(Path::new("src"))? {
        let source = fs::read_to_string(&file)?;
        keys.extend(env_keys_in(&source).map(str::to_string));
    }

    let out_dir = env::var_os("OUT_DIR").ok_or_else(|| std::io::Error::other("OUT_DIR unset"))?;
    fs::write(
        Path::new(&out_dir).join("eprofile_env_allowlist.rs"),
        render_allowlist(&keys),
    )?;

    let built = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(std::io::Error::other)?;
    println!(
        "cargo:rustc-env=BUILD_UUID={:x}-{:x}",
        built.as_secs(),
        built.subsec_nanos()
    );
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");
    Ok(())
}
