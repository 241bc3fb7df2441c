//! `.env` discovery. The first candidate that exists and parses is loaded;
//! variables already present in the process environment are left alone.

use std::env;
use std::path::PathBuf;

fn dotenv_candidates(
    cwd: Option<PathBuf>,
    eprofile_home: Option<PathBuf>,
    home_dir: Option<PathBuf>,
) -> Vec<PathBuf> {
    let home = eprofile_home.or_else(|| home_dir.map(|dir| dir.join("eprofile")));
    cwd.into_iter()
        .chain(home)
        .map(|dir| dir.join(".env"))
        .collect()
}

/// Returns the file that was loaded, if any.
pub fn load_dotenv() -> Option<PathBuf> {
    let eprofile_home = env::var_os("EPROFILE_HOME")
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from);
    dotenv_candidates(env::current_dir().ok(), eprofile_home, dirs::home_dir())
        .into_iter()
        .filter(|path| path.is_file())
        .find(|path| dotenvy::from_path(path).is_ok())
}
