use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static FRAGMENT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^L2_(?P<wigos>[A-Za-z0-9-]+)_(?P<prefix>\w)(?P<stamp>\d{12})\.nc$")
        .expect("fragment filename pattern")
});

static DAILY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^L2_(?P<wigos>[A-Za-z0-9-]+)_(?P<prefix>\w)(?P<date>\d{8})\.nc$")
        .expect("daily filename pattern")
});

/// One short time-window source file, identified purely by its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub path: PathBuf,
    pub name: String,
    pub wigos: String,
    pub prefix: char,
    pub stamp: NaiveDateTime,
}

impl Fragment {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let caps = FRAGMENT_NAME.captures(name)?;
        let stamp = NaiveDateTime::parse_from_str(&caps["stamp"], "%Y%m%d%H%M").ok()?;
        let prefix = caps["prefix"].chars().next()?;
        Some(Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            wigos: caps["wigos"].to_string(),
            prefix,
            stamp,
        })
    }

    pub fn instrument_day(&self) -> InstrumentDay {
        InstrumentDay {
            wigos: self.wigos.clone(),
            prefix: self.prefix,
            date: self.stamp.date(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrumentDay {
    pub wigos: String,
    pub prefix: char,
    pub date: NaiveDate,
}

impl InstrumentDay {
    pub fn from_daily_name(name: &str) -> Option<Self> {
        let caps = DAILY_NAME.captures(name)?;
        let date = NaiveDate::parse_from_str(&caps["date"], "%Y%m%d").ok()?;
        Some(Self {
            wigos: caps["wigos"].to_string(),
            prefix: caps["prefix"].chars().next()?,
            date,
        })
    }

    pub fn instrument_key(&self) -> String {
        format!("{}_{}", self.wigos, self.prefix)
    }

    pub fn daily_file_name(&self) -> String {
        format!(
            "L2_{}{}.nc",
            self.instrument_key(),
            self.date.format("%Y%m%d")
        )
    }
}

impl fmt::Display for InstrumentDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instrument_key(), self.date.format("%Y-%m-%d"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub groups: BTreeMap<InstrumentDay, Vec<Fragment>>,
    pub skipped: Vec<String>,
}

impl ScanOutcome {
    pub fn fragment_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// List the fragments directly inside `dir`, sorted by name. Hidden entries
/// and names that do not follow the fragment convention are ignored.
pub fn list_fragments(dir: &Path) -> io::Result<Vec<Fragment>> {
    if !dir.try_exists()? {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(fragment) = Fragment::from_path(&path) {
            out.push(fragment);
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub fn scan_incoming(dir: &Path) -> Result<ScanOutcome> {
    let mut out = ScanOutcome::default();
    if !dir.exists() {
        return Ok(out);
    }

    let read_dir =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in read_dir {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.starts_with("L2_") {
            continue;
        }
        match Fragment::from_path(&path) {
            Some(fragment) => out
                .groups
                .entry(fragment.instrument_day())
                .or_default()
                .push(fragment),
            None => out.skipped.push(name.to_string()),
        }
    }

    for fragments in out.groups.values_mut() {
        fragments.sort_by(|a, b| a.name.cmp(&b.name));
    }
    out.skipped.sort();
    Ok(out)
}
