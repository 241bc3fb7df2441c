//! Provenance of a daily file: the fragment filenames recorded in its
//! free-text `history` attribute.
//!
//! The history is plain text, so membership is decided on whole filename
//! tokens only. A name that merely appears inside a longer token does not
//! count as merged.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static FRAGMENT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w-])(L2_[A-Za-z0-9-]+_\w\d{12}\.nc)\b").expect("fragment token pattern")
});

const FIRST_MERGE_MARKER: &str = "concatenated by";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    names: BTreeSet<String>,
}

impl Provenance {
    pub fn parse(history: &str) -> Self {
        let names = FRAGMENT_TOKEN
            .captures_iter(history)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .collect();
        Self { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryUpdate {
    pub history: String,
    pub added: Vec<String>,
}

/// Append one audit line naming every candidate not yet recorded.
///
/// The first line written to a file reads `concatenated by <tool> from:`;
/// later lines read `additional files added to concatenated file by
/// <tool>:`. When every candidate is already recorded the history is
/// returned untouched.
pub fn append_entry(
    history: &str,
    stamp: &str,
    tool: &str,
    candidates: &[String],
) -> HistoryUpdate {
    let recorded = Provenance::parse(history);
    let added = candidates
        .iter()
        .filter(|name| !recorded.contains(name))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    if added.is_empty() {
        return HistoryUpdate {
            history: history.to_string(),
            added,
        };
    }

    let lead = if history.contains(FIRST_MERGE_MARKER) {
        format!("additional files added to concatenated file by {tool}:")
    } else {
        format!("{FIRST_MERGE_MARKER} {tool} from:")
    };
    let mut out = String::with_capacity(history.len() + 64 * added.len());
    if !history.is_empty() {
        out.push_str(history);
        out.push_str(" \n");
    }
    out.push_str(&format!("{stamp}: {lead} {}", added.join(", ")));

    HistoryUpdate {
        history: out,
        added,
    }
}
