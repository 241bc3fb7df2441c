//! Incremental merge of fragments into a daily file.
//!
//! A merge never adds a fragment whose name is already recorded in the
//! prior's history, keeps the last contribution for a shared timestamp and
//! only becomes visible under the daily name through an atomic rename.

use crate::daily::dataset::{
    AttrValue, CANONICAL_TIME_UNITS, DataType, Dataset, DatasetCodec, TIME_DIM, TimeUnits,
};
use crate::daily::fragment::{Fragment, InstrumentDay};
use crate::daily::provenance::{self, Provenance};
use crate::daily::tier::TierHit;
use crate::error::{EprofileError, EprofileResult};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const HISTORY_STAMP_FORMAT: &str = "%Y%m%dT%H:%M:%S";
const START_TIME: &str = "start_time";
const TIME_LONG_NAME: &str = "End time (UTC) of the measurement";
const QUALITY_FLAG: &str = "quality_flag";
const QUALITY_FLAG_NOTE: &str = "The invalid flag (=1) is attributed to all data >1000m above \
     cloud base, the other points have a valid flag (=0)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Written {
        path: PathBuf,
        added: Vec<String>,
        observations: usize,
    },
    /// Every fragment is already recorded in the prior; nothing was written.
    Unchanged,
}

pub struct MergeEngine<'a> {
    codec: &'a dyn DatasetCodec,
    tool: String,
    tz: Tz,
}

struct Contributor {
    label: String,
    dataset: Dataset,
}

impl<'a> MergeEngine<'a> {
    pub fn new(codec: &'a dyn DatasetCodec, tool: impl Into<String>, tz: Tz) -> Self {
        Self {
            codec,
            tool: tool.into(),
            tz,
        }
    }

    /// Merge `fragments` (plus `prior`, when one exists) into
    /// `<target_dir>/<daily name>`.
    pub fn merge(
        &self,
        day: &InstrumentDay,
        fragments: &[Fragment],
        prior: Option<&TierHit>,
        target_dir: &Path,
        now: DateTime<Utc>,
    ) -> EprofileResult<MergeOutcome> {
        let name = day.daily_file_name();

        let prior_dataset = match prior {
            Some(hit) => Some(self.codec.read(&hit.path)?),
            None => None,
        };
        let recorded = prior_dataset
            .as_ref()
            .and_then(|ds| ds.attr_text("history"))
            .map(Provenance::parse)
            .unwrap_or_default();

        let mut seen = BTreeSet::new();
        let mut fresh = fragments
            .iter()
            .filter(|f| !recorded.contains(&f.name) && seen.insert(f.name.clone()))
            .collect::<Vec<_>>();
        if fresh.is_empty() {
            return Ok(MergeOutcome::Unchanged);
        }
        fresh.sort_by(|a, b| a.name.cmp(&b.name));

        let mut contributors = Vec::with_capacity(fresh.len() + 1);
        let had_prior = prior_dataset.is_some();
        if let Some(dataset) = prior_dataset {
            contributors.push(Contributor {
                label: name.clone(),
                dataset,
            });
        }
        let mut comments = Vec::new();
        for fragment in &fresh {
            let dataset = self.codec.read(&fragment.path)?;
            if let Some(comment) = dataset.attr_text("comment").filter(|c| !c.trim().is_empty()) {
                comments.push(format!("{}: {comment}", fragment.name));
            }
            contributors.push(Contributor {
                label: fragment.name.clone(),
                dataset,
            });
        }

        let mut merged =
            merge_datasets(contributors).map_err(|reason| EprofileError::merge(&name, reason))?;

        let stamp = now.with_timezone(&self.tz).format(HISTORY_STAMP_FORMAT).to_string();
        let candidates = fresh.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
        let update = provenance::append_entry(
            merged.attr_text("history").unwrap_or_default(),
            &stamp,
            &self.tool,
            &candidates,
        );
        merged.set_attr_text("history", update.history);

        let base_comment = if had_prior {
            merged.attr_text("comment").unwrap_or_default().to_string()
        } else {
            String::new()
        };
        if let Some(comment) = merge_comment(&base_comment, &comments) {
            merged.set_attr_text("comment", comment);
        }

        normalize_quality_flag(&mut merged).map_err(|reason| EprofileError::merge(&name, reason))?;
        finalize_encoding(&mut merged);

        let observations = merged.time_len();
        let path = self.write_atomic(target_dir, &name, &merged)?;
        Ok(MergeOutcome::Written {
            path,
            added: update.added,
            observations,
        })
    }

    fn write_atomic(&self, dir: &Path, name: &str, dataset: &Dataset) -> EprofileResult<PathBuf> {
        let target = dir.join(name);
        fs::create_dir_all(dir).map_err(|err| {
            EprofileError::merge(name, format!("failed to create {}: {err}", dir.display()))
        })?;
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|err| {
                EprofileError::merge(name, format!("failed to create temp file: {err}"))
            })?;
        self.codec.write(temp.path(), dataset)?;
        temp.persist(&target).map_err(|err| {
            EprofileError::merge(name, format!("failed to persist {}: {err}", target.display()))
        })?;
        Ok(target)
    }
}

fn merge_comment(base: &str, entries: &[String]) -> Option<String> {
    if entries.is_empty() {
        return (!base.is_empty()).then(|| base.to_string());
    }
    let joined = entries.join("|");
    if base.is_empty() {
        Some(joined)
    } else {
        Some(format!("{base} \n{joined}"))
    }
}

fn normalize_time_units(contributor: &mut Contributor) -> Result<(), String> {
    for var_name in [TIME_DIM, START_TIME] {
        let Some(var) = contributor.dataset.variables.get_mut(var_name) else {
            if var_name == TIME_DIM {
                return Err(format!("{} has no `time` variable", contributor.label));
            }
            continue;
        };
        let raw = var
            .attr_text("units")
            .ok_or_else(|| format!("{}: `{var_name}` carries no units", contributor.label))?;
        let units = TimeUnits::parse(raw).ok_or_else(|| {
            format!(
                "{}: unsupported `{var_name}` units `{raw}`",
                contributor.label
            )
        })?;
        if !units.is_epoch_days() {
            for value in &mut var.values {
                *value = units.to_epoch_days(*value);
            }
        }
        var.attrs.insert(
            "units".to_string(),
            AttrValue::Text(CANONICAL_TIME_UNITS.to_string()),
        );
        var.dtype = DataType::Float64;
    }
    Ok(())
}

/// Concatenate along `time`, drop duplicate timestamps keeping the last
/// contribution, and sort ascending. Static variables and global attributes
/// come from the first contributor.
fn merge_datasets(mut contributors: Vec<Contributor>) -> Result<Dataset, String> {
    for contributor in &mut contributors {
        normalize_time_units(contributor)?;
    }
    let Some(first) = contributors.first() else {
        return Err("nothing to merge".to_string());
    };
    let base = &first.dataset;

    let per_obs = base
        .variables
        .iter()
        .filter(|(_, var)| var.is_per_observation())
        .map(|(name, var)| (name.clone(), var.dims.clone(), var.row_len(&base.dims)))
        .collect::<Vec<_>>();

    for contributor in &contributors {
        let ds = &contributor.dataset;
        let rows = ds.time_len();
        for (name, dims, row_len) in &per_obs {
            let Some(var) = ds.variables.get(name) else {
                return Err(format!("{} lacks variable `{name}`", contributor.label));
            };
            if &var.dims != dims {
                return Err(format!(
                    "{}: `{name}` has dims {:?}, expected {:?}",
                    contributor.label, var.dims, dims
                ));
            }
            for dim in dims.iter().skip(1) {
                if ds.dims.get(dim) != base.dims.get(dim) {
                    return Err(format!(
                        "{}: dimension `{dim}` has length {:?}, expected {:?}",
                        contributor.label,
                        ds.dims.get(dim),
                        base.dims.get(dim)
                    ));
                }
            }
            if var.values.len() != rows * row_len {
                return Err(format!(
                    "{}: `{name}` holds {} values for {rows} observations",
                    contributor.label,
                    var.values.len()
                ));
            }
        }
    }

    // (timestamp, contributor, row)
    let mut rows = Vec::new();
    for (idx, contributor) in contributors.iter().enumerate() {
        for (row, time) in contributor.dataset.times().iter().enumerate() {
            if time.is_nan() {
                return Err(format!("{}: NaN timestamp at row {row}", contributor.label));
            }
            rows.push((*time, idx, row));
        }
    }

    let mut seen = HashSet::new();
    let mut kept = rows
        .into_iter()
        .rev()
        .filter(|(time, _, _)| seen.insert(timestamp_key(*time)))
        .collect::<Vec<_>>();
    kept.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut merged = base.clone();
    for (name, _, row_len) in &per_obs {
        let mut values = Vec::with_capacity(kept.len() * row_len);
        for (_, idx, row) in &kept {
            let source = &contributors[*idx].dataset.variables[name].values;
            values.extend_from_slice(&source[row * row_len..(row + 1) * row_len]);
        }
        if let Some(var) = merged.variables.get_mut(name) {
            var.values = values;
        }
    }
    merged.dims.insert(TIME_DIM.to_string(), kept.len());
    Ok(merged)
}

fn timestamp_key(time: f64) -> u64 {
    // -0.0 and 0.0 are the same instant
    if time == 0.0 { 0 } else { time.to_bits() }
}

fn truncate_to_i32(value: f64) -> Result<i32, String> {
    let truncated = value.trunc();
    if truncated.is_nan() || truncated < i32::MIN as f64 || truncated > i32::MAX as f64 {
        return Err(format!("`{QUALITY_FLAG}` value {value} does not fit in int32"));
    }
    Ok(truncated as i32)
}

fn normalize_quality_flag(dataset: &mut Dataset) -> Result<(), String> {
    let Some(var) = dataset.variables.get_mut(QUALITY_FLAG) else {
        return Ok(());
    };
    var.dtype = DataType::Int32;
    for value in &mut var.values {
        *value = f64::from(truncate_to_i32(*value)?);
    }

    if let Some(flag_values) = var.attrs.get("flag_values") {
        let raw = match flag_values {
            AttrValue::Ints(values) => values.iter().map(|v| *v as f64).collect::<Vec<_>>(),
            AttrValue::Floats(values) => values.clone(),
            AttrValue::Text(text) => text
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|part| !part.is_empty())
                .map(|part| {
                    part.trim_end_matches('b')
                        .parse::<f64>()
                        .map_err(|_| format!("`{QUALITY_FLAG}` flag value `{part}` is not numeric"))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        let ints = raw
            .into_iter()
            .map(|v| truncate_to_i32(v).map(i64::from))
            .collect::<Result<Vec<_>, _>>()?;
        var.attrs
            .insert("flag_values".to_string(), AttrValue::Ints(ints));
    }

    let comments = var.attr_text("comments").unwrap_or_default();
    if !comments.contains(QUALITY_FLAG_NOTE) {
        let updated = format!("{comments}.\n{QUALITY_FLAG_NOTE}");
        var.attrs
            .insert("comments".to_string(), AttrValue::Text(updated));
    }
    Ok(())
}

fn finalize_encoding(dataset: &mut Dataset) {
    for var in dataset.variables.values_mut() {
        if var.fill_value.is_some_and(f64::is_nan) {
            var.fill_value = None;
        }
    }
    if let Some(time) = dataset.variables.get_mut(TIME_DIM) {
        time.attrs.insert(
            "long_name".to_string(),
            AttrValue::Text(TIME_LONG_NAME.to_string()),
        );
    }
    dataset.unlimited_dims.clear();
}
