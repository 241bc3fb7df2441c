//! In-memory model of an E-PROFILE L2 file and the codec seam used to read
//! and write it.
//!
//! The engine never touches the on-disk encoding directly: it reads and
//! writes [`Dataset`] values through a [`DatasetCodec`]. The bundled
//! [`JsonDatasetCodec`] stores the model as JSON; a NetCDF binding can be
//! dropped in behind the same trait.

use crate::error::{EprofileError, EprofileResult};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const TIME_DIM: &str = "time";
pub const CANONICAL_TIME_UNITS: &str = "days since 1970-01-01 00:00:00.000";
const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int32,
    Int64,
    Float32,
    Float64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Text(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(values.iter().map(|v| v.is_finite().then_some(*v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let raw = Vec::<Option<f64>>::deserialize(d)?;
        Ok(raw.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub dims: Vec<String>,
    pub dtype: DataType,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<f64>,
    #[serde(with = "nan_as_null")]
    pub values: Vec<f64>,
}

impl Variable {
    pub fn is_per_observation(&self) -> bool {
        self.dims.first().map(String::as_str) == Some(TIME_DIM)
    }

    pub fn attr_text(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(AttrValue::as_text)
    }

    /// Number of values per observation row (1 for a plain time series).
    pub fn row_len(&self, dims: &BTreeMap<String, usize>) -> usize {
        self.dims
            .iter()
            .skip(1)
            .map(|d| dims.get(d).copied().unwrap_or(0))
            .product()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub dims: BTreeMap<String, usize>,
    #[serde(default)]
    pub unlimited_dims: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
}

impl Dataset {
    pub fn attr_text(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(AttrValue::as_text)
    }

    pub fn set_attr_text(&mut self, key: &str, value: impl Into<String>) {
        self.attrs
            .insert(key.to_string(), AttrValue::Text(value.into()));
    }

    pub fn time_len(&self) -> usize {
        self.dims.get(TIME_DIM).copied().unwrap_or(0)
    }

    pub fn times(&self) -> &[f64] {
        self.variables
            .get(TIME_DIM)
            .map(|v| v.values.as_slice())
            .unwrap_or(&[])
    }

    /// Structural checks: every variable references known dimensions and
    /// carries exactly as many values as its shape implies.
    pub fn validate(&self) -> Result<(), String> {
        let Some(time) = self.variables.get(TIME_DIM) else {
            return Err("missing `time` coordinate variable".to_string());
        };
        if time.dims != [TIME_DIM] {
            return Err("`time` must be one-dimensional over `time`".to_string());
        }
        for (name, var) in &self.variables {
            let mut expected = 1usize;
            for dim in &var.dims {
                let Some(len) = self.dims.get(dim) else {
                    return Err(format!("variable `{name}` uses undeclared dimension `{dim}`"));
                };
                expected = expected.saturating_mul(*len);
            }
            if var.values.len() != expected {
                return Err(format!(
                    "variable `{name}` holds {} values but its shape needs {expected}",
                    var.values.len()
                ));
            }
        }
        Ok(())
    }
}

/// CF-style `"<unit> since <reference>"` time units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeUnits {
    seconds_per_unit: f64,
    reference_offset_days: f64,
}

impl TimeUnits {
    pub fn parse(raw: &str) -> Option<Self> {
        let (unit, reference) = raw.trim().split_once(" since ")?;
        let seconds_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
            "days" | "day" | "d" => SECONDS_PER_DAY,
            "hours" | "hour" | "h" => 3_600.0,
            "minutes" | "minute" | "min" => 60.0,
            "seconds" | "second" | "s" | "sec" => 1.0,
            _ => return None,
        };
        let reference = parse_reference(reference)?;
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?.and_hms_opt(0, 0, 0)?;
        let reference_offset_days =
            (reference - epoch).num_milliseconds() as f64 / 86_400_000.0;
        Some(Self {
            seconds_per_unit,
            reference_offset_days,
        })
    }

    pub fn is_epoch_days(&self) -> bool {
        self.seconds_per_unit == SECONDS_PER_DAY && self.reference_offset_days == 0.0
    }

    pub fn to_epoch_days(&self, value: f64) -> f64 {
        if self.seconds_per_unit == SECONDS_PER_DAY {
            return value + self.reference_offset_days;
        }
        value * self.seconds_per_unit / SECONDS_PER_DAY + self.reference_offset_days
    }
}

fn parse_reference(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw
        .trim()
        .trim_end_matches("UTC")
        .trim_end_matches('Z')
        .trim();
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub trait DatasetCodec {
    fn read(&self, path: &Path) -> EprofileResult<Dataset>;
    fn write(&self, path: &Path, dataset: &Dataset) -> EprofileResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDatasetCodec;

fn dataset_error(path: &Path, reason: impl Into<String>) -> EprofileError {
    EprofileError::Dataset {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

impl DatasetCodec for JsonDatasetCodec {
    fn read(&self, path: &Path) -> EprofileResult<Dataset> {
        let raw = fs::read(path).map_err(|err| dataset_error(path, err.to_string()))?;
        if raw.is_empty() {
            return Err(dataset_error(path, "file is empty"));
        }
        let dataset: Dataset = serde_json::from_slice(&raw)
            .map_err(|err| dataset_error(path, format!("not a structured dataset: {err}")))?;
        dataset
            .validate()
            .map_err(|reason| dataset_error(path, reason))?;
        Ok(dataset)
    }

    fn write(&self, path: &Path, dataset: &Dataset) -> EprofileResult<()> {
        let data = serde_json::to_vec_pretty(dataset)
            .map_err(|err| dataset_error(path, err.to_string()))?;
        let mut file = fs::File::create(path).map_err(|err| dataset_error(path, err.to_string()))?;
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .map_err(|err| dataset_error(path, err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Build a small ALC-like fragment: one value per observation for
    /// `cloud_base_height` and a `quality_flag` over (time, altitude).
    pub fn fragment(times: &[f64], marker: f64) -> Dataset {
        let mut ds = Dataset::default();
        ds.dims.insert(TIME_DIM.to_string(), times.len());
        ds.dims.insert("altitude".to_string(), 2);
        ds.unlimited_dims.push(TIME_DIM.to_string());
        ds.set_attr_text("title", "E-PROFILE ALC DWD");
        ds.set_attr_text("site_location", "Hohenpeissenberg,Germany");
        ds.set_attr_text("instrument_type", "CHM15k");
        ds.set_attr_text("instrument_id", "TUB120011");
        ds.set_attr_text("history", "created by instrument processor");

        let mut time_attrs = BTreeMap::new();
        time_attrs.insert(
            "units".to_string(),
            AttrValue::Text(CANONICAL_TIME_UNITS.to_string()),
        );
        ds.variables.insert(
            TIME_DIM.to_string(),
            Variable {
                dims: vec![TIME_DIM.to_string()],
                dtype: DataType::Float64,
                attrs: time_attrs,
                fill_value: None,
                values: times.to_vec(),
            },
        );
        ds.variables.insert(
            "altitude".to_string(),
            Variable {
                dims: vec!["altitude".to_string()],
                dtype: DataType::Float32,
                attrs: BTreeMap::new(),
                fill_value: Some(f64::NAN),
                values: vec![100.0, 200.0],
            },
        );
        ds.variables.insert(
            "cloud_base_height".to_string(),
            Variable {
                dims: vec![TIME_DIM.to_string()],
                dtype: DataType::Float32,
                attrs: BTreeMap::new(),
                fill_value: Some(-999.0),
                values: vec![marker; times.len()],
            },
        );
        let mut qf_attrs = BTreeMap::new();
        qf_attrs.insert(
            "comments".to_string(),
            AttrValue::Text("Quality flag of the attenuated backscatter".to_string()),
        );
        qf_attrs.insert("flag_values".to_string(), AttrValue::Floats(vec![0.0, 1.0]));
        ds.variables.insert(
            "quality_flag".to_string(),
            Variable {
                dims: vec![TIME_DIM.to_string(), "altitude".to_string()],
                dtype: DataType::Int64,
                attrs: qf_attrs,
                fill_value: None,
                values: vec![0.0; times.len() * 2],
            },
        );
        ds
    }
}

#[cfg(test)]
mod tests {
    use super::testing::fragment;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn json_codec_keeps_missing_values_as_nan() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("L2_X_A202106010000.nc");
        let mut ds = fragment(&[18779.0], 5.0);
        ds.variables
            .get_mut("cloud_base_height")
            .expect("cbh")
            .values[0] = f64::NAN;

        JsonDatasetCodec.write(&path, &ds).expect("write");
        let back = JsonDatasetCodec.read(&path).expect("read");

        assert!(back.variables["cloud_base_height"].values[0].is_nan());
        assert_eq!(back.attr_text("title"), Some("E-PROFILE ALC DWD"));
        assert_eq!(back.variables["altitude"].fill_value, None);
    }

    #[test]
    fn empty_and_garbage_files_are_rejected() {
        let tmp = tempdir().expect("tempdir");
        let empty = tmp.path().join("empty.nc");
        let garbage = tmp.path().join("garbage.nc");
        fs::write(&empty, "").expect("write empty");
        fs::write(&garbage, "CDF\x01 not json").expect("write garbage");

        let err = JsonDatasetCodec.read(&empty).expect_err("empty");
        assert!(err.to_string().contains("file is empty"));
        assert!(JsonDatasetCodec.read(&garbage).is_err());
    }

    #[test]
    fn validate_catches_shape_mismatch() {
        let mut ds = fragment(&[1.0, 2.0], 1.0);
        ds.variables
            .get_mut("quality_flag")
            .expect("qf")
            .values
            .pop();
        let err = ds.validate().expect_err("shape");
        assert!(err.contains("quality_flag"));
    }

    #[test]
    fn time_units_convert_to_epoch_days() {
        let secs = TimeUnits::parse("seconds since 2021-06-01 00:00:00").expect("units");
        assert_eq!(secs.to_epoch_days(0.0), 18779.0);
        assert_eq!(secs.to_epoch_days(43_200.0), 18779.5);

        let canonical = TimeUnits::parse(CANONICAL_TIME_UNITS).expect("canonical");
        assert!(canonical.is_epoch_days());
        assert!(TimeUnits::parse("fortnights since 1970-01-01").is_none());
    }
}
