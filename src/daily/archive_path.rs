use crate::daily::dataset::Dataset;
use crate::error::{EprofileError, EprofileResult};
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const BUILTIN_INSTRUMENTS: &[(&str, &str)] = &[
    ("CHM15k", "lufft-chm15k"),
    ("CHM8k", "lufft-chm8k"),
    ("CL51", "vaisala-cl51"),
    ("CL31", "vaisala-cl31"),
    ("Mini-MPL", "mini-mpl"),
    ("LR111-D300", "raymetrics-lr111-d300"),
];

const BUILTIN_OPERATORS: &[(&str, &str)] = &[
    ("AEMET", "aemet"),
    ("ARPA", "arpa"),
    ("ASNOA", "asnoa"),
    ("BELGIUM_DEFENCE", "belgium-defence"),
    ("Bern-University", "bern-university"),
    ("BERLIN_UNIVERSITY", "berlin-university"),
    ("CHMI", "chmi"),
    ("Cologne-University", "cologne-university"),
    ("CNR-IMAA", "cnr-imaa"),
    ("CNR-ISAC", "cnr-isac"),
    ("DHMZ", "dhmz"),
    ("DWD", "dwd"),
    ("FMI", "fmi"),
    ("Granada-University", "granada-university"),
    ("INOE2000", "inoe2000"),
    ("IMO", "imo"),
    ("KNMI", "knmi"),
    ("LUND_UNIVERSITY", "lund-university"),
    ("Met-Eireann", "met-eireann"),
    ("MeteoFrance", "meteofrance"),
    ("MET-NORWAY", "met-norway"),
    ("Met-Office", "metoffice"),
    ("METEOSWISS", "meteoswiss"),
    ("NCAS", "ncas"),
    ("NUIG", "galway-university"),
    ("OMSZ", "omsz"),
    ("RMI", "rmi"),
    ("SIRTA", "sirta"),
    ("TROPOS", "tropos"),
    // Swedish Meteorological and Hydrological Institute
    ("SMHI", "smhi"),
    ("UPC", "universitat-politecnica-catalunya"),
    ("UWO", "uwo"),
    ("Valencia-University", "valencia-university"),
    ("ZAMG", "zamg"),
];

/// Header codes → directory names. Built once, then only read.
#[derive(Debug, Clone)]
pub struct LookupTables {
    instruments: BTreeMap<String, String>,
    operators: BTreeMap<String, String>,
}

impl LookupTables {
    pub fn builtin() -> Self {
        Self {
            instruments: to_map(BUILTIN_INSTRUMENTS),
            operators: to_map(BUILTIN_OPERATORS),
        }
    }

    /// Built-in tables extended by configured entries; a configured code
    /// replaces the built-in mapping for the same code.
    pub fn with_overrides(
        instruments: &BTreeMap<String, String>,
        operators: &BTreeMap<String, String>,
    ) -> Self {
        let mut out = Self::builtin();
        out.instruments
            .extend(instruments.iter().map(|(k, v)| (k.clone(), v.clone())));
        out.operators
            .extend(operators.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    pub fn instrument(&self, code: &str) -> Option<&str> {
        self.instruments.get(code).map(String::as_str)
    }

    pub fn operator(&self, code: &str) -> Option<&str> {
        self.operators.get(code).map(String::as_str)
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.instruments.len(), self.operators.len())
    }
}

fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Raw header fields that drive archive placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentMetadata {
    pub instrument_type: String,
    pub operator: String,
    pub site_location: String,
    pub instrument_id: String,
}

impl InstrumentMetadata {
    pub fn from_dataset(dataset: &Dataset, source: &Path) -> EprofileResult<Self> {
        let attr = |key: &'static str| {
            dataset
                .attr_text(key)
                .map(str::to_string)
                .ok_or_else(|| EprofileError::Dataset {
                    path: source.to_path_buf(),
                    reason: format!("missing global attribute `{key}`"),
                })
        };
        let title = attr("title")?;
        // "E-PROFILE ALC Met Office" -> "Met-Office"
        let operator = title
            .split(' ')
            .skip(2)
            .collect::<Vec<_>>()
            .join("-");
        Ok(Self {
            instrument_type: attr("instrument_type")?,
            operator,
            site_location: attr("site_location")?,
            instrument_id: attr("instrument_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLocation {
    pub country: String,
    pub location: String,
    pub operator: String,
    pub instrument_type: String,
    pub instrument_id: String,
    pub date: NaiveDate,
}

impl ArchiveLocation {
    pub fn instrument_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.country)
            .join(&self.location)
            .join(format!(
                "{}-{}_{}",
                self.operator, self.instrument_type, self.instrument_id
            ))
    }

    /// `<root>/<country>/<location>/<operator>-<type>_<id>/<year>/`
    pub fn daily_dir(&self, root: &Path) -> PathBuf {
        self.instrument_dir(root)
            .join(format!("{:04}", self.date.year()))
    }

    /// `<root>/<country>/<location>/<operator>-<type>_<id>/<year>/<month>/<day>/`
    pub fn single_file_dir(&self, root: &Path) -> PathBuf {
        self.daily_dir(root)
            .join(format!("{:02}", self.date.month()))
            .join(format!("{:02}", self.date.day()))
    }
}

pub fn normalize_site(raw: &str) -> String {
    let mut site = raw.trim().replace('_', "-").to_lowercase();
    // Station reports the wrong site name in its header.
    if site == "aberystwyth" {
        site = "capel-dewi".to_string();
    }
    if let Some(stripped) = site.strip_suffix("-alc") {
        site = stripped.to_string();
    }
    if site == "chilbolton" {
        site = "chilbolton-atmospheric-observatory".to_string();
    }
    site
}

fn normalize_country(raw: &str) -> String {
    raw.trim().replace('_', "-").to_lowercase()
}

pub struct ArchivePathResolver<'a> {
    tables: &'a LookupTables,
}

impl<'a> ArchivePathResolver<'a> {
    pub fn new(tables: &'a LookupTables) -> Self {
        Self { tables }
    }

    pub fn resolve(
        &self,
        meta: &InstrumentMetadata,
        date: NaiveDate,
    ) -> EprofileResult<ArchiveLocation> {
        let context = format!(
            "instrument_type={} operator={} site_location={} instrument_id={}",
            meta.instrument_type, meta.operator, meta.site_location, meta.instrument_id
        );
        let instrument_type = self
            .tables
            .instrument(&meta.instrument_type)
            .ok_or_else(|| EprofileError::UnmappedMetadata {
                field: "instrument_type",
                value: meta.instrument_type.clone(),
                context: context.clone(),
            })?;
        let operator = self.tables.operator(&meta.operator).ok_or_else(|| {
            EprofileError::UnmappedMetadata {
                field: "operator",
                value: meta.operator.clone(),
                context: context.clone(),
            }
        })?;

        let mut parts = meta.site_location.split(',');
        let site = parts.next().unwrap_or_default();
        let Some(country) = parts.next().filter(|c| !c.trim().is_empty()) else {
            return Err(EprofileError::UnmappedMetadata {
                field: "site_location",
                value: meta.site_location.clone(),
                context,
            });
        };

        Ok(ArchiveLocation {
            country: normalize_country(country),
            location: normalize_site(site),
            operator: operator.to_string(),
            instrument_type: instrument_type.to_string(),
            instrument_id: meta.instrument_id.clone(),
            date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(instrument_type: &str, operator: &str, site: &str) -> InstrumentMetadata {
        InstrumentMetadata {
            instrument_type: instrument_type.to_string(),
            operator: operator.to_string(),
            site_location: site.to_string(),
            instrument_id: "TUB120011".to_string(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, 1).expect("date")
    }

    #[test]
    fn resolves_daily_and_single_file_dirs() {
        let tables = LookupTables::builtin();
        let resolver = ArchivePathResolver::new(&tables);
        let loc = resolver
            .resolve(&meta("CHM15k", "Met-Office", "Camborne,United_Kingdom"), date())
            .expect("resolve");

        assert_eq!(
            loc.daily_dir(Path::new("/badc/eprofile/data/daily_files")),
            PathBuf::from(
                "/badc/eprofile/data/daily_files/united-kingdom/camborne/metoffice-lufft-chm15k_TUB120011/2021"
            )
        );
        assert_eq!(
            loc.single_file_dir(Path::new("/badc/eprofile/data")),
            PathBuf::from(
                "/badc/eprofile/data/united-kingdom/camborne/metoffice-lufft-chm15k_TUB120011/2021/06/01"
            )
        );
    }

    #[test]
    fn site_name_corrections_are_applied() {
        assert_eq!(normalize_site("Aberystwyth"), "capel-dewi");
        assert_eq!(normalize_site("Chilbolton_ALC"), "chilbolton-atmospheric-observatory");
        assert_eq!(normalize_site("Payerne_ALC"), "payerne");
        assert_eq!(normalize_site("De_Bilt"), "de-bilt");
    }

    #[test]
    fn unknown_codes_are_unmapped() {
        let tables = LookupTables::builtin();
        let resolver = ArchivePathResolver::new(&tables);

        let err = resolver
            .resolve(&meta("CS135", "DWD", "Lindenberg,Germany"), date())
            .expect_err("instrument");
        assert!(matches!(
            err,
            EprofileError::UnmappedMetadata { field: "instrument_type", .. }
        ));

        let err = resolver
            .resolve(&meta("CL51", "Nowhere-Agency", "Lindenberg,Germany"), date())
            .expect_err("operator");
        assert!(matches!(err, EprofileError::UnmappedMetadata { field: "operator", .. }));

        let err = resolver
            .resolve(&meta("CL51", "DWD", "Lindenberg"), date())
            .expect_err("country");
        assert!(matches!(
            err,
            EprofileError::UnmappedMetadata { field: "site_location", .. }
        ));
    }

    #[test]
    fn overrides_extend_builtin_tables() {
        let mut instruments = BTreeMap::new();
        instruments.insert("CS135".to_string(), "campbell-cs135".to_string());
        let tables = LookupTables::with_overrides(&instruments, &BTreeMap::new());
        assert_eq!(tables.instrument("CS135"), Some("campbell-cs135"));
        assert_eq!(tables.instrument("CL31"), Some("vaisala-cl31"));
    }

    #[test]
    fn operator_is_taken_from_title_words() {
        let mut ds = crate::daily::dataset::testing::fragment(&[1.0], 1.0);
        ds.set_attr_text("title", "E-PROFILE ALC Met Office");
        let meta = InstrumentMetadata::from_dataset(&ds, Path::new("x.nc")).expect("meta");
        assert_eq!(meta.operator, "Met-Office");
        assert_eq!(meta.instrument_type, "CHM15k");
    }
}
