//! Locate the most recent version of a daily file across the storage tiers.
//!
//! Tiers are checked in a fixed order and the first hit wins. The archive
//! lookup is the only one that needs instrument metadata, so the sample
//! fragment is read only after the two local tiers miss.

use crate::daily::archive_path::{ArchiveLocation, ArchivePathResolver, InstrumentMetadata};
use crate::daily::dataset::DatasetCodec;
use crate::daily::fragment::{Fragment, InstrumentDay, list_fragments};
use crate::daily::paths::EprofilePaths;
use crate::error::{EprofileError, EprofileResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Quarantine,
    ReadyToIngest,
    Archive,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quarantine => "quarantine",
            Self::ReadyToIngest => "ready_to_ingest",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierHit {
    pub tier: Tier,
    pub path: PathBuf,
}

fn existing(path: PathBuf) -> EprofileResult<Option<PathBuf>> {
    match path.try_exists() {
        Ok(true) => Ok(Some(path)),
        Ok(false) => Ok(None),
        Err(err) => Err(EprofileError::resolution(path, err)),
    }
}

pub struct TierResolver<'a> {
    paths: &'a EprofilePaths,
    codec: &'a dyn DatasetCodec,
    resolver: ArchivePathResolver<'a>,
}

impl<'a> TierResolver<'a> {
    pub fn new(
        paths: &'a EprofilePaths,
        codec: &'a dyn DatasetCodec,
        resolver: ArchivePathResolver<'a>,
    ) -> Self {
        Self {
            paths,
            codec,
            resolver,
        }
    }

    /// Archive location of the instrument-day, derived from the first
    /// fragment in `fragments` that decodes.
    pub fn location(
        &self,
        day: &InstrumentDay,
        fragments: &[Fragment],
    ) -> EprofileResult<ArchiveLocation> {
        let mut last_err = None;
        for fragment in fragments {
            match self.codec.read(&fragment.path) {
                Ok(dataset) => {
                    let meta = InstrumentMetadata::from_dataset(&dataset, &fragment.path)?;
                    return self.resolver.resolve(&meta, day.date);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| EprofileError::Dataset {
            path: self.paths.incoming_dir.join(day.daily_file_name()),
            reason: "no readable fragment to derive the archive location from".to_string(),
        }))
    }

    pub fn locate(
        &self,
        day: &InstrumentDay,
        fragments: &[Fragment],
    ) -> EprofileResult<Option<TierHit>> {
        let name = day.daily_file_name();
        if let Some(path) = existing(self.paths.quarantine_dir.join(&name))? {
            return Ok(Some(TierHit {
                tier: Tier::Quarantine,
                path,
            }));
        }
        if let Some(path) = existing(self.paths.ready_dir.join(&name))? {
            return Ok(Some(TierHit {
                tier: Tier::ReadyToIngest,
                path,
            }));
        }

        let location = self.location(day, fragments)?;
        let archived = location
            .daily_dir(&self.paths.daily_archive_root)
            .join(&name);
        Ok(existing(archived)?.map(|path| TierHit {
            tier: Tier::Archive,
            path,
        }))
    }

    /// Fragments of `day` already sitting in the single-file archive tier
    /// that are not part of `batch`.
    pub fn archived_singles(
        &self,
        day: &InstrumentDay,
        batch: &[Fragment],
    ) -> EprofileResult<Vec<Fragment>> {
        let location = self.location(day, batch)?;
        let dir = location.single_file_dir(&self.paths.archive_root);
        archived_singles_in(&dir, day, batch)
    }
}

fn archived_singles_in(
    dir: &Path,
    day: &InstrumentDay,
    batch: &[Fragment],
) -> EprofileResult<Vec<Fragment>> {
    let in_batch = batch.iter().map(|f| f.name.as_str()).collect::<BTreeSet<_>>();
    let listed = list_fragments(dir).map_err(|err| EprofileError::resolution(dir, err))?;
    Ok(listed
        .into_iter()
        .filter(|f| f.instrument_day() == *day && !in_batch.contains(f.name.as_str()))
        .collect())
}
