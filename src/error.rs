use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EprofileError {
    #[error("unmapped {field} `{value}` ({context}); add it to the lookup tables")]
    UnmappedMetadata {
        field: &'static str,
        value: String,
        context: String,
    },
    #[error("merge failed for {target}: {reason}")]
    MergeFailure { target: String, reason: String },
    #[error("transfer of {path} to {destination} failed: {reason}")]
    TransferFailure {
        path: PathBuf,
        destination: String,
        reason: String,
    },
    #[error("failed to resolve {}: {source}", path.display())]
    ResolutionFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset {}: {reason}", path.display())]
    Dataset { path: PathBuf, reason: String },
    #[error("promotion ledger {}: {reason}", path.display())]
    Ledger { path: PathBuf, reason: String },
}

impl EprofileError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnmappedMetadata { .. } => ErrorCode::E001UnmappedMetadata,
            Self::MergeFailure { .. } => ErrorCode::E002MergeFailure,
            Self::TransferFailure { .. } => ErrorCode::E003TransferFailure,
            Self::ResolutionFailure { .. } => ErrorCode::E004ResolutionFailure,
            Self::Dataset { .. } => ErrorCode::E005DatasetInvalid,
            Self::Ledger { .. } => ErrorCode::E006LedgerCorrupt,
        }
    }

    pub fn resolution(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ResolutionFailure {
            path: path.into(),
            source,
        }
    }

    pub fn merge(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MergeFailure {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    E001UnmappedMetadata,
    E002MergeFailure,
    E003TransferFailure,
    E004ResolutionFailure,
    E005DatasetInvalid,
    E006LedgerCorrupt,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001UnmappedMetadata => "E001_UNMAPPED_METADATA",
            Self::E002MergeFailure => "E002_MERGE_FAILURE",
            Self::E003TransferFailure => "E003_TRANSFER_FAILURE",
            Self::E004ResolutionFailure => "E004_RESOLUTION_FAILURE",
            Self::E005DatasetInvalid => "E005_DATASET_INVALID",
            Self::E006LedgerCorrupt => "E006_LEDGER_CORRUPT",
        }
    }
}

pub type EprofileResult<T> = std::result::Result<T, EprofileError>;
