pub mod archive_path;
pub mod audit;
pub mod cleaner;
pub mod config;
pub mod dataset;
pub mod fragment;
pub mod ledger;
pub mod merge;
pub mod paths;
pub mod promotion;
pub mod provenance;
pub mod tier;
pub mod transfer;
pub mod util;
pub mod warn;
