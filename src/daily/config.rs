use anyhow::{Result, anyhow};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionPolicy {
    NoDeletion,
    #[serde(alias = "arrivals-tool")]
    Arrivals,
    Direct,
}

impl DeletionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoDeletion => "no-deletion",
            Self::Arrivals => "arrivals",
            Self::Direct => "direct",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "no-deletion" | "none" | "keep" => Some(Self::NoDeletion),
            "arrivals" | "arrivals-tool" => Some(Self::Arrivals),
            "direct" | "notarrivals" => Some(Self::Direct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcatConfig {
    pub tool_name: String,
    pub history_timezone: String,
    pub backfill_archived_singles: bool,
    pub full_day_fragments: usize,
}

impl Default for ConcatConfig {
    fn default() -> Self {
        Self {
            tool_name: "eprofile-daily".to_string(),
            history_timezone: "UTC".to_string(),
            backfill_archived_singles: true,
            // 24h of 5-minute windows
            full_day_fragments: 288,
        }
    }
}

impl ConcatConfig {
    pub fn history_tz(&self) -> Result<Tz> {
        Tz::from_str(self.history_timezone.trim())
            .map_err(|err| anyhow!("invalid history timezone `{}`: {err}", self.history_timezone))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub quarantine_hours: u64,
    pub settle_secs: u64,
    pub max_cycles: u32,
    pub attempts_per_cycle: u32,
    pub retry_interval_secs: u64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            quarantine_hours: 48,
            settle_secs: 300,
            max_cycles: 5,
            attempts_per_cycle: 3,
            retry_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub rsync_bin: String,
    pub destination: String,
    pub password_file: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rsync_bin: "rsync".to_string(),
            destination: String::new(),
            password_file: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub deletion: DeletionPolicy,
    pub arrivals_deleter_bin: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            deletion: DeletionPolicy::NoDeletion,
            arrivals_deleter_bin: "arrivals-deleter".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LookupConfig {
    pub instruments: BTreeMap<String, String>,
    pub operators: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EprofileConfig {
    pub concat: ConcatConfig,
    pub promotion: PromotionConfig,
    pub transfer: TransferConfig,
    pub cleanup: CleanupConfig,
    pub lookup: LookupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialEprofileConfig {
    concat: Option<ConcatConfig>,
    promotion: Option<PromotionConfig>,
    transfer: Option<TransferConfig>,
    cleanup: Option<CleanupConfig>,
    lookup: Option<LookupConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_optional_string(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

fn env_optional_u64(var: &str, fallback: Option<u64>) -> Option<u64> {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().or(fallback),
        Err(_) => fallback,
    }
}

fn validate(cfg: &EprofileConfig) -> Result<()> {
    if cfg.concat.tool_name.trim().is_empty() {
        return Err(anyhow!("invalid concat tool name: cannot be empty"));
    }
    cfg.concat.history_tz()?;
    if cfg.concat.full_day_fragments == 0 {
        return Err(anyhow!("invalid full day fragment count: must be >= 1"));
    }
    if cfg.promotion.max_cycles == 0 {
        return Err(anyhow!("invalid promotion max cycles: must be >= 1"));
    }
    if cfg.promotion.attempts_per_cycle == 0 {
        return Err(anyhow!("invalid transfer attempts per cycle: must be >= 1"));
    }
    if cfg.transfer.rsync_bin.trim().is_empty() {
        return Err(anyhow!("invalid rsync binary: cannot be empty"));
    }
    if cfg.transfer.timeout_secs == Some(0) {
        return Err(anyhow!("invalid transfer timeout: must be >= 1 second"));
    }
    if cfg.cleanup.deletion == DeletionPolicy::Arrivals
        && cfg.cleanup.arrivals_deleter_bin.trim().is_empty()
    {
        return Err(anyhow!(
            "invalid cleanup config: `arrivals` deletion needs an arrivals deleter binary"
        ));
    }
    Ok(())
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("EPROFILE_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".eprofile").join("eprofile.toml"))
}

fn merge_file_config(base: &mut EprofileConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialEprofileConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse eprofile config {}: {err}", path.display()))?;
    if let Some(concat) = parsed.concat {
        base.concat = concat;
    }
    if let Some(promotion) = parsed.promotion {
        base.promotion = promotion;
    }
    if let Some(transfer) = parsed.transfer {
        base.transfer = transfer;
    }
    if let Some(cleanup) = parsed.cleanup {
        base.cleanup = cleanup;
    }
    if let Some(lookup) = parsed.lookup {
        base.lookup = lookup;
    }
    Ok(())
}

pub fn load_config() -> Result<EprofileConfig> {
    let mut cfg = EprofileConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.concat.tool_name = env_or_string("EPROFILE_TOOL_NAME", &cfg.concat.tool_name);
    cfg.concat.history_timezone =
        env_or_string("EPROFILE_HISTORY_TZ", &cfg.concat.history_timezone);
    cfg.concat.backfill_archived_singles = env_or_bool(
        "EPROFILE_BACKFILL_ARCHIVED_SINGLES",
        cfg.concat.backfill_archived_singles,
    );
    cfg.promotion.quarantine_hours =
        env_or_u64("EPROFILE_QUARANTINE_HOURS", cfg.promotion.quarantine_hours);
    cfg.promotion.settle_secs = env_or_u64("EPROFILE_SETTLE_SECS", cfg.promotion.settle_secs);
    cfg.promotion.max_cycles = env_or_u32("EPROFILE_MAX_CYCLES", cfg.promotion.max_cycles);
    cfg.promotion.attempts_per_cycle = env_or_u32(
        "EPROFILE_ATTEMPTS_PER_CYCLE",
        cfg.promotion.attempts_per_cycle,
    );
    cfg.promotion.retry_interval_secs = env_or_u64(
        "EPROFILE_RETRY_INTERVAL_SECS",
        cfg.promotion.retry_interval_secs,
    );
    cfg.transfer.rsync_bin = env_or_string("EPROFILE_RSYNC_BIN", &cfg.transfer.rsync_bin);
    cfg.transfer.destination =
        env_or_string("EPROFILE_TRANSFER_DEST", &cfg.transfer.destination);
    cfg.transfer.password_file = env_optional_string(
        "EPROFILE_RSYNC_PASSWORD_FILE",
        cfg.transfer.password_file.take(),
    );
    cfg.transfer.timeout_secs =
        env_optional_u64("EPROFILE_TRANSFER_TIMEOUT_SECS", cfg.transfer.timeout_secs);
    if let Ok(raw) = env::var("EPROFILE_DELETION") {
        cfg.cleanup.deletion = DeletionPolicy::parse(&raw)
            .ok_or_else(|| {
                anyhow!("invalid EPROFILE_DELETION `{raw}`: use no-deletion, arrivals or direct")
            })?;
    }
    cfg.cleanup.arrivals_deleter_bin = env_or_string(
        "EPROFILE_ARRIVALS_DELETER_BIN",
        &cfg.cleanup.arrivals_deleter_bin,
    );

    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EprofileConfig::default();
        validate(&cfg).expect("defaults validate");
        assert_eq!(cfg.promotion.quarantine_hours, 48);
        assert_eq!(cfg.promotion.max_cycles, 5);
        assert_eq!(cfg.promotion.attempts_per_cycle, 3);
        assert_eq!(cfg.cleanup.deletion, DeletionPolicy::NoDeletion);
    }

    #[test]
    fn partial_toml_sections_keep_other_defaults() {
        let raw = r#"
[promotion]
quarantine_hours = 12

[cleanup]
deletion = "direct"

[lookup.operators]
"NEW-AGENCY" = "new-agency"
"#;
        let parsed: PartialEprofileConfig = toml::from_str(raw).expect("parse");
        let promotion = parsed.promotion.expect("promotion");
        assert_eq!(promotion.quarantine_hours, 12);
        assert_eq!(promotion.max_cycles, 5);
        assert_eq!(parsed.cleanup.expect("cleanup").deletion, DeletionPolicy::Direct);
        assert_eq!(
            parsed.lookup.expect("lookup").operators.get("NEW-AGENCY"),
            Some(&"new-agency".to_string())
        );
    }

    #[test]
    fn bad_timezone_and_zero_bounds_are_rejected() {
        let mut cfg = EprofileConfig::default();
        cfg.concat.history_timezone = "Mars/Olympus".to_string();
        assert!(validate(&cfg).is_err());

        let mut cfg = EprofileConfig::default();
        cfg.promotion.max_cycles = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn deletion_policy_accepts_legacy_names() {
        assert_eq!(DeletionPolicy::parse("notArrivals"), Some(DeletionPolicy::Direct));
        assert_eq!(DeletionPolicy::parse("keep"), Some(DeletionPolicy::NoDeletion));
        assert_eq!(DeletionPolicy::parse("arrivals"), Some(DeletionPolicy::Arrivals));
        assert_eq!(DeletionPolicy::parse("sometimes"), None);
    }
}
