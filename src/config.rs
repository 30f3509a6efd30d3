//! Storage configuration.
//!
//! Loaded from TOML by tools that manage a named segment, or built in code
//! through [`StorageBuilder`](crate::StorageBuilder). Every field has a
//! default, so an empty file is a valid configuration.

use crate::error::{StorageError, StorageResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Storage configuration loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Size of the key region (header, cursor table, and slot array).
    /// Ignored when `hashtable_power` is set.
    #[serde(
        default = "default_key_region_size",
        deserialize_with = "deserialize_size"
    )]
    pub key_region_size: usize,

    /// Size of key region plus value region (e.g., "68MB").
    #[serde(default = "default_total_size", deserialize_with = "deserialize_size")]
    pub total_size: usize,

    /// Slot table power (2^power slots). Derived from `key_region_size`
    /// when unset.
    #[serde(default)]
    pub hashtable_power: Option<u8>,

    /// Smallest value segment the region is split into.
    #[serde(
        default = "default_min_segment_size",
        deserialize_with = "deserialize_size"
    )]
    pub min_segment_size: usize,

    /// Largest accepted value. Values never exceed 2^24 - 1 bytes regardless.
    #[serde(
        default = "default_max_value_size",
        deserialize_with = "deserialize_size"
    )]
    pub max_value_size: usize,

    /// Payloads shorter than this are checksummed in full; longer payloads
    /// only have this many leading bytes covered.
    #[serde(default = "default_full_checksum_threshold")]
    pub full_checksum_threshold: usize,

    /// Segment backend: "anonymous", "named", or "heap".
    #[serde(default)]
    pub backend: BackendKind,

    /// File name of the named segment.
    #[serde(default = "default_name")]
    pub name: String,

    /// Directory holding the named segment.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Hugepage preference for the anonymous backend: "none", "2mb", or "1gb".
    #[serde(default)]
    pub hugepage: HugepageSize,

    /// Logging configuration.
    #[serde(default)]
    pub log: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_region_size: default_key_region_size(),
            total_size: default_total_size(),
            hashtable_power: None,
            min_segment_size: default_min_segment_size(),
            max_value_size: default_max_value_size(),
            full_checksum_threshold: default_full_checksum_threshold(),
            backend: BackendKind::default(),
            name: default_name(),
            directory: default_directory(),
            hugepage: HugepageSize::default(),
            log: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(contents: &str) -> StorageResult<Self> {
        let config: Config =
            toml::from_str(contents).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> StorageResult<()> {
        if let Some(power) = self.hashtable_power
            && !(1..=31).contains(&power)
        {
            return Err(StorageError::Config(format!(
                "hashtable_power ({}) must be between 1 and 31",
                power
            )));
        }

        if self.hashtable_power.is_none() && self.key_region_size == 0 {
            return Err(StorageError::Config(
                "key_region_size must be non-zero".to_string(),
            ));
        }

        if self.total_size <= self.key_region_size && self.hashtable_power.is_none() {
            return Err(StorageError::Config(format!(
                "total_size ({}) must exceed key_region_size ({})",
                self.total_size, self.key_region_size
            )));
        }

        if self.min_segment_size == 0 {
            return Err(StorageError::Config(
                "min_segment_size must be non-zero".to_string(),
            ));
        }

        if self.max_value_size == 0 {
            return Err(StorageError::Config(
                "max_value_size must be non-zero".to_string(),
            ));
        }

        if self.full_checksum_threshold == 0 {
            return Err(StorageError::Config(
                "full_checksum_threshold must be non-zero".to_string(),
            ));
        }

        if self.backend == BackendKind::Named && self.name.is_empty() {
            return Err(StorageError::Config(
                "named backend requires a segment name".to_string(),
            ));
        }

        Ok(())
    }

    /// Full path of the named segment.
    pub fn segment_path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

/// Segment backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Anonymous shared mapping, inherited by forked children.
    #[default]
    Anonymous,
    /// Named file mapping that unrelated processes can attach to.
    Named,
    /// Process-local heap allocation.
    Heap,
}

/// Hugepage preference of the anonymous backend: "none", "2mb" or "1gb".
///
/// Falls back to regular pages if hugepages are unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum HugepageSize {
    /// Regular pages only.
    #[default]
    #[serde(rename = "none")]
    None,
    /// 2MB hugepages (Linux only).
    #[serde(rename = "2mb", alias = "2MB")]
    TwoMegabyte,
    /// 1GB hugepages (Linux only).
    #[serde(rename = "1gb", alias = "1GB")]
    OneGigabyte,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "shmcache=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target.
    #[serde(default)]
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, multi-line.
    Pretty,
    /// Human readable, single line.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

fn default_key_region_size() -> usize {
    4 * MB
}

fn default_total_size() -> usize {
    68 * MB
}

fn default_min_segment_size() -> usize {
    4 * MB
}

fn default_max_value_size() -> usize {
    MB
}

fn default_full_checksum_threshold() -> usize {
    256
}

fn default_name() -> String {
    "shmcache".to_string()
}

fn default_directory() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Sizes are either a plain byte count or a string such as "64MB".
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(usize),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(bytes) => Ok(bytes),
        Size::Text(text) => parse_size(&text).map_err(<D::Error as serde::de::Error>::custom),
    }
}

/// Parse a size such as "4096", "512KB", "64MB" or "1GiB" into bytes.
///
/// Suffixes are binary multiples and case insensitive.
pub fn parse_size(text: &str) -> StorageResult<usize> {
    let invalid = |why: &str| StorageError::Config(format!("size {:?}: {}", text, why));

    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(invalid("missing number"));
    }
    let count: usize = digits.parse().map_err(|_| invalid("number out of range"))?;

    let shift = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        _ => return Err(invalid("unknown unit")),
    };

    count
        .checked_mul(1 << shift)
        .ok_or_else(|| invalid("too large"))
}
