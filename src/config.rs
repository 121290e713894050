use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PersistitError, Result};

/// Page sizes a volume may be created with.
pub const VALID_PAGE_SIZES: [usize; 5] = [1024, 2048, 4096, 8192, 16384];

/// Default journal file size.
pub const DEFAULT_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

/// Smallest journal block size accepted, so unit tests can roll files over.
pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

/// Durability policy applied when a transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitPolicy {
    /// Every commit fsyncs before returning.
    Hard,
    /// The caller waits for the next scheduled flush tick.
    Group,
    /// Like `Group` with a shorter tick.
    Commit,
}

impl CommitPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitPolicy::Hard => "hard",
            CommitPolicy::Group => "group",
            CommitPolicy::Commit => "commit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hard" => Some(CommitPolicy::Hard),
            "group" => Some(CommitPolicy::Group),
            "commit" => Some(CommitPolicy::Commit),
            _ => None,
        }
    }
}

/// Engine-wide configuration, passed once to [`crate::Persistit::open`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Directory holding journal files.
    pub journal_path: PathBuf,
    /// Journal file name prefix; files are `<prefix>.<16 hex digits>`.
    pub journal_prefix: String,
    /// Size at which a journal file rolls over.
    pub journal_block_size: u64,
    /// Frame counts per page size: `(page_size, frame_count)`.
    pub buffer_pools: Vec<(usize, usize)>,
    pub commit_policy: CommitPolicy,
    /// Flush tick for `group` commits, milliseconds.
    pub group_commit_interval_ms: u64,
    /// Flush tick for `commit` commits, milliseconds.
    pub commit_interval_ms: u64,
    /// Background checkpoint period, milliseconds (0 disables).
    pub checkpoint_interval_ms: u64,
    /// Copier pass period, milliseconds.
    pub copier_interval_ms: u64,
    /// Pages copied back per copier pass.
    pub copier_pages_per_pass: usize,
    /// Copier accelerates when recent IO falls below this rate.
    pub quiescent_io_threshold_kb: u64,
    /// Deadline for claim acquisition, milliseconds.
    pub claim_timeout_ms: u64,
    /// Grace window for background workers to drain on close, milliseconds.
    pub close_grace_ms: u64,
    /// Directory for `temporary`-flagged volumes; `None` uses the OS default.
    pub tmp_dir: Option<PathBuf>,
    /// Optional binary IO-meter diagnostic log.
    pub io_log_path: Option<PathBuf>,
    /// Volume specifications opened at startup, in `path[,option]*` form.
    pub volumes: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            journal_path: PathBuf::from("."),
            journal_prefix: "persistit_journal".to_string(),
            journal_block_size: DEFAULT_BLOCK_SIZE,
            buffer_pools: vec![(16384, 512)],
            commit_policy: CommitPolicy::Group,
            group_commit_interval_ms: 10,
            commit_interval_ms: 2,
            checkpoint_interval_ms: 120_000,
            copier_interval_ms: 50,
            copier_pages_per_pass: 32,
            quiescent_io_threshold_kb: 100,
            claim_timeout_ms: 10_000,
            close_grace_ms: 5_000,
            tmp_dir: None,
            io_log_path: None,
            volumes: Vec::new(),
        }
    }
}

impl Configuration {
    /// Every commit durable before returning; slowest, safest.
    pub fn durable() -> Self {
        Self {
            commit_policy: CommitPolicy::Hard,
            ..Self::default()
        }
    }

    /// Batched commits and a long checkpoint period.
    pub fn throughput() -> Self {
        Self {
            commit_policy: CommitPolicy::Group,
            group_commit_interval_ms: 50,
            checkpoint_interval_ms: 600_000,
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Configuration = toml::from_str(text)
            .map_err(|e| PersistitError::InvalidVolumeSpecification(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.journal_block_size < MIN_BLOCK_SIZE {
            return Err(PersistitError::IllegalState("journal block size too small"));
        }
        if self.buffer_pools.is_empty() {
            return Err(PersistitError::IllegalState("no buffer pools configured"));
        }
        for &(size, count) in &self.buffer_pools {
            if !VALID_PAGE_SIZES.contains(&size) {
                return Err(PersistitError::IllegalState("invalid buffer pool page size"));
            }
            if count < 4 {
                return Err(PersistitError::IllegalState("buffer pool too small"));
            }
        }
        Ok(())
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn flush_tick(&self) -> Duration {
        let ms = match self.commit_policy {
            CommitPolicy::Hard => 1,
            CommitPolicy::Group => self.group_commit_interval_ms.max(1),
            CommitPolicy::Commit => self.commit_interval_ms.max(1),
        };
        Duration::from_millis(ms)
    }
}

/// Parsed form of a `path[,option]*` volume specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpecification {
    pub path: PathBuf,
    pub alias: Option<String>,
    pub drive: Option<String>,
    pub read_only: bool,
    pub create: bool,
    pub create_only: bool,
    pub temporary: bool,
    pub id: Option<u64>,
    pub page_size: Option<usize>,
    pub initial_pages: Option<u64>,
    pub extension_pages: Option<u64>,
    pub maximum_pages: Option<u64>,
}

impl VolumeSpecification {
    /// Parses the comma-separated textual form of spec options.
    ///
    /// `readOnly`, `create`, `createOnly` and `temporary` are mutually
    /// exclusive; `*Size` variants round up to whole pages and require
    /// `bufferSize` to appear first.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split(',').map(str::trim);
        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| PersistitError::InvalidVolumeSpecification("empty path".to_string()))?;
        let mut spec = VolumeSpecification {
            path: PathBuf::from(path),
            alias: None,
            drive: None,
            read_only: false,
            create: false,
            create_only: false,
            temporary: false,
            id: None,
            page_size: None,
            initial_pages: None,
            extension_pages: None,
            maximum_pages: None,
        };
        for part in parts {
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.split_once(':') {
                Some((n, v)) => (n, Some(v)),
                None => (part, None),
            };
            match (name, value) {
                ("readOnly", None) => spec.read_only = true,
                ("create", None) => spec.create = true,
                ("createOnly", None) => spec.create_only = true,
                ("temporary", None) => spec.temporary = true,
                ("alias", Some(v)) => spec.alias = Some(v.to_string()),
                ("drive", Some(v)) => spec.drive = Some(v.to_string()),
                ("id", Some(v)) => spec.id = Some(parse_number(part, v)?),
                ("bufferSize", Some(v)) => {
                    let size = parse_number(part, v)? as usize;
                    if !VALID_PAGE_SIZES.contains(&size) {
                        return Err(PersistitError::InvalidVolumeSpecification(format!(
                            "invalid bufferSize {size}"
                        )));
                    }
                    spec.page_size = Some(size);
                }
                ("initialPages", Some(v)) => spec.initial_pages = Some(parse_number(part, v)?),
                ("extensionPages", Some(v)) => spec.extension_pages = Some(parse_number(part, v)?),
                ("maximumPages", Some(v)) => spec.maximum_pages = Some(parse_number(part, v)?),
                ("initialSize", Some(v)) => {
                    spec.initial_pages = Some(spec.pages_for(parse_number(part, v)?, part)?)
                }
                ("extensionSize", Some(v)) => {
                    spec.extension_pages = Some(spec.pages_for(parse_number(part, v)?, part)?)
                }
                ("maximumSize", Some(v)) => {
                    spec.maximum_pages = Some(spec.pages_for(parse_number(part, v)?, part)?)
                }
                _ => {
                    return Err(PersistitError::InvalidVolumeSpecification(format!(
                        "unrecognized option {part}"
                    )))
                }
            }
        }
        let exclusive = [spec.read_only, spec.create, spec.create_only, spec.temporary]
            .iter()
            .filter(|&&flag| flag)
            .count();
        if exclusive > 1 {
            return Err(PersistitError::InvalidVolumeSpecification(
                "readOnly, create, createOnly and temporary are mutually exclusive".to_string(),
            ));
        }
        Ok(spec)
    }

    fn pages_for(&self, bytes: u64, option: &str) -> Result<u64> {
        let page_size = self.page_size.ok_or_else(|| {
            PersistitError::InvalidVolumeSpecification(format!(
                "{option} requires bufferSize to be specified first"
            ))
        })? as u64;
        Ok(bytes.div_ceil(page_size))
    }

    /// The name trees are addressed by: the alias, or the file stem.
    pub fn name(&self) -> Result<String> {
        if let Some(alias) = &self.alias {
            return Ok(alias.clone());
        }
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                PersistitError::UnderSpecifiedVolume(self.path.display().to_string())
            })
    }
}

fn parse_number(option: &str, value: &str) -> Result<u64> {
    // Accept K/M/G suffixes the way sizes are usually written.
    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b'K') | Some(b'k') => (&value[..value.len() - 1], 1024u64),
        Some(b'M') | Some(b'm') => (&value[..value.len() - 1], 1024 * 1024),
        Some(b'G') | Some(b'g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| PersistitError::InvalidVolumeSpecification(format!("bad number in {option}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_specification() -> Result<()> {
        let spec = VolumeSpecification::parse(
            "/tmp/data.v01,create,bufferSize:4096,initialPages:16,extensionPages:8,maximumPages:64,alias:data",
        )?;
        assert!(spec.create);
        assert_eq!(spec.page_size, Some(4096));
        assert_eq!(spec.initial_pages, Some(16));
        assert_eq!(spec.maximum_pages, Some(64));
        assert_eq!(spec.name()?, "data");
        Ok(())
    }

    #[test]
    fn size_options_round_up_to_pages() -> Result<()> {
        let spec =
            VolumeSpecification::parse("/tmp/x.v01,create,bufferSize:4096,initialSize:10000")?;
        assert_eq!(spec.initial_pages, Some(3));
        Ok(())
    }

    #[test]
    fn size_before_buffer_size_is_rejected() {
        let err = VolumeSpecification::parse("/tmp/x.v01,initialSize:10000").unwrap_err();
        assert!(matches!(
            err,
            PersistitError::InvalidVolumeSpecification(_)
        ));
    }

    #[test]
    fn exclusive_flags_are_rejected() {
        let err = VolumeSpecification::parse("/tmp/x.v01,create,readOnly").unwrap_err();
        assert!(matches!(
            err,
            PersistitError::InvalidVolumeSpecification(_)
        ));
    }

    #[test]
    fn suffixed_sizes_parse() -> Result<()> {
        let spec = VolumeSpecification::parse("/tmp/x.v01,bufferSize:4096,maximumSize:1M")?;
        assert_eq!(spec.maximum_pages, Some(256));
        Ok(())
    }

    #[test]
    fn commit_policy_names() {
        assert_eq!(CommitPolicy::parse("hard"), Some(CommitPolicy::Hard));
        assert_eq!(CommitPolicy::parse("group"), Some(CommitPolicy::Group));
        assert_eq!(CommitPolicy::parse("commit"), Some(CommitPolicy::Commit));
        assert_eq!(CommitPolicy::parse("other"), None);
    }

    #[test]
    fn configuration_from_toml() -> Result<()> {
        let config = Configuration::from_toml_str(
            r#"
            journal_prefix = "testjournal"
            commit_policy = "hard"
            buffer_pools = [[4096, 64]]
            "#,
        )?;
        assert_eq!(config.journal_prefix, "testjournal");
        assert_eq!(config.commit_policy, CommitPolicy::Hard);
        assert_eq!(config.buffer_pools, vec![(4096, 64)]);
        Ok(())
    }
}
