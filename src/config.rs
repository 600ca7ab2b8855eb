//! Configuration for a Strata installation
//!
//! Loaded from a TOML file and overridable field by field from the command
//! line or from code:
//!
//! ```toml
//! root = "/"
//! backup_location = "/mnt/backup"
//! ignore = ["/tmp", "/proc", "*.swp"]
//! max_file_size_mb = 2048
//! max_images = 0
//! keep_days = 0
//! drive_percentage = 95
//! reduce_backups = true
//! backup_group = "backup"
//! pre_backup_hooks = "/etc/strata/pre-backup.d"
//! ```

use crate::error::{Result, StrataError};
use crate::retention::RetentionPolicy;
use crate::snapshot::BackupHome;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name looked up by [`StrataConfig::discover`]
pub const CONFIG_FILE_NAME: &str = "strata.toml";

/// System-wide locations searched after the working directory
pub const SYSTEM_CONFIG_PATHS: &[&str] = &[
    "/etc/strata/strata.toml",
    "/usr/local/etc/strata/strata.toml",
];

/// Group owning new snapshots, by name or by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupSpec {
    /// Numeric group id
    Id(u32),
    /// Group name resolved through the group database
    Name(String),
}

impl GroupSpec {
    /// Resolve to a numeric group id
    pub fn resolve(&self) -> Result<u32> {
        match self {
            GroupSpec::Id(gid) => Ok(*gid),
            GroupSpec::Name(name) => {
                if let Ok(gid) = name.parse::<u32>() {
                    return Ok(gid);
                }
                nix::unistd::Group::from_name(name)
                    .map_err(|e| StrataError::validation(format!("cannot look up group {}: {}", name, e)))?
                    .map(|group| group.gid.as_raw())
                    .ok_or_else(|| StrataError::validation(format!("unknown group {}", name)))
            }
        }
    }
}

/// Settings of one backup setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrataConfig {
    /// Source root to back up
    pub root: PathBuf,
    /// Mount point of the backup volume
    pub backup_location: Option<PathBuf>,
    /// Host name the backup home is named after
    pub host_name: String,
    /// Gitignore-style patterns, relative to `root` or absolute under it
    pub ignore: Vec<String>,
    /// Skip files larger than this many MiB (0 = unlimited)
    pub max_file_size_mb: u64,
    /// Keep at most this many snapshots (0 = unlimited)
    pub max_images: usize,
    /// Remove snapshots older than this many days (0 = never)
    pub keep_days: u32,
    /// Prune while the backup volume is fuller than this percentage (0 = never)
    pub drive_percentage: u8,
    /// Thin snapshots out to daily and weekly
    pub reduce_backups: bool,
    /// Group owner of new snapshots; the process group when unset
    pub backup_group: Option<GroupSpec>,
    /// Directory of scripts run before each backup
    pub pre_backup_hooks: Option<PathBuf>,
    /// Directory of scripts run after each backup
    pub post_backup_hooks: Option<PathBuf>,
    /// Directory of scripts run before retention
    pub pre_retention_hooks: Option<PathBuf>,
    /// Directory of scripts run after retention
    pub post_retention_hooks: Option<PathBuf>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            backup_location: None,
            host_name: default_host_name(),
            ignore: Vec::new(),
            max_file_size_mb: 0,
            max_images: 0,
            keep_days: 0,
            drive_percentage: 0,
            reduce_backups: false,
            backup_group: None,
            pre_backup_hooks: None,
            post_backup_hooks: None,
            pre_retention_hooks: None,
            post_retention_hooks: None,
        }
    }
}

/// Local host name, or `localhost` when it can't be read
pub fn default_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl StrataConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            StrataError::validation(format!("cannot read config file {:?}: {}", path, e))
        })?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load `explicit` if given, else the first config file found in the
    /// working directory or the system locations, else the defaults
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let candidates = std::iter::once(PathBuf::from(CONFIG_FILE_NAME))
            .chain(SYSTEM_CONFIG_PATHS.iter().map(PathBuf::from));
        for candidate in candidates {
            if candidate.is_file() {
                return Self::load(&candidate);
            }
        }
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Check the configuration before anything on disk is touched
    pub fn validate(&self) -> Result<()> {
        let location = self.backup_location()?;
        if !location.is_dir() {
            return Err(StrataError::validation(format!(
                "backup location {:?} does not exist",
                location
            )));
        }
        if !self.root.is_dir() {
            return Err(StrataError::validation(format!(
                "root {:?} does not exist",
                self.root
            )));
        }
        if self.host_name.is_empty() || self.host_name.contains('/') {
            return Err(StrataError::validation(format!(
                "invalid host name {:?}",
                self.host_name
            )));
        }
        if self.drive_percentage > 100 {
            return Err(StrataError::validation(format!(
                "drive_percentage must be between 0 and 100, got {}",
                self.drive_percentage
            )));
        }
        for (name, dir) in self.hook_dirs() {
            if let Some(dir) = dir {
                if !dir.is_dir() {
                    return Err(StrataError::validation(format!(
                        "{} directory {:?} does not exist",
                        name, dir
                    )));
                }
            }
        }
        if let Some(group) = &self.backup_group {
            group.resolve()?;
        }
        Ok(())
    }

    fn hook_dirs(&self) -> [(&'static str, Option<&Path>); 4] {
        [
            ("pre_backup_hooks", self.pre_backup_hooks.as_deref()),
            ("post_backup_hooks", self.post_backup_hooks.as_deref()),
            ("pre_retention_hooks", self.pre_retention_hooks.as_deref()),
            ("post_retention_hooks", self.post_retention_hooks.as_deref()),
        ]
    }

    /// Backup location, which must be set
    pub fn backup_location(&self) -> Result<&Path> {
        self.backup_location
            .as_deref()
            .ok_or_else(|| StrataError::validation("no backup location was provided"))
    }

    /// Backup home of this host on the backup location
    pub fn backup_home(&self) -> Result<BackupHome> {
        Ok(BackupHome::for_host(self.backup_location()?, &self.host_name))
    }

    /// Size limit in bytes (0 = unlimited)
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Group id for new snapshots, defaulting to the process group
    pub fn group_id(&self) -> Result<u32> {
        match &self.backup_group {
            Some(group) => group.resolve(),
            None => Ok(nix::unistd::getgid().as_raw()),
        }
    }

    /// Retention thresholds from this configuration
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            reduce_backups: self.reduce_backups,
            keep_days: self.keep_days,
            max_images: self.max_images,
            drive_percentage: self.drive_percentage,
        }
    }
}
