//! Hook scripts run around a backup
//!
//! Each phase can point at a directory. Every executable regular file in it
//! runs in lexical order of its name, with no arguments and the hook
//! directory as working directory. A failing script is logged and the run
//! continues; hooks never change what a run does.

use crate::error::{Result, StrataError};
use crate::types::BackupHook;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// [`BackupHook`] that runs the scripts in per-phase directories
#[derive(Debug, Clone, Default)]
pub struct ScriptHooks {
    pre_backup: Option<PathBuf>,
    post_backup: Option<PathBuf>,
    pre_retention: Option<PathBuf>,
    post_retention: Option<PathBuf>,
}

impl ScriptHooks {
    /// Hooks with no directories configured
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the scripts in `dir` before each backup
    pub fn pre_backup_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.pre_backup = dir;
        self
    }

    /// Run the scripts in `dir` after each backup
    pub fn post_backup_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.post_backup = dir;
        self
    }

    /// Run the scripts in `dir` before retention
    pub fn pre_retention_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.pre_retention = dir;
        self
    }

    /// Run the scripts in `dir` after retention
    pub fn post_retention_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.post_retention = dir;
        self
    }

    fn fire(&self, phase: &str, dir: Option<&Path>) {
        let Some(dir) = dir else {
            return;
        };
        match run_hooks(dir) {
            Ok(0) => debug!("No {} hooks in {:?}", phase, dir),
            Ok(count) => info!("Ran {} {} hook(s)", count, phase),
            Err(e) => warn!("{} hooks failed: {}", phase, e),
        }
    }
}

impl BackupHook for ScriptHooks {
    fn pre_backup(&self) {
        self.fire("pre-backup", self.pre_backup.as_deref());
    }

    fn post_backup(&self) {
        self.fire("post-backup", self.post_backup.as_deref());
    }

    fn pre_retention(&self) {
        self.fire("pre-retention", self.pre_retention.as_deref());
    }

    fn post_retention(&self) {
        self.fire("post-retention", self.post_retention.as_deref());
    }
}

/// Executable regular files directly inside `dir`, sorted by name
pub fn executable_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .map_err(|e| StrataError::HookExecution(format!("cannot read {:?}: {}", dir, e)))?
    {
        let entry = entry?;
        let path = entry.path();
        let Ok(metadata) = fs::metadata(&path) else {
            continue;
        };
        if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Run every script in `dir`; returns how many were started
///
/// Scripts exiting non-zero, or failing to start, are logged and skipped.
pub fn run_hooks(dir: &Path) -> Result<usize> {
    let scripts = executable_files(dir)?;
    let mut started = 0;

    for script in &scripts {
        debug!("Running hook {:?}", script);
        match Command::new(script).current_dir(dir).status() {
            Ok(status) if status.success() => started += 1,
            Ok(status) => {
                started += 1;
                warn!("Hook {:?} exited with {}", script, status);
            }
            Err(e) => warn!("Unable to start hook {:?}: {}", script, e),
        }
    }
    Ok(started)
}
