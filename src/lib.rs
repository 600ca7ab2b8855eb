//! # Strata - Incremental hardlink snapshots
//!
//! Strata keeps a series of point-in-time copies of a directory tree on a
//! backup volume. Every snapshot is a complete, browsable tree, yet files
//! that did not change since the previous snapshot take no extra space:
//! they are hardlinks to the previous snapshot's copy.
//!
//! ## Overview
//!
//! - Snapshots are plain directories named by creation time
//!   (`2012-05-27-120728`), one collection per host under
//!   `<backup location>/Backups.backupdb/<host>`
//! - A file is copied when it is new or its modification time changed, and
//!   linked otherwise
//! - Only one run per backup home at a time, enforced with a PID lock file
//! - Interrupted snapshots are never mistaken for complete ones
//! - Old snapshots are thinned out by count, age, free space and a
//!   daily/weekly reduction scheme
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::StrataBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let strata = StrataBuilder::new()
//!     .root("/home")
//!     .backup_location("/mnt/backup")
//!     .ignore_patterns(vec!["*.tmp".to_string()])
//!     .max_images(60)
//!     .build();
//!
//! // Once per backup volume
//! strata.register()?;
//!
//! let report = strata.run()?;
//! println!(
//!     "{}: {} copied, {} linked",
//!     report.snapshot, report.stats.files_copied, report.stats.files_linked
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Loading a configuration file
//!
//! ```rust,no_run
//! use strata::{Strata, StrataConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StrataConfig::discover(None)?;
//! let strata = Strata::new(config);
//! for (id, snapshot) in strata.snapshots()?.iter().enumerate() {
//!     println!("{:>4}  {}", id, snapshot);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Snapshot states
//!
//! A snapshot is written as `<name>.part` and renamed to `<name>` when the
//! walk is done. Retention renames snapshots to `<name>.delete` and a sweep
//! removes those. The next run marks any `.part` directory it finds for
//! deletion, so a crash costs nothing but the unfinished snapshot.
//!
//! ### Retention
//!
//! Bucketed reduction, keep-days and max-count are planned against a single
//! listing, marked, then swept. Capacity pruning follows and removes the
//! oldest snapshot one at a time while the volume is over its threshold,
//! never touching the last one.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, StrataError>`. Errors are classified
//! with [`StrataError::is_fatal`] and [`StrataError::is_validation`];
//! per-file problems during a walk are not errors at all but are counted in
//! [`BackupStats::failed`].
//!
//! ## Module Organization
//!
//! - [`strata`]: the run orchestration and builder
//! - [`engine`]: tree replication
//! - [`classifier`]: new / modified / unchanged decisions
//! - [`lifecycle`]: in-progress, complete and recovery transitions
//! - [`snapshot`]: naming and the snapshot collection
//! - [`retention`]: pruning policies
//! - [`lock`]: single-instance lock
//! - [`config`], [`filter`], [`hooks`]: configuration, ignore rules, hook scripts
//! - [`types`], [`error`]: shared types and errors

// Public API modules
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod lifecycle;
pub mod lock;
pub mod retention;
pub mod snapshot;
pub mod strata;
pub mod types;

// Internal modules (not part of public API)
mod utils;

// Re-export main types for convenience
pub use config::{GroupSpec, StrataConfig};
pub use engine::BackupEngine;
pub use error::{Result, StrataError};
pub use filter::IgnoreRules;
pub use hooks::ScriptHooks;
pub use lifecycle::SnapshotLifecycle;
pub use lock::{LockFile, LockGuard, ProcessProbe, SystemProbe};
pub use retention::{RetentionEngine, RetentionPolicy, StatvfsProbe, UsageProbe};
pub use snapshot::{BackupHome, SnapshotName, SnapshotState};
pub use strata::{RunReport, Strata, StrataBuilder};
pub use types::*;
