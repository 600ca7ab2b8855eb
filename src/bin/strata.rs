//! # Strata CLI - Incremental hardlink snapshots
//!
//! Command-line front end for the Strata library.
//!
//! ## Usage
//! ```bash
//! # Register a mounted backup volume once
//! strata -b /mnt/backup register
//!
//! # Take a snapshot of / (the default command)
//! strata -b /mnt/backup
//!
//! # Take a snapshot of /home, printing every file decision
//! strata -b /mnt/backup -r /home -v backup
//!
//! # Remove leftovers marked for deletion
//! strata clean
//!
//! # List snapshots
//! strata list --json
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use strata::{OutputSink, RunReport, SilentSink, Strata, StrataBuilder, StrataConfig, StrataError};
use tracing_subscriber::EnvFilter;

/// Strata CLI - Incremental, hardlink-deduplicating snapshots
#[derive(Parser)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Incremental, hardlink-deduplicating filesystem snapshots")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./strata.toml, then /etc/strata/strata.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Mount point of the backup volume
    #[arg(short, long, global = true)]
    backup_location: Option<PathBuf>,

    /// Source root to back up
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Host name the backup home is named after
    #[arg(short = 'n', long, global = true)]
    hostname: Option<String>,

    /// Print every file decision and debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show a spinner while working
    #[arg(long, global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a snapshot (the default)
    Backup,

    /// Register the backup location as a backup device
    Register,

    /// Delete snapshots marked for deletion, then exit
    Clean,

    /// Delete the oldest snapshot, then exit
    DeleteOldest,

    /// List snapshots
    #[command(alias = "ls")]
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; the default level keeps warnings only
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let (message, code) = match e.downcast_ref::<StrataError>() {
            Some(err) => (err.user_message(), err.exit_code()),
            None => (format!("{:#}", e), 1),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        process::exit(code);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let show_progress = cli.progress && !cli.verbose;
    let spinner = show_progress.then(new_spinner);

    let sink: Box<dyn OutputSink> = match (&spinner, cli.verbose) {
        (_, true) => Box::new(|line: &str| println!("{}", line)),
        (Some(pb), false) => {
            let pb = pb.clone();
            Box::new(move |line: &str| pb.set_message(line.to_string()))
        }
        (None, false) => Box::new(SilentSink),
    };
    let strata = StrataBuilder::from_config(config).output_sink(sink).build();

    let result = match cli.command.unwrap_or(Commands::Backup) {
        Commands::Backup => cmd_backup(&strata, spinner.as_ref()),
        Commands::Register => cmd_register(&strata),
        Commands::Clean => cmd_clean(&strata),
        Commands::DeleteOldest => cmd_delete_oldest(&strata),
        Commands::List { json } => cmd_list(&strata, json),
    };

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    result
}

/// Configuration file merged with command-line overrides
fn load_config(cli: &Cli) -> anyhow::Result<StrataConfig> {
    let mut config = StrataConfig::discover(cli.config.as_deref()).context("loading configuration")?;
    if let Some(location) = &cli.backup_location {
        config.backup_location = Some(location.clone());
    }
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(hostname) = &cli.hostname {
        config.host_name = hostname.clone();
    }
    Ok(config)
}

fn new_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {wide_msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Starting...");
    pb
}

/// Take a snapshot and print a summary
fn cmd_backup(strata: &Strata, spinner: Option<&ProgressBar>) -> anyhow::Result<()> {
    let report = strata.run()?;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "{} Created snapshot {}",
        "✓".green().bold(),
        report.snapshot.to_string().yellow().bold()
    );
    if let Some(previous) = &report.previous {
        println!("  Linked against: {}", previous.to_string().cyan());
    }

    let stats = &report.stats;
    println!("  Copied: {} files ({})", stats.files_copied.to_string().cyan(), format_bytes(stats.bytes_copied).cyan());
    println!("  Linked: {} files", stats.files_linked.to_string().cyan());
    if stats.skipped > 0 {
        println!("  Skipped: {}", stats.skipped.to_string().yellow());
    }
    if stats.has_failures() {
        println!("  Failed: {} (see log)", stats.failed.to_string().red());
    }
    for recovered in &report.recovered {
        println!("  Cleaned up interrupted snapshot {}", recovered.yellow());
    }

    let retention = &report.retention;
    let removed = retention.sweep.swept.len() + retention.pruned_for_capacity.len();
    if removed > 0 {
        println!("  Removed: {} old snapshot(s)", removed.to_string().yellow());
    }
    for (name, error) in &retention.sweep.failures {
        println!("  {} could not delete {}: {}", "!".red(), name, error);
    }
    // Drop subseconds for display
    let elapsed = Duration::from_secs(report.elapsed.as_secs());
    println!("  Time: {}", format_duration(elapsed).to_string().cyan());
}

fn cmd_register(strata: &Strata) -> anyhow::Result<()> {
    strata.register()?;
    let location = strata.config().backup_location()?;
    println!(
        "{} The backup location {} is now registered.",
        "✓".green().bold(),
        location.display().to_string().cyan()
    );
    Ok(())
}

fn cmd_clean(strata: &Strata) -> anyhow::Result<()> {
    let report = strata.clean()?;
    println!(
        "{} Deleted {} marked snapshot(s)",
        "✓".green().bold(),
        report.swept.len().to_string().cyan()
    );
    for (name, error) in &report.failures {
        println!("  {} could not delete {}: {}", "!".red(), name, error);
    }
    Ok(())
}

fn cmd_delete_oldest(strata: &Strata) -> anyhow::Result<()> {
    let deleted = strata.delete_oldest()?;
    println!("{} Deleted {}", "✓".green().bold(), deleted.to_string().yellow());
    Ok(())
}

fn cmd_list(strata: &Strata, json: bool) -> anyhow::Result<()> {
    let home = strata.home()?;
    let snapshots = match home.snapshots() {
        Ok(snapshots) => snapshots,
        Err(StrataError::BackupHomeMissing(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let latest = home.latest().ok().flatten();

    if json {
        let entries: Vec<serde_json::Value> = snapshots
            .iter()
            .enumerate()
            .map(|(id, name)| {
                serde_json::json!({
                    "id": id,
                    "name": name.as_str(),
                    "latest": latest.as_ref() == Some(name),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("{}", StrataError::NoSnapshots.to_string().yellow());
        return Ok(());
    }
    for (id, name) in snapshots.iter().enumerate() {
        let marker = if latest.as_ref() == Some(name) {
            " (latest)".green().to_string()
        } else {
            String::new()
        };
        println!("{:>4}  {}{}", id.to_string().dimmed(), name, marker);
    }
    Ok(())
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
