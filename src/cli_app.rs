//! Top-level CLI definition and dispatch.

use std::fmt::Write as _;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use colored::{ColoredString, Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use zfs_snapshot_cleaner::core::config::{Config, PoolConfig};
use zfs_snapshot_cleaner::core::errors::ZscError;
use zfs_snapshot_cleaner::logger::ActivityLog;
use zfs_snapshot_cleaner::model::accounting::RunMode;
use zfs_snapshot_cleaner::platform::files::LocalFiles;
use zfs_snapshot_cleaner::platform::zfs::ZfsCommand;
use zfs_snapshot_cleaner::policy::keep::KeepVerdict;
use zfs_snapshot_cleaner::reaper::run::{RunReport, Runner, SnapshotStatus, unknown_pool};

/// ZFS snapshot cleaner: retention policies, file pruning and capacity eviction.
#[derive(Debug, Parser)]
#[command(
    name = "zsc",
    author,
    version,
    about = "ZFS snapshot cleaner - policy-driven snapshot retention",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Debug diagnostics.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Warnings and errors only.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Destroy expired snapshots, prune files, and evict under capacity pressure.
    Clean(RunArgs),
    /// Print the keep status of every snapshot.
    List(RunArgs),
    /// Load and validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args, Default)]
struct RunArgs {
    /// Actually issue destroy/hold/release and delete files (default: preview).
    #[arg(short, long)]
    force: bool,
    /// Restrict the run to one configured pool.
    #[arg(long, value_name = "NAME")]
    pool: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Storage, filesystem or environment failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<ZscError> for CliError {
    fn from(err: ZscError) -> Self {
        match err {
            ZscError::SnapshotDestroyed { .. } => Self::Internal(err.to_string()),
            ZscError::UnknownEntity { .. } => Self::User(err.to_string()),
            err if err.is_config_error() => Self::User(err.to_string()),
            err => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }
    init_tracing(cli);

    match &cli.command {
        Command::Clean(args) => run_clean(cli, args),
        Command::List(args) => run_list(cli, args),
        Command::Validate => run_validate(cli),
    }
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else if cli.quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };
    // A subscriber may already be installed when run() is driven from tests.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(!cli.no_color && io::stderr().is_terminal())
        .with_writer(io::stderr)
        .try_init();
}

// ──────────────────── commands ────────────────────

fn selected_pools<'c>(config: &'c Config, pool: Option<&str>) -> Result<Vec<&'c PoolConfig>, CliError> {
    match pool {
        Some(name) => config
            .pool(name)
            .map(|p| vec![p])
            .ok_or_else(|| unknown_pool(name).into()),
        None => Ok(config.pools.iter().collect()),
    }
}

fn announce_mode(mode: RunMode) {
    if mode.is_dry_run() {
        tracing::warn!("--force is not provided, we will NOT clean anything");
    } else {
        tracing::warn!("--force is provided, we will actually clean");
    }
}

fn run_clean(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let pools = selected_pools(&config, args.pool.as_deref())?;
    let mode = RunMode::from_force(args.force);
    announce_mode(mode);
    if pools.is_empty() {
        tracing::warn!("no pool configured, nothing to do");
    }

    let now = Local::now().naive_local();
    let storage = ZfsCommand::new(config.zfs.binary.clone());
    let files = LocalFiles::new(now);
    let mut audit = ActivityLog::from_path(
        config.logging.activity_log.clone(),
        config.logging.max_log_bytes,
    );
    let runner = Runner::new(&storage, &files, mode, now).with_config_hash(config.stable_hash()?);

    for pool in pools {
        let report = runner.clean(pool, &mut audit)?;
        match output_mode(cli) {
            OutputMode::Human => print!("{}", render_report_human(&report)),
            OutputMode::Json => write_json_line(&json!({
                "command": "clean",
                "report": serde_json::to_value(&report)?,
            }))?,
        }
    }
    Ok(())
}

fn run_list(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let pools = selected_pools(&config, args.pool.as_deref())?;
    let mode = RunMode::from_force(args.force);
    announce_mode(mode);

    let now = Local::now().naive_local();
    let storage = ZfsCommand::new(config.zfs.binary.clone());
    let files = LocalFiles::new(now);
    let mut audit = ActivityLog::from_path(
        config.logging.activity_log.clone(),
        config.logging.max_log_bytes,
    );
    let runner = Runner::new(&storage, &files, mode, now);

    for pool in pools {
        let statuses = runner.list(pool, &mut audit)?;
        match output_mode(cli) {
            OutputMode::Human => print!("{}", render_statuses_human(&statuses)),
            OutputMode::Json => write_json_line(&json!({
                "command": "list",
                "pool": pool.name,
                "dry_run": mode.is_dry_run(),
                "snapshots": serde_json::to_value(&statuses)?,
            }))?,
        }
    }
    audit.flush();
    Ok(())
}

fn run_validate(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let mut pools = Vec::with_capacity(config.pools.len());
    for pool in &config.pools {
        let mut datasets = Vec::with_capacity(pool.datasets.len());
        for dataset in &pool.datasets {
            let policy = dataset.to_policy()?;
            datasets.push(json!({
                "name": dataset.name,
                "retention_policy": policy.retention_policy.map(|r| r.to_string()),
                "max_retention": policy.max_retention.map(|r| r.to_string()),
                "max_file_age": policy.max_file_age.map(|a| a.to_string()),
                "max_capacity": policy.max_capacity,
                "mount_point": policy.mount_point,
            }));
        }
        pools.push(json!({
            "name": pool.name,
            "max_capacity": pool.max_capacity,
            "best_effort_policy": pool.tie_break()?.to_string(),
            "datasets": datasets,
        }));
    }
    let payload = json!({
        "command": "validate",
        "valid": true,
        "config_file": config.source,
        "config_hash": config.stable_hash()?,
        "pools": pools,
    });

    match output_mode(cli) {
        OutputMode::Human => print!("{}", render_validation_human(&payload)),
        OutputMode::Json => write_json_line(&payload)?,
    }
    Ok(())
}

// ──────────────────── rendering ────────────────────

fn status_label(verdict: KeepVerdict) -> ColoredString {
    let label = verdict.status_label();
    match verdict {
        KeepVerdict::Keep => label.green(),
        KeepVerdict::Destroy => label.red(),
        KeepVerdict::BestEffort => label.yellow(),
    }
}

fn render_statuses_human(statuses: &[SnapshotStatus]) -> String {
    let mut out = String::new();
    for status in statuses {
        let _ = writeln!(out, "{} {}", status.snapshot, status_label(status.verdict));
    }
    out
}

fn render_report_human(report: &RunReport) -> String {
    let mut out = String::new();
    let mode = if report.dry_run { "preview" } else { "executed" };
    let _ = writeln!(out, "{} {} ({mode})", "pool".bold(), report.pool.bold());
    let _ = writeln!(out, "  Used by data        {:>16}", report.referenced);
    let _ = writeln!(out, "  Used by snapshots   {:>16}", report.snapshot_space);
    let _ = writeln!(out, "  Available           {:>16}", report.available);
    let _ = writeln!(out, "                      {:>16}", "----------------");
    let _ = writeln!(out, "  Total size          {:>16}", report.total);
    let _ = writeln!(out, "  {} snapshots", report.snapshot_count);
    for (tag, count) in &report.tag_counts {
        let _ = writeln!(out, "  {count} snapshots held as '{tag}'");
    }
    let _ = writeln!(
        out,
        "  destroyed {} snapshot(s), placed {} hold(s), released {} hold(s)",
        report.destroyed.len(),
        report.holds_placed.len(),
        report.holds_released.len()
    );
    let _ = writeln!(
        out,
        "  deleted {} file(s) ({} bytes), {} director(ies)",
        report.files_deleted, report.file_bytes_deleted, report.dirs_deleted
    );
    let capacity = format!("{:.1}%", report.final_capacity * 100.0);
    if report.stopped_best_effort {
        let _ = writeln!(
            out,
            "  capacity {} {}",
            capacity.red(),
            "(still over threshold, nothing left to destroy)".red()
        );
    } else {
        let _ = writeln!(out, "  capacity {capacity}");
    }
    out
}

fn render_validation_human(payload: &Value) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "configuration OK".green());
    let pools = payload["pools"].as_array().map_or(&[][..], Vec::as_slice);
    if pools.is_empty() {
        let _ = writeln!(out, "no pool configured");
    }
    for pool in pools {
        let _ = writeln!(
            out,
            "pool {} (max capacity {}, best effort {})",
            text(&pool["name"]).bold(),
            pool["max_capacity"],
            text(&pool["best_effort_policy"])
        );
        for dataset in pool["datasets"].as_array().map_or(&[][..], Vec::as_slice) {
            let _ = writeln!(out, "  {}", text(&dataset["name"]));
            for key in ["retention_policy", "max_retention", "max_file_age", "max_capacity", "mount_point"] {
                if !dataset[key].is_null() {
                    let _ = writeln!(out, "    {key:<17} {}", text(&dataset[key]));
                }
            }
        }
    }
    out
}

/// String value without JSON quoting.
fn text(value: &Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), str::to_string)
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("ZSC_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
