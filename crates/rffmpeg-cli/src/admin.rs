//! Operator commands, available when the binary is invoked as `rffmpeg`.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rffmpeg_core::{
    Candidate, DirectoryTracker, HostCatalog, LoadTracker, RecordId, RffmpegConfig, config_path,
    logging, rank, select,
};
use rffmpeg_proto::{LOCAL_CLAIM, LoadView, SelectedTarget, StateLine};
use serde::Serialize;
use tracing::{debug, info, warn};

/// rffmpeg - run ffmpeg and ffprobe on remote hosts
#[derive(Parser, Debug)]
#[command(name = "rffmpeg", version, about)]
pub struct Cli {
    /// Configuration file (defaults to $RFFMPEG_CONFIG or /etc/rffmpeg/rffmpeg.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show configured hosts, their load, and the next target
    Status(StatusArgs),

    /// Remove state records left behind by dead processes
    Clean(CleanArgs),

    /// Exclude a host from selection until cleared
    MarkBad(HostArgs),

    /// Return a host marked bad by an operator to selection
    ClearBad(HostArgs),
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Show what would be removed without removing anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct HostArgs {
    /// Host name as written in the configuration
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for programmatic access
    Json,
}

pub fn execute(cli: Cli) -> Result<()> {
    logging::init_stderr_logging(cli.verbose);

    let path = cli.config.unwrap_or_else(config_path);
    let config = RffmpegConfig::from_file(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let tracker = DirectoryTracker::from_config(&config)
        .context("Failed to open the state directory")?;
    debug!(state_dir = %tracker.dir().display(), "Using state directory");

    match cli.command {
        Commands::Status(args) => {
            let catalog = HostCatalog::load(&config);
            let report = StatusReport::build(&catalog, &tracker.snapshot());
            match args.format {
                OutputFormat::Table => print!("{}", report.render_table()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Clean(args) => {
            let stale = stale_records(&tracker, pid_alive, std::process::id());
            if stale.is_empty() {
                println!("Nothing to clean: no stale state records");
                return Ok(());
            }
            if args.dry_run {
                println!("Dry run: Would remove:");
            }
            for id in stale {
                let path = tracker.record_path(id);
                if args.dry_run {
                    println!("  {}", path.display());
                    continue;
                }
                tracker
                    .remove(id)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                info!(record = %id, "Removed stale state record");
                println!("Removed: {}", path.display());
            }
        }
        Commands::MarkBad(args) => {
            if HostCatalog::load(&config).get(&args.host).is_none() {
                warn!("Host '{}' is not in the configuration", args.host);
            }
            if mark_bad(&tracker, &args.host)? {
                println!("Marked '{}' bad", args.host);
            } else {
                println!("'{}' is already marked bad", args.host);
            }
        }
        Commands::ClearBad(args) => {
            if clear_bad(&tracker, &args.host)? {
                println!("Cleared bad mark on '{}'", args.host);
            } else {
                println!("'{}' was not marked bad by an operator", args.host);
            }
        }
    }

    Ok(())
}

/// Load snapshot as shown by `rffmpeg status`.
#[derive(Debug, Serialize)]
pub struct StatusReport<'a> {
    pub hosts: Vec<Candidate<'a>>,
    /// Processes running the tool locally.
    pub local: usize,
    /// Claims naming hosts that are not configured.
    pub unknown: Vec<(String, usize)>,
    pub records: usize,
    pub next: String,
}

impl<'a> StatusReport<'a> {
    pub fn build(catalog: &'a HostCatalog, view: &LoadView) -> Self {
        let unknown = view
            .hosts()
            .filter(|(name, load)| {
                *name != LOCAL_CLAIM && load.active > 0 && catalog.get(name).is_none()
            })
            .map(|(name, load)| (name.to_string(), load.active))
            .collect();
        let next = match select(catalog.hosts(), view) {
            SelectedTarget::Remote(host) => host.name,
            SelectedTarget::Local => LOCAL_CLAIM.to_string(),
        };

        Self {
            hosts: rank(catalog.hosts(), view),
            local: view.active(LOCAL_CLAIM),
            unknown,
            records: view.record_count(),
            next,
        }
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let name_width = self
            .hosts
            .iter()
            .map(|c| c.host.name.len())
            .chain(std::iter::once(4))
            .max()
            .unwrap_or(4);

        let _ = writeln!(
            out,
            "{:<name_width$}  {:<24}  {:>6}  {:>6}  {:>6}  STATE",
            "HOST", "ADDRESS", "WEIGHT", "ACTIVE", "LOAD"
        );
        for candidate in &self.hosts {
            let state = if candidate.bad { "bad" } else { "ok" };
            let _ = writeln!(
                out,
                "{:<name_width$}  {:<24}  {:>6}  {:>6}  {:>6}  {}",
                candidate.host.name,
                format!("{}:{}", candidate.host.address, candidate.host.port),
                candidate.host.weight,
                candidate.active,
                candidate.weighted_load,
                state
            );
        }
        if self.hosts.is_empty() {
            let _ = writeln!(out, "(no hosts configured)");
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Local processes: {}", self.local);
        for (name, active) in &self.unknown {
            let _ = writeln!(out, "Unconfigured host '{name}': {active} active");
        }
        let _ = writeln!(out, "State records: {}", self.records);
        let _ = writeln!(out, "Next target: {}", self.next);
        out
    }
}

/// Process records whose owner is gone. Our own record and the operator
/// record are never stale.
pub fn stale_records<T, F>(tracker: &T, alive: F, own_pid: u32) -> Vec<RecordId>
where
    T: LoadTracker + ?Sized,
    F: Fn(u32) -> bool,
{
    tracker
        .record_ids()
        .into_iter()
        .filter(|id| id.pid().is_some_and(|pid| pid != own_pid && !alive(pid)))
        .collect()
}

fn operator_lines<T: LoadTracker + ?Sized>(tracker: &T) -> Result<Vec<StateLine>> {
    let Some(contents) = tracker.read_record(RecordId::Operator)? else {
        return Ok(Vec::new());
    };
    let (lines, errors) = StateLine::parse_record(&contents);
    for e in errors {
        warn!("Dropping malformed line from operator record: {}", e);
    }
    Ok(lines)
}

/// Adds a bad mark for `host` to the operator record. Returns `false` if
/// the mark was already there.
pub fn mark_bad<T: LoadTracker + ?Sized>(tracker: &T, host: &str) -> Result<bool> {
    let marked = operator_lines(tracker)?
        .iter()
        .any(|line| matches!(line, StateLine::BadHost(h) if h == host));
    if marked {
        return Ok(false);
    }
    tracker.mark_bad(host, RecordId::Operator)?;
    info!(host, "Marked host bad");
    Ok(true)
}

/// Removes `host`'s bad mark from the operator record. Returns `false` if
/// there was none.
pub fn clear_bad<T: LoadTracker + ?Sized>(tracker: &T, host: &str) -> Result<bool> {
    let lines = operator_lines(tracker)?;
    let before = lines.len();
    let kept: Vec<StateLine> = lines
        .into_iter()
        .filter(|line| !matches!(line, StateLine::BadHost(h) if h == host))
        .collect();
    if kept.len() == before {
        return Ok(false);
    }
    tracker.write_record(RecordId::Operator, &kept)?;
    info!(host, "Cleared bad mark");
    Ok(true)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM means the process exists under another user
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
