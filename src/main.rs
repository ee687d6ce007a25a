//! scrubwalk - depth-first integrity scrubbing for directory trees.
//!
//! Usage:
//!   scrubwalk manifest PATH [-o FILE]        Record the expected state of a tree
//!   scrubwalk scrub PATH --manifest FILE     Verify a tree against its manifest
//!   scrubwalk --help                         Show help

use std::path::{Path, PathBuf};
use std::sync::mpsc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use scrubwalk_core::{ScrubConfig, ScrubOutcome};
use scrubwalk_fs::{FsBackend, FsBackendConfig, Manifest};
use scrubwalk_stack::{ScrubProgress, ScrubStack};

#[derive(Parser)]
#[command(
    name = "scrubwalk",
    version,
    about = "Depth-first integrity scrubbing for directory trees",
    long_about = "scrubwalk records the expected state of a directory tree in a manifest \
                  and later walks the tree depth-first, verifying every file and directory \
                  against it."
)]
struct Cli {
    /// Log scheduler activity at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a manifest for a directory tree
    Manifest {
        /// Root of the tree
        path: PathBuf,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Scrub a directory tree against its manifest
    Scrub {
        /// Root of the tree
        path: PathBuf,

        /// Manifest built by `scrubwalk manifest`
        #[arg(short, long)]
        manifest: PathBuf,

        /// Tag stamped on every verified object
        #[arg(short, long, default_value = "")]
        tag: String,

        /// Only scrub this manifest path (relative to the root)
        #[arg(long)]
        subtree: Option<String>,

        /// Do not descend below the starting directory
        #[arg(long)]
        no_recursive: bool,

        /// With --no-recursive, still verify the starting directory's children
        #[arg(long)]
        children: bool,

        /// Maximum async verifies outstanding at once
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Hash files of at least this size off-thread (e.g. "1MB")
        #[arg(long)]
        async_threshold: Option<String>,

        /// TOML file with [scrub] and [backend] tables
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Contents of a `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    scrub: ScrubConfig,
    backend: FsBackendConfig,
}

/// Machine-readable scrub result.
#[derive(Serialize)]
struct ScrubReport<'a> {
    path: String,
    tag: &'a str,
    passed: bool,
    elapsed_secs: f64,
    outcome: &'a ScrubOutcome,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Manifest { path, output } => {
            run_manifest(&path, output)?;
        }
        Command::Scrub {
            path,
            manifest,
            tag,
            subtree,
            no_recursive,
            children,
            max_in_flight,
            async_threshold,
            config,
            format,
        } => {
            let mut file_config = load_config(config.as_deref())?;
            if let Some(max) = max_in_flight {
                file_config.scrub.max_in_flight = Some(max);
            }
            if let Some(threshold) = async_threshold {
                file_config.backend.async_hash_threshold = parse_size(&threshold)?;
            }

            let passed = run_scrub(ScrubArgs {
                path,
                manifest,
                tag,
                subtree,
                recursive: !no_recursive,
                include_children: !no_recursive || children,
                config: file_config,
                format,
            })?;
            if !passed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config {}", path.display()))?;
    let config: FileConfig = toml::from_str(&text)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Build a manifest and write it out.
fn run_manifest(path: &Path, output: Option<PathBuf>) -> Result<()> {
    eprintln!("Recording {}...", path.display());
    let manifest = Manifest::build(path).context("Manifest build failed")?;

    match output {
        Some(output) => {
            manifest
                .save(&output)
                .with_context(|| format!("Cannot write {}", output.display()))?;
            eprintln!("Manifest written to {}", output.display());
        }
        None => {
            let stdout = std::io::stdout();
            serde_json::to_writer_pretty(stdout.lock(), &manifest)?;
            println!();
        }
    }

    eprintln!(
        "{} files, {} directories, {}",
        manifest.file_count(),
        manifest.dir_count(),
        format_size(manifest.total_bytes())
    );
    Ok(())
}

struct ScrubArgs {
    path: PathBuf,
    manifest: PathBuf,
    tag: String,
    subtree: Option<String>,
    recursive: bool,
    include_children: bool,
    config: FileConfig,
    format: OutputFormat,
}

/// Run one scrub job to completion. Returns whether it passed.
fn run_scrub(args: ScrubArgs) -> Result<bool> {
    args.config
        .scrub
        .validate()
        .map_err(|e| eyre!("Invalid [scrub] config: {e}"))?;

    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("Cannot load manifest {}", args.manifest.display()))?;
    let backend = FsBackend::open(&args.path, manifest, args.config.backend)
        .with_context(|| format!("Cannot open {}", args.path.display()))?;

    let entry = match &args.subtree {
        Some(key) => backend
            .entry(key.trim_matches('/'))
            .ok_or_else(|| eyre!("{key} is not in the manifest"))?,
        None => backend.root_entry(),
    };
    let start_path = entry.name.to_string();

    let runtime = tokio::runtime::Runtime::new().context("Cannot start runtime")?;
    let (tx, rx) = mpsc::channel();
    let mut stack = ScrubStack::with_config(backend, args.config.scrub);
    stack.enqueue_top(
        entry,
        args.recursive,
        args.include_children,
        &args.tag,
        move |_, outcome| {
            // The receiver outlives the stack.
            let _ = tx.send(outcome);
        },
    );
    runtime.block_on(stack.run_until_idle());

    let outcome = rx
        .try_recv()
        .map_err(|_| eyre!("Scrub finished without an outcome"))?;
    let progress = stack.progress();
    let stamped = stack.backend().stamps().len();
    info!(
        path = %start_path,
        offloaded = stack.backend().hashes_offloaded(),
        stamped,
        "Scrub complete"
    );

    match args.format {
        OutputFormat::Text => print_text(&start_path, &args.tag, &outcome, &progress, stamped),
        OutputFormat::Json => {
            let report = ScrubReport {
                path: start_path,
                tag: &args.tag,
                passed: outcome.passed(),
                elapsed_secs: progress.elapsed.as_secs_f64(),
                outcome: &outcome,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(outcome.passed())
}

fn print_text(
    path: &str,
    tag: &str,
    outcome: &ScrubOutcome,
    progress: &ScrubProgress,
    stamped: usize,
) {
    println!();
    println!("{}", "─".repeat(60));
    if tag.is_empty() {
        println!(" Scrub of {path}");
    } else {
        println!(" Scrub of {path} (tag \"{tag}\", {stamped} stamped)");
    }
    println!(
        " {} objects verified in {:.2}s ({:.0}/s)",
        outcome.objects_verified,
        progress.elapsed.as_secs_f64(),
        progress.objects_per_second()
    );
    println!(
        " {} mismatches, {} errors",
        outcome.mismatches, outcome.errors
    );
    println!("{}", "─".repeat(60));

    if !outcome.damage.is_empty() {
        println!();
        for record in &outcome.damage {
            println!(
                "  {:<12} {}  {}",
                record.kind.to_string(),
                truncate(&record.path, 60),
                record.detail
            );
        }
        if outcome.damage_dropped > 0 {
            println!("  ... and {} more not recorded", outcome.damage_dropped);
        }
    }

    println!();
    println!(" {}", if outcome.passed() { "PASSED" } else { "FAILED" });
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to max length, keeping the end.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        s.to_string()
    } else if max_len == 0 {
        String::new()
    } else {
        let tail: String = s.chars().skip(count - (max_len - 1)).collect();
        format!("…{tail}")
    }
}

/// Parse a size string (e.g., "1KB", "10MB", "1GB").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');

    let multiplier: u64 = if s.ends_with("GB") || s.ends_with('G') {
        1024 * 1024 * 1024
    } else if s.ends_with("MB") || s.ends_with('M') {
        1024 * 1024
    } else if s.ends_with("KB") || s.ends_with('K') {
        1024
    } else {
        1
    };
    let num: f64 = digits
        .parse()
        .with_context(|| format!("Invalid size: {s}"))?;

    Ok((num * multiplier as f64) as u64)
}
