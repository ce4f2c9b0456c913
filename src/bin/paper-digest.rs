//! CLI binary for paper-digest.
//!
//! A thin shim over the library crate that maps CLI flags onto
//! `DigestConfig`, runs one date or a date range, and prints the summary.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use paper_digest::{
    parse_date, DigestConfig, HfDailySource, Pipeline, PipelineProgressCallback, ProcessingState,
    ProgressCallback, RunOutput, RunPhase, RunStats, Stage,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar per run: length is the number of papers, advanced whenever a
/// paper reaches a terminal state. Papers finish out of order, so every
/// event is printed above the bar as it arrives.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER);
        bar.set_style(spinner_style);
        bar.set_prefix("Scraping");
        bar.set_message("Fetching daily listing…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }

    fn truncate(msg: &str) -> String {
        if msg.chars().count() > 80 {
            let head: String = msg.chars().take(79).collect();
            format!("{head}\u{2026}")
        } else {
            msg.to_string()
        }
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_papers: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} papers  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.reset();
        self.bar.set_length(total_papers as u64);
        self.bar.set_style(style);
        self.failed.store(0, Ordering::SeqCst);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_papers} papers…"))
        ));
    }

    fn on_phase(&self, phase: RunPhase) {
        let label = match phase {
            RunPhase::Scraping => "Scraping",
            RunPhase::Filtering => "Filtering",
            RunPhase::Downloading => "Downloading",
            RunPhase::Recognizing => "Recognizing",
            RunPhase::Analyzing => "Analyzing",
            RunPhase::Summarizing => "Summarizing",
            RunPhase::Publishing => "Publishing",
            RunPhase::Done => "Done",
        };
        self.bar.set_prefix(label);
    }

    fn on_paper_stage(&self, id: &str, stage: Stage) {
        self.bar.set_message(format!("{stage} {id}"));
    }

    fn on_paper_failed(&self, id: &str, stage: Stage, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:<12} {:<9} {}",
            red("✗"),
            id,
            dim(&stage.to_string()),
            red(&Self::truncate(error)),
        ));
        self.bar.inc(1);
    }

    fn on_paper_done(&self, id: &str, state: ProcessingState) {
        let mark = if state == ProcessingState::Published {
            green("✓")
        } else {
            dim("·")
        };
        self.bar.println(format!("  {} {:<12} {}", mark, id, dim(&state.to_string())));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, stats: &RunStats) {
        self.bar.finish_and_clear();
        let failed = self.failed.load(Ordering::SeqCst);
        eprintln!(
            "{} {} published  {} rejected  {} failed  {}",
            if failed == 0 { green("✔") } else { cyan("⚠") },
            bold(&stats.published.to_string()),
            stats.rejected,
            if failed == 0 {
                failed.to_string()
            } else {
                red(&failed.to_string())
            },
            dim(&format!("{:.1}s", stats.duration_ms as f64 / 1000.0)),
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Today's listing
  paper-digest

  # A specific day, with a config file
  paper-digest --date 2025-03-07 --config digest.yaml

  # Backfill a week, classification only (no OCR or deep analysis)
  paper-digest --start-date 2025-03-01 --end-date 2025-03-07 --skip-deep-analysis

  # Machine-readable run summary
  paper-digest --date 2025-03-07 --json > run.json

OUTPUT:
  papers/<date>/00_Daily_Report.md
  papers/<date>/<Category>/<Author_Title>/{paper.pdf, note.md, analysis.json, figures/, ocr/}

ENVIRONMENT VARIABLES:
  DIGEST_LLM_API_KEY   API key for the classification / analysis model
  DIGEST_OCR_API_KEY   API key for the OCR vision model
  ZOTERO_API_KEY       Zotero Web API key (library publishing)
  OPENAI_API_KEY       Used by provider auto-detection when no base_url is set
  PDFIUM_LIB_PATH      Directory or file of the pdfium shared library
  RUST_LOG             Override the log filter (e.g. paper_digest=debug)
"#;

/// Build a daily research-paper digest.
#[derive(Parser, Debug)]
#[command(
    name = "paper-digest",
    version,
    about = "Filter, analyze and publish the day's research papers",
    long_about = "Scrape the daily paper listing, classify each paper against your interests, \
OCR and analyze the accepted ones with vision and language models, and publish notes plus a \
daily report to a local tree and an optional Zotero library.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Listing date (YYYY-MM-DD). Default: today.
    #[arg(long, env = "DIGEST_DATE", conflicts_with_all = ["start_date", "end_date"])]
    date: Option<String>,

    /// First date of a range (YYYY-MM-DD).
    #[arg(long, requires = "end_date")]
    start_date: Option<String>,

    /// Last date of a range, inclusive (YYYY-MM-DD).
    #[arg(long, requires = "start_date")]
    end_date: Option<String>,

    /// Classification only: publish accepted papers without OCR or analysis.
    #[arg(long, env = "DIGEST_SKIP_DEEP_ANALYSIS")]
    skip_deep_analysis: bool,

    /// YAML configuration file.
    #[arg(short, long, env = "DIGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Override storage.base_dir.
    #[arg(long, env = "DIGEST_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Override concurrency.paper_workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Timeout for the listing and metadata requests, in seconds.
    #[arg(long, default_value_t = 30)]
    listing_timeout: u64,

    /// Print the run output as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DIGEST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DIGEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DIGEST_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the feedback; library INFO logs would tear it.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let config = build_config(&cli)?;

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };

    let mut builder = Pipeline::builder(config);
    if let Some(cb) = progress {
        builder = builder.progress(cb);
    }
    let pipeline = builder.build().context("Invalid configuration")?;
    let source =
        HfDailySource::new(Duration::from_secs(cli.listing_timeout)).context("Failed to set up listing client")?;

    // ── Run ──────────────────────────────────────────────────────────────
    let outputs = match (&cli.start_date, &cli.end_date) {
        (Some(start), Some(end)) => {
            let start = parse_date(start).context("Invalid --start-date")?;
            let end = parse_date(end).context("Invalid --end-date")?;
            pipeline
                .run_range(&source, start, end)
                .await
                .context("Digest run failed")?
        }
        _ => {
            let date = match &cli.date {
                Some(d) => parse_date(d).context("Invalid --date")?,
                None => chrono::Local::now().date_naive(),
            };
            vec![pipeline
                .run_for_date(&source, date)
                .await
                .with_context(|| format!("Digest run for {date} failed"))?]
        }
    };

    if cli.json {
        let json = if outputs.len() == 1 {
            serde_json::to_string_pretty(&outputs[0])
        } else {
            serde_json::to_string_pretty(&outputs)
        }
        .context("Failed to serialise output")?;
        println!("{json}");
    } else if !cli.quiet {
        for output in &outputs {
            print_summary(output, show_progress);
        }
    }

    Ok(())
}

/// Map the config file and CLI overrides to `DigestConfig`.
fn build_config(cli: &Cli) -> Result<DigestConfig> {
    let mut config = match &cli.config {
        Some(path) => DigestConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DigestConfig::default(),
    };
    config.apply_env();

    if cli.skip_deep_analysis {
        config.skip_deep_analysis = true;
    }
    if let Some(dir) = &cli.base_dir {
        config.storage.base_dir = dir.clone();
    }
    if let Some(n) = cli.workers {
        config.concurrency.paper_workers = n.max(1);
    }
    Ok(config)
}

fn print_summary(output: &RunOutput, show_progress: bool) {
    let stats = &output.stats;
    // With the bar active, on_run_complete already printed the counts.
    if !show_progress {
        eprintln!(
            "{}: {}/{} published, {} rejected, {} failed in {}ms",
            output.date, stats.published, stats.total, stats.rejected, stats.failed, stats.duration_ms
        );
    }
    for failed in &output.failed {
        eprintln!(
            "  {} {} [{}] {}",
            red("✗"),
            failed.id,
            failed.stage,
            dim(&failed.reason)
        );
    }
    match &output.report_error {
        None => eprintln!("   report  →  {}", bold(&output.report_path.display().to_string())),
        Some(e) => eprintln!("   {} report: {}", cyan("⚠"), red(e)),
    }
}
