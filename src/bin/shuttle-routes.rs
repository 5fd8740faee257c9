//! CLI binary for shuttle-routes.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` / `RunConfig`, runs the pipeline and prints the run
//! report.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use shuttle_routes::pipeline::landmarks::LandmarkGeocoder;
use shuttle_routes::{
    run, PipelineConfig, PipelineProgressCallback, ProgressCallback, PublishOutcome, RunConfig,
    RunMode, RunOutcome, RunReport, SourceCatalog, Stage, StageReport, StageSet, StageState,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One progress bar per stage, replaced when the next stage starts. Items
/// finish out of order, so only counts are shown.
struct CliProgressCallback {
    bar: Mutex<Option<ProgressBar>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: Mutex::new(None),
            errors: AtomicUsize::new(0),
        })
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, stages: &[Stage]) {
        let names: Vec<&str> = stages.iter().map(|s| s.as_str()).collect();
        eprintln!("{} {}", cyan("◆"), bold(&format!("Running {}", names.join(" → "))));
    }

    fn on_stage_start(&self, stage: Stage, total_items: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold:>10}  [{bar:42.green/238}] {pos:>4}/{len:<4} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let bar = ProgressBar::new(total_items as u64);
        bar.set_style(style);
        bar.set_prefix(stage.as_str().to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.replace(bar) {
                old.finish_and_clear();
            }
        }
    }

    fn on_item_complete(&self, _stage: Stage, item: &str, cached: bool) {
        self.with_bar(|bar| {
            if !cached {
                bar.set_message(truncate(item, 60));
            }
            bar.inc(1);
        });
    }

    fn on_item_error(&self, _stage: Stage, item: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.with_bar(|bar| {
            bar.println(format!("  {} {}  {}", red("✗"), truncate(item, 60), red(&truncate(error, 80))));
            bar.inc(1);
        });
    }

    fn on_stage_complete(&self, report: &StageReport) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(bar) = guard.take() {
                bar.finish_and_clear();
            }
        }
        let mark = match report.state {
            StageState::Skipped => dim("↺"),
            _ if report.failed > 0 => cyan("⚠"),
            _ => green("✓"),
        };
        eprintln!(
            "  {} {:<10} {} ok  {} failed  {} cached  {} excluded  {}",
            mark,
            report.stage.as_str(),
            report.succeeded,
            report.failed,
            report.cached,
            report.excluded,
            dim(&format!("{:.1}s", report.duration_ms as f64 / 1000.0)),
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full run over the catalog
  shuttle-routes --catalog catalog.toml

  # HTML sources only, no OCR
  shuttle-routes --mode quick

  # Re-run geocoding and everything after it
  shuttle-routes --stages resolve,validate,publish

  # Offline: landmark table only, withhold flagged routes
  shuttle-routes --offline-geocoder --publish-flagged false

  # Machine-readable run report
  shuttle-routes --json > report.json

ENVIRONMENT VARIABLES:
  KAKAO_API_KEY           Kakao Local REST key for geocoding
  OPENAI_API_KEY          OpenAI API key (OCR)
  ANTHROPIC_API_KEY       Anthropic API key (OCR)
  GEMINI_API_KEY          Google Gemini API key (OCR)
  PDFIUM_LIB_PATH         Path to libpdfium for PDF rasterisation
  RUST_LOG                Log filter override

OUTPUT:
  {data-dir}/published/routes.json   Published dataset
  {data-dir}/reports/runs.jsonl      One report per run
"#;

/// Extract, geocode and publish Seoul free-shuttle routes.
#[derive(Parser, Debug)]
#[command(
    name = "shuttle-routes",
    version,
    about = "Extract, geocode and publish Seoul free-shuttle routes",
    long_about = "Fetch municipal shuttle announcements listed in a source catalog, read them \
(OCR for PDFs and images), recognise stop sequences, geocode each stop within its district, \
validate the routes and publish a JSON dataset when it changed.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Source catalog (TOML).
    #[arg(long, env = "SHUTTLE_CATALOG", default_value = "catalog.toml")]
    catalog: PathBuf,

    /// Artifact store root.
    #[arg(long, env = "SHUTTLE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// full: every stage with OCR; quick: HTML sources only.
    #[arg(long, env = "SHUTTLE_MODE", value_enum, default_value = "full")]
    mode: ModeArg,

    /// Comma-separated stages to run (default: all).
    #[arg(long, env = "SHUTTLE_STAGES")]
    stages: Option<String>,

    /// Publish flagged routes along with accepted ones (true/false).
    #[arg(long, env = "SHUTTLE_PUBLISH_FLAGGED", default_value_t = true, action = clap::ArgAction::Set)]
    publish_flagged: bool,

    /// Abort before publishing when more than this share of fetches or
    /// extractions fail (0.0–1.0).
    #[arg(long, env = "SHUTTLE_ABORT_THRESHOLD", default_value_t = 0.5)]
    abort_threshold: f64,

    /// Concurrent fetches.
    #[arg(long, env = "SHUTTLE_FETCH_CONCURRENCY", default_value_t = 4)]
    fetch_concurrency: usize,

    /// Concurrent OCR calls.
    #[arg(long, env = "SHUTTLE_OCR_CONCURRENCY", default_value_t = 2)]
    ocr_concurrency: usize,

    /// Concurrent geocoding lookups.
    #[arg(long, env = "SHUTTLE_GEOCODE_CONCURRENCY", default_value_t = 4)]
    geocode_concurrency: usize,

    /// Minimum milliseconds between geocoding calls.
    #[arg(long, env = "SHUTTLE_GEOCODE_INTERVAL_MS", default_value_t = 100)]
    geocode_interval_ms: u64,

    /// Retries on transient network failures.
    #[arg(long, env = "SHUTTLE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, env = "SHUTTLE_FETCH_TIMEOUT", default_value_t = 15)]
    fetch_timeout: u64,

    /// Wall-clock budget for the whole run in seconds.
    #[arg(long, env = "SHUTTLE_RUN_TIMEOUT")]
    run_timeout: Option<u64>,

    /// Same-name stops closer than this many metres are duplicates.
    #[arg(long, env = "SHUTTLE_DUPLICATE_DISTANCE", default_value_t = 5.0)]
    duplicate_distance: f64,

    /// OCR provider: openai, anthropic, gemini, ollama.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// OCR model ID (e.g. gpt-4.1-nano).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Geocode with the built-in landmark table only.
    #[arg(long, env = "SHUTTLE_OFFLINE_GEOCODER")]
    offline_geocoder: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long, env = "SHUTTLE_JSON")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, env = "SHUTTLE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SHUTTLE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SHUTTLE_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Full,
    Quick,
}

impl From<ModeArg> for RunMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Full => RunMode::Full,
            ModeArg::Quick => RunMode::Quick,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bars replace INFO logs unless --verbose is given.
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

    let catalog = SourceCatalog::load(&cli.catalog)
        .await
        .with_context(|| format!("Failed to load source catalog {}", cli.catalog.display()))?;

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress)?;
    let run_config = build_run_config(&cli)?;

    let report = run(&catalog, &config, &run_config)
        .await
        .context("Pipeline run failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise run report")?
        );
    } else if !cli.quiet {
        print_summary(&report);
    }

    if !report.is_success() {
        std::process::exit(2);
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .data_dir(&cli.data_dir)
        .fetch_concurrency(cli.fetch_concurrency)
        .ocr_concurrency(cli.ocr_concurrency)
        .geocode_concurrency(cli.geocode_concurrency)
        .geocode_min_interval_ms(cli.geocode_interval_ms)
        .max_retries(cli.max_retries)
        .fetch_timeout_secs(cli.fetch_timeout)
        .duplicate_distance_m(cli.duplicate_distance);

    if let Some(secs) = cli.run_timeout {
        builder = builder.run_timeout_secs(secs);
    }
    if cli.offline_geocoder {
        builder = builder.geocoder(Arc::new(LandmarkGeocoder::new()));
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder = with_ocr_engine(builder, cli)?;

    builder.build().context("Invalid configuration")
}

/// An explicit `--provider`/`--model` builds the engine up front, so a bad
/// provider fails here rather than on the first scanned document.
#[cfg(feature = "vlm-ocr")]
fn with_ocr_engine(
    builder: shuttle_routes::PipelineConfigBuilder,
    cli: &Cli,
) -> Result<shuttle_routes::PipelineConfigBuilder> {
    use shuttle_routes::pipeline::vision::VisionOcrEngine;
    if cli.provider.is_none() && cli.model.is_none() {
        return Ok(builder);
    }
    let backoff_ms = PipelineConfig::default().retry_backoff_ms;
    let engine = VisionOcrEngine::from_env(cli.provider.as_deref(), cli.model.as_deref(), cli.max_retries, backoff_ms)
        .context("Failed to initialise the OCR provider")?;
    Ok(builder.ocr_engine(Arc::new(engine)))
}

#[cfg(not(feature = "vlm-ocr"))]
fn with_ocr_engine(
    builder: shuttle_routes::PipelineConfigBuilder,
    cli: &Cli,
) -> Result<shuttle_routes::PipelineConfigBuilder> {
    if cli.provider.is_some() || cli.model.is_some() {
        anyhow::bail!("--provider/--model need the `vlm-ocr` feature");
    }
    Ok(builder)
}

fn build_run_config(cli: &Cli) -> Result<RunConfig> {
    let mut run_config = RunConfig::for_mode(cli.mode.into())
        .with_publish_flagged(cli.publish_flagged)
        .with_abort_threshold(cli.abort_threshold);
    if let Some(ref list) = cli.stages {
        run_config = run_config.with_stages(StageSet::parse_list(list).context("Invalid --stages")?);
    }
    run_config.validate().context("Invalid run configuration")?;
    Ok(run_config)
}

fn print_summary(report: &RunReport) {
    let v = &report.validation;
    let r = &report.resolve_stats;
    if r.stops > 0 {
        eprintln!(
            "   {} stops: {} resolved ({} manual), {} unresolved  {}",
            r.stops,
            r.resolved,
            r.manual,
            r.unresolved,
            dim(&format!("{} cache hits, {} lookups", r.cache_hits, r.provider_calls)),
        );
    }
    if v.routes > 0 {
        eprintln!(
            "   {} routes: {} accepted, {} flagged, {} rejected",
            v.routes, v.accepted, v.flagged, v.rejected
        );
    }
    if let Some(q) = &report.quality {
        eprintln!(
            "   quality {}: {}/25 districts ({}%), {}% info complete, {} stops per route",
            bold(&format!("{:.1}", q.overall_score)),
            q.districts,
            q.district_coverage,
            q.info_completeness,
            q.avg_stops_per_route
        );
    }
    if !report.discards.is_empty() {
        eprintln!("   {} items discarded (see reports/runs.jsonl)", report.discards.len());
    }

    match (&report.outcome, &report.publish) {
        (RunOutcome::Succeeded, PublishOutcome::Published { hash, routes }) => eprintln!(
            "{} Published {} routes  {}  {}ms",
            green("✔"),
            bold(&routes.to_string()),
            dim(&hash[..12.min(hash.len())]),
            report.duration_ms
        ),
        (RunOutcome::Succeeded, PublishOutcome::Unchanged { routes, .. }) => eprintln!(
            "{} Dataset unchanged ({} routes)  {}ms",
            green("✔"),
            routes,
            report.duration_ms
        ),
        (RunOutcome::Succeeded, _) => eprintln!("{} Done in {}ms", green("✔"), report.duration_ms),
        (RunOutcome::Aborted { reason }, _) => {
            eprintln!("{} Run aborted: {}", red("✘"), reason)
        }
        (RunOutcome::MissingDependency { stage, requires }, _) => eprintln!(
            "{} Cannot run {}: no recorded {} output. Run that stage first.",
            red("✘"),
            stage,
            requires
        ),
    }
}
