//! CLI binary for edgequake-tab2rag.
//!
//! A thin shim over the library crate: reads a local file, maps CLI flags to
//! `PipelineConfig` and prints the result as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_tab2rag::{
    Pipeline, PipelineConfig, PipelineProgressCallback, PipelineStage, ProgressCallback,
    SchemaTag, SourceFile,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner while ingesting and routing, then a bar over rows.
struct CliProgressCallback {
    bar: ProgressBar,
    degraded: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading source…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            degraded: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} rows  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.reset_eta();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_rows: usize) {
        self.activate_bar(total_rows);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Standardizing {total_rows} rows…"))
        ));
    }

    fn on_stage(&self, stage: PipelineStage) {
        match stage {
            PipelineStage::Ingesting => self.bar.set_prefix("Ingesting"),
            PipelineStage::Routing => {
                self.bar.set_prefix("Routing");
                self.bar.set_message("Choosing schema…");
            }
            PipelineStage::Standardizing => self.bar.set_prefix("Standardizing"),
            PipelineStage::Validating => self.bar.set_prefix("Validating"),
            PipelineStage::Done | PipelineStage::Failed => self.bar.finish_and_clear(),
        }
    }

    fn on_row_start(&self, row: usize, _total_rows: usize) {
        self.bar.set_message(format!("row {}", row + 1));
    }

    fn on_row_complete(&self, row: usize, total_rows: usize, degraded: bool) {
        if degraded {
            self.degraded.fetch_add(1, Ordering::SeqCst);
            self.bar.println(format!(
                "  {} Row {:>4}/{:<4}  {}",
                cyan("⚠"),
                row + 1,
                total_rows,
                dim("degraded, see result.degradations"),
            ));
        }
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_rows: usize, clean_rows: usize) {
        let degraded = self.degraded.load(Ordering::SeqCst);
        let mark = if clean_rows == total_rows && degraded == 0 {
            green("✔")
        } else {
            cyan("⚠")
        };
        self.bar.println(format!(
            "{} {}/{} records pass validation  ({} degraded rows)",
            mark,
            bold(&clean_rows.to_string()),
            total_rows,
            degraded
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Standardize a CSV (JSON on stdout)
  tab2rag tickets.csv

  # Spreadsheet with embedded step images, written to a file
  tab2rag manual.xlsx -o manual.json

  # Force the target schema
  tab2rag --schema rag1 articles.csv

  # Preview routing only (one LLM call)
  tab2rag --analyze-only data.xlsx

  # No LLM at all: heuristic routing, direct mapping, no captions
  tab2rag --no-llm data.csv

OUTPUT SCHEMAS:
  rag1   structured documents: articulo_id, tipo, numero, titulo, texto,
         image_caption, keywords
  rag2   services and tickets: descripcion, tipo, servicio, categoria,
         subcategoria, fuente

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  AZURE_OPENAI_API_KEY    Azure OpenAI API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, azure, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Standardize CSV and XLSX files into RAG-ready records.
#[derive(Parser, Debug)]
#[command(
    name = "tab2rag",
    version,
    about = "Standardize CSV and XLSX files into RAG-ready records",
    long_about = "Standardize tabular files into one of two RAG schemas (rag1: structured \
documents, rag2: services and tickets). Images embedded in XLSX rows are described with a \
Vision Language Model and attached to their record as a caption.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local CSV, TSV or XLSX file.
    input: PathBuf,

    /// Write JSON to this file instead of stdout.
    #[arg(short, long, env = "TAB2RAG_OUTPUT")]
    output: Option<PathBuf>,

    /// Text model ID (e.g. gpt-4.1-nano, gpt-4.1-mini).
    #[arg(long, env = "TAB2RAG_MODEL")]
    model: Option<String>,

    /// Vision model ID. Defaults to --model.
    #[arg(long, env = "TAB2RAG_VISION_MODEL")]
    vision_model: Option<String>,

    /// LLM provider: openai, azure, anthropic, gemini, ollama.
    #[arg(long, env = "TAB2RAG_PROVIDER")]
    provider: Option<String>,

    /// Skip routing and use this schema.
    #[arg(long, env = "TAB2RAG_SCHEMA", value_enum)]
    schema: Option<SchemaArg>,

    /// Run without any LLM: heuristic routing, direct mapping, no captions.
    #[arg(long, env = "TAB2RAG_NO_LLM")]
    no_llm: bool,

    /// Do not describe embedded images (captions stay null).
    #[arg(long, env = "TAB2RAG_NO_VISION")]
    no_vision: bool,

    /// Do not translate record text.
    #[arg(long, env = "TAB2RAG_NO_TRANSLATE")]
    no_translate: bool,

    /// Print the routing analysis only.
    #[arg(long)]
    analyze_only: bool,

    /// Advisory validation threshold (0.0–1.0).
    #[arg(long, env = "TAB2RAG_THRESHOLD", default_value_t = 0.80)]
    threshold: f64,

    /// Max LLM output tokens per call.
    #[arg(long, env = "TAB2RAG_MAX_TOKENS", default_value_t = 2048)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "TAB2RAG_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per LLM call.
    #[arg(long, env = "TAB2RAG_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "TAB2RAG_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "TAB2RAG_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "TAB2RAG_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "TAB2RAG_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SchemaArg {
    Rag1,
    Rag2,
}

impl From<SchemaArg> for SchemaTag {
    fn from(v: SchemaArg) -> Self {
        match v {
            SchemaArg::Rag1 => SchemaTag::Rag1,
            SchemaArg::Rag2 => SchemaTag::Rag2,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is set.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.analyze_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Source ───────────────────────────────────────────────────────────
    let bytes = tokio::fs::read(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    let filename = cli
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.input.display().to_string());
    let source = SourceFile::new(bytes, filename).context("Unsupported input")?;

    // ── Pipeline ─────────────────────────────────────────────────────────
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress)?;
    let pipeline = if cli.no_llm {
        Pipeline::heuristic_only(config)
    } else {
        Pipeline::from_config(config).context("Failed to configure LLM provider")?
    };

    // ── Analyze-only mode ────────────────────────────────────────────────
    if cli.analyze_only {
        let report = pipeline
            .analyze(&source)
            .await
            .context("Analysis failed")?;
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        return write_output(&cli, &json).await;
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let result = match pipeline.run(&source).await {
        Ok(result) => result,
        Err(failure) => {
            if !cli.quiet {
                eprintln!("{} {}", red("✘"), failure);
            }
            std::process::exit(1);
        }
    };

    let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;
    write_output(&cli, &json).await?;

    if !cli.quiet {
        eprintln!(
            "{}  {} {} records  confidence {:.2}  quality {:.3}  {}ms",
            if result.validation.meets_threshold {
                green("✔")
            } else {
                cyan("⚠")
            },
            result.records.len(),
            result.schema,
            result.validation.confidence,
            result.validation.quality_score,
            result.metadata.total_duration_ms,
        );
        if result.is_degraded() {
            eprintln!(
                "   {}",
                dim(&format!("{} degradations recorded", result.degradations.len()))
            );
        }
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .confidence_threshold(cli.threshold)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .translate_records(!cli.no_translate && !cli.no_llm)
        .describe_images(!cli.no_vision && !cli.no_llm);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref model) = cli.vision_model {
        builder = builder.vision_model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(schema) = cli.schema {
        builder = builder.forced_schema(schema.into());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Write JSON to `--output` (atomically) or stdout.
async fn write_output(cli: &Cli, json: &str) -> Result<()> {
    match cli.output {
        Some(ref path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let tmp_path = path.with_extension("json.tmp");
            tokio::fs::write(&tmp_path, json)
                .await
                .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
            tokio::fs::rename(&tmp_path, path)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!("{} {}", green("→"), bold(&path.display().to_string()));
            }
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(json.as_bytes())
                .context("Failed to write to stdout")?;
            handle.write_all(b"\n").ok();
        }
    }
    Ok(())
}
