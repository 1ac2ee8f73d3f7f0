//! Pipeline orchestration: sequence the stages and own the run's state.
//!
//! A run moves strictly forward through
//! `Ingesting → Routing → Standardizing → Validating → Done`. The only way
//! into `Failed` is an ingestion error or an internal fault, and a panic in
//! any stage counts as an internal fault. Every capability
//! failure has already been absorbed as a [`Degradation`] by the stage that
//! made the call.

use crate::capability::llm::{resolve_provider, CallSettings, LlmTextClient, LlmVisionClient};
use crate::capability::{DisabledCapabilities, TextCapability, VisionCapability};
use crate::config::PipelineConfig;
use crate::error::{Degradation, StandardizeError};
use crate::output::{AnalysisReport, FileInfo, PipelineResult, ProcessingMetadata, StageTiming};
use crate::pipeline::ingest::{ingest, IngestedTable, SourceFile};
use crate::pipeline::route::{route, RouterSettings, RoutingOutcome};
use crate::pipeline::standardize::{standardize, Capabilities, StandardizerSettings};
use crate::pipeline::validate::validate;
use crate::pipeline::PipelineStage;
use crate::progress::{NoopProgressCallback, PipelineProgressCallback};
use crate::prompts::schema_summary;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Rows included in an [`AnalysisReport`] sample.
const ANALYSIS_SAMPLE_ROWS: usize = 3;

// ── Failure ──────────────────────────────────────────────────────────────

/// The single run-level failure: the run ended in `Failed`.
#[derive(Debug)]
pub struct PipelineFailure {
    /// Stage that was active when the run failed.
    pub failed_in: PipelineStage,
    pub error: StandardizeError,
    /// Timings of the stages entered before the failure, including the
    /// failing one.
    pub stages: Vec<StageTiming>,
}

impl PipelineFailure {
    pub fn is_ingestion_failure(&self) -> bool {
        self.error.is_ingestion_failure()
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline failed during {}: {}", self.failed_in, self.error)
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

// ── Stage clock ──────────────────────────────────────────────────────────

/// Tracks the current state, its timings and the matching progress events.
struct StageClock<'a> {
    progress: &'a dyn PipelineProgressCallback,
    current: PipelineStage,
    entered: Instant,
    stages: Vec<StageTiming>,
}

impl<'a> StageClock<'a> {
    fn start(progress: &'a dyn PipelineProgressCallback) -> Self {
        progress.on_stage(PipelineStage::Ingesting);
        Self {
            progress,
            current: PipelineStage::Ingesting,
            entered: Instant::now(),
            stages: Vec::new(),
        }
    }

    fn close_current(&mut self) {
        self.stages.push(StageTiming {
            stage: self.current,
            duration_ms: self.entered.elapsed().as_millis() as u64,
        });
    }

    /// Move to the next state on the happy path.
    fn advance(&mut self) {
        let Some(next) = self.current.next() else {
            return;
        };
        self.close_current();
        debug!("Stage {} → {}", self.current, next);
        self.current = next;
        self.entered = Instant::now();
        self.progress.on_stage(next);
    }

    /// End a preview after routing.
    fn stop(mut self) -> Vec<StageTiming> {
        self.close_current();
        self.progress.on_stage(PipelineStage::Done);
        self.stages
    }

    fn fail(mut self, error: StandardizeError) -> PipelineFailure {
        self.close_current();
        error!("Run failed during {}: {}", self.current, error);
        self.progress.on_stage(PipelineStage::Failed);
        PipelineFailure {
            failed_in: self.current,
            error,
            stages: self.stages,
        }
    }
}

/// Drive one stage to completion. A panic inside it becomes `Internal`.
async fn guarded<T>(stage: impl Future<Output = T>) -> Result<T, StandardizeError> {
    AssertUnwindSafe(stage)
        .catch_unwind()
        .await
        .map_err(|payload| {
            StandardizeError::Internal(format!("stage panicked: {}", panic_message(&*payload)))
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// A configured pipeline. One value can serve any number of runs; runs
/// share no mutable state.
///
/// # Example
/// ```rust,no_run
/// use edgequake_tab2rag::{Pipeline, PipelineConfig, SourceFile};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = Pipeline::from_config(PipelineConfig::default())?;
/// let source = SourceFile::new(std::fs::read("manual.xlsx")?, "manual.xlsx")?;
/// let result = pipeline.run(&source).await?;
/// println!("{} records as {}", result.records.len(), result.schema);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    text: Arc<dyn TextCapability>,
    vision: Arc<dyn VisionCapability>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build a pipeline over explicit capability clients.
    pub fn new(
        config: PipelineConfig,
        text: Arc<dyn TextCapability>,
        vision: Arc<dyn VisionCapability>,
    ) -> Self {
        Self {
            config,
            text,
            vision,
        }
    }

    /// A pipeline with no capability backends: heuristic routing, direct
    /// mapping, no translation and null captions.
    pub fn heuristic_only(config: PipelineConfig) -> Self {
        let disabled = Arc::new(DisabledCapabilities::new("heuristic-only run"));
        Self::new(config, disabled.clone(), disabled)
    }

    /// Build LLM-backed capability clients from the configuration.
    ///
    /// # Errors
    /// [`StandardizeError::ProviderNotConfigured`] when no text provider can
    /// be resolved. A missing vision provider only disables captions.
    pub fn from_config(config: PipelineConfig) -> Result<Self, StandardizeError> {
        let settings = CallSettings::from(&config);
        let text_provider = resolve_provider(&config, None)?;
        info!(
            "Text capability ready (model: {})",
            config.model.as_deref().unwrap_or("provider default")
        );
        let text: Arc<dyn TextCapability> =
            Arc::new(LlmTextClient::new(text_provider, settings.clone()));

        let vision: Arc<dyn VisionCapability> = if !config.describe_images {
            Arc::new(DisabledCapabilities::new("image description disabled"))
        } else {
            match resolve_provider(&config, config.effective_vision_model()) {
                Ok(provider) => {
                    info!(
                        "Vision capability ready (model: {})",
                        config.effective_vision_model().unwrap_or("provider default")
                    );
                    Arc::new(LlmVisionClient::new(provider, settings))
                }
                Err(e) => {
                    warn!("No vision provider, captions will be null: {}", e);
                    Arc::new(DisabledCapabilities::new(format!("no vision provider: {e}")))
                }
            }
        };

        Ok(Self::new(config, text, vision))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            sample_rows: self.config.routing_sample_rows,
            forced_schema: self.config.forced_schema,
        }
    }

    async fn ingest_stage(&self, source: &SourceFile) -> Result<IngestedTable, StandardizeError> {
        ingest(
            source,
            self.config.max_file_bytes,
            self.config.max_image_dimension,
        )
        .await
    }

    async fn route_stage(&self, source: &SourceFile, ingested: &IngestedTable) -> RoutingOutcome {
        let outcome = route(
            &ingested.table,
            source.kind,
            ingested.images.image_count(),
            self.text.as_ref(),
            self.router_settings(),
        )
        .await;
        info!(
            "Routed to {} ({}), confidence {:.2}",
            outcome.decision.schema,
            schema_summary(outcome.decision.schema),
            outcome.decision.confidence
        );
        outcome
    }

    /// Run the whole pipeline over one source.
    ///
    /// # Errors
    /// [`PipelineFailure`] when the source cannot be ingested or an internal
    /// fault occurs. Capability failures never fail a run.
    pub async fn run(&self, source: &SourceFile) -> Result<PipelineResult, PipelineFailure> {
        let total_start = Instant::now();
        let noop = NoopProgressCallback;
        let progress: &dyn PipelineProgressCallback =
            self.config.progress_callback.as_deref().unwrap_or(&noop);
        info!("Starting run: {}", source.filename);

        // ── Ingesting ────────────────────────────────────────────────────
        let mut clock = StageClock::start(progress);
        let ingested = match guarded(self.ingest_stage(source)).await.and_then(|r| r) {
            Ok(ingested) => ingested,
            Err(e) => return Err(clock.fail(e)),
        };
        let row_count = ingested.table.len();
        let image_count = ingested.images.image_count();
        progress.on_run_start(row_count);
        let mut degradations: Vec<Degradation> = ingested.warnings.clone();

        // ── Routing ──────────────────────────────────────────────────────
        clock.advance();
        let routing = match guarded(self.route_stage(source, &ingested)).await {
            Ok(routing) => routing,
            Err(e) => return Err(clock.fail(e)),
        };
        degradations.extend(routing.degradations);
        let decision = routing.decision;

        // ── Standardizing ────────────────────────────────────────────────
        clock.advance();
        let standardized = guarded(standardize(
            &ingested.table,
            &ingested.images,
            source.kind,
            &decision,
            Capabilities {
                text: self.text.as_ref(),
                vision: self.vision.as_ref(),
            },
            StandardizerSettings {
                conceptualization_sample_rows: self.config.conceptualization_sample_rows,
                translate: self.config.translate_records,
                describe_images: self.config.describe_images,
            },
            progress,
        ))
        .await;
        let standardized = match standardized {
            Ok(standardized) => standardized,
            Err(e) => return Err(clock.fail(e)),
        };
        degradations.extend(standardized.degradations);

        if standardized.records.len() != row_count {
            return Err(clock.fail(StandardizeError::Internal(format!(
                "{} records for {} rows",
                standardized.records.len(),
                row_count
            ))));
        }

        // ── Validating ───────────────────────────────────────────────────
        clock.advance();
        let validated = guarded(async {
            validate(
                &standardized.records,
                decision.schema,
                self.config.confidence_threshold,
            )
        })
        .await;
        let validation = match validated {
            Ok(validation) => validation,
            Err(e) => return Err(clock.fail(e)),
        };
        if !validation.meets_threshold {
            warn!(
                "Confidence {:.3} is below the {:.2} threshold",
                validation.confidence, validation.threshold
            );
        }
        progress.on_run_complete(row_count, validation.valid_records);

        // ── Done ─────────────────────────────────────────────────────────
        clock.advance();
        let captioned_records = standardized
            .records
            .iter()
            .filter_map(|r| r.as_rag1())
            .filter(|r| r.image_caption.is_some())
            .count();
        let metadata = ProcessingMetadata {
            file: file_info(source, &ingested),
            row_count,
            image_count,
            captioned_records,
            routing: decision.clone(),
            rule_origin: standardized.rule_origin,
            stages: clock.stages,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
        };
        info!(
            "Run complete: {} {} records, {} degradations, {}ms",
            standardized.records.len(),
            decision.schema,
            degradations.len(),
            metadata.total_duration_ms
        );

        Ok(PipelineResult {
            schema: decision.schema,
            records: standardized.records,
            validation,
            metadata,
            degradations,
        })
    }

    /// Ingest and route only, returning what a run would do.
    ///
    /// Makes at most one capability call (the routing verdict).
    pub async fn analyze(&self, source: &SourceFile) -> Result<AnalysisReport, PipelineFailure> {
        let noop = NoopProgressCallback;
        let progress: &dyn PipelineProgressCallback =
            self.config.progress_callback.as_deref().unwrap_or(&noop);

        let mut clock = StageClock::start(progress);
        let ingested = match guarded(self.ingest_stage(source)).await.and_then(|r| r) {
            Ok(ingested) => ingested,
            Err(e) => return Err(clock.fail(e)),
        };
        clock.advance();
        let routing = match guarded(self.route_stage(source, &ingested)).await {
            Ok(routing) => routing,
            Err(e) => return Err(clock.fail(e)),
        };
        let stages = clock.stop();
        debug!("Analysis stages: {:?}", stages);

        let mut degradations = ingested.warnings.clone();
        degradations.extend(routing.degradations);
        Ok(AnalysisReport {
            file: file_info(source, &ingested),
            row_count: ingested.table.len(),
            image_count: ingested.images.image_count(),
            rows_with_images: ingested.images.rows().collect(),
            heuristic: routing.decision.heuristic,
            sample: ingested.table.sample(ANALYSIS_SAMPLE_ROWS),
            routing: routing.decision,
            degradations,
        })
    }

    /// Blocking wrapper around [`Pipeline::run`].
    ///
    /// Creates a temporary tokio runtime internally; do not call from async
    /// code.
    pub fn run_sync(&self, source: &SourceFile) -> Result<PipelineResult, PipelineFailure> {
        let runtime = tokio::runtime::Runtime::new().map_err(|e| PipelineFailure {
            failed_in: PipelineStage::Ingesting,
            error: StandardizeError::Internal(format!("Failed to create tokio runtime: {}", e)),
            stages: Vec::new(),
        })?;
        runtime.block_on(self.run(source))
    }
}

fn file_info(source: &SourceFile, ingested: &IngestedTable) -> FileInfo {
    FileInfo {
        filename: source.filename.clone(),
        kind: source.kind,
        size_bytes: source.size(),
        encoding: ingested.table.encoding,
        columns: ingested.table.columns.clone(),
    }
}
