//! # edgequake-tab2rag
//!
//! Standardize tabular sources (CSV, XLSX) into RAG-ready records.
//!
//! Every row becomes one record in one of two fixed schemas:
//!
//! * **RAG1**: structured documents (`articulo_id`, `numero`, `titulo`,
//!   `texto`, …). Pictures embedded in a spreadsheet are anchored to their
//!   row and turned into an `image_caption`.
//! * **RAG2**: service and ticket records (`descripcion`, `servicio`,
//!   `categoria`, …).
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes + kind
//!  │
//!  ├─ 1. Ingest       CSV/TSV decode or XLSX first sheet (spawn_blocking)
//!  │                  + drawing anchors → ImageAnchorMap
//!  ├─ 2. Route        column heuristics + text capability verdict → RAG1/RAG2
//!  ├─ 3. Standardize  rules, per-row fields, captions, translation
//!  ├─ 4. Validate     schema checks, confidence, integrity (advisory)
//!  └─ 5. Result       records + validation + metadata + degradations
//! ```
//!
//! Only an unreadable source fails a run. Every capability failure is
//! absorbed where it happens and reported as a [`Degradation`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_tab2rag::{Pipeline, PipelineConfig, SourceFile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let pipeline = Pipeline::from_config(PipelineConfig::default())?;
//!     let source = SourceFile::new(std::fs::read("tickets.csv")?, "tickets.csv")?;
//!     let result = pipeline.run(&source).await?;
//!     println!("{}", serde_json::to_string_pretty(&result.records)?);
//!     eprintln!("confidence {:.2}", result.validation.confidence);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `tab2rag` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-tab2rag = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod capability;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use capability::{DisabledCapabilities, TextCapability, VisionCapability};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{CapabilityError, Degradation, DegradationKind, IngestionError, StandardizeError};
pub use orchestrator::{Pipeline, PipelineFailure};
pub use output::{AnalysisReport, FileInfo, PipelineResult, ProcessingMetadata, StageTiming};
pub use pipeline::images::{ImageAnchorMap, ImageAsset};
pub use pipeline::ingest::{RawTable, SourceFile, SourceKind};
pub use pipeline::route::{FieldSource, RoutingDecision};
pub use pipeline::validate::ValidationOutcome;
pub use pipeline::PipelineStage;
pub use progress::{PipelineProgressCallback, ProgressCallback};
pub use schema::{Rag1Record, Rag2Record, SchemaTag, StandardizedRecord};
