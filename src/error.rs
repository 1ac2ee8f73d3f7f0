//! Error types for the edgequake-tab2rag library.
//!
//! Failures fall into two families:
//!
//! * [`StandardizeError`] (**fatal**): the run cannot produce records at all
//!   (unreadable file, no provider for the text capability, bad config).
//!   Surfaced through [`crate::orchestrator::PipelineFailure`].
//!
//! * [`Degradation`] (**non-fatal**): one image, one field or the routing
//!   verdict could not be produced as intended. The run continues with a
//!   fallback value and the condition is reported in
//!   [`crate::output::PipelineResult::degradations`].
//!
//! [`CapabilityError`] is what a text or vision call returns. It never leaves
//! the core as an error: every call site converts it into a `Degradation`.

use crate::pipeline::PipelineStage;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// All fatal errors returned by the edgequake-tab2rag library.
#[derive(Debug, Error)]
pub enum StandardizeError {
    // ── Ingestion ─────────────────────────────────────────────────────────
    /// The source file could not be turned into a table.
    #[error("Ingestion failed: {0}")]
    IngestionFailure(#[from] IngestionError),

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The text capability has no usable provider (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (a worker task panicked, …).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StandardizeError {
    /// True when the run failed because the source could not be ingested.
    pub fn is_ingestion_failure(&self) -> bool {
        matches!(self, StandardizeError::IngestionFailure(_))
    }
}

/// Why a source file could not be ingested.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestionError {
    /// File extension is neither delimited text nor a spreadsheet.
    #[error("Unsupported source '{filename}': use CSV, TSV or XLSX")]
    UnsupportedSource { filename: String },

    #[error("Source is {size} bytes, above the {limit} byte limit")]
    FileTooLarge { size: usize, limit: usize },

    /// Delimited text whose encoding could not be determined.
    #[error("Could not decode delimited text: {detail}")]
    UndecodableText { detail: String },

    #[error("Malformed delimited text at record {record}: {detail}")]
    MalformedDelimited { record: usize, detail: String },

    /// The spreadsheet package or its first worksheet could not be read.
    #[error("Spreadsheet is corrupt or unreadable: {detail}")]
    CorruptSpreadsheet { detail: String },

    #[error("Spreadsheet has no worksheet")]
    NoWorksheet,

    #[error("Source has no columns")]
    NoColumns,

    #[error("Source has a header but no data rows")]
    NoRows,
}

/// A failed text or vision capability call.
///
/// `Unavailable` and `Timeout` take the same fallback path as any other
/// failure; they are separate variants so logs say what happened.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityError {
    /// No backend is configured for this capability.
    #[error("capability unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The backend returned an error after all retries.
    #[error("call failed after {retries} retries: {detail}")]
    CallFailed { retries: u32, detail: String },

    /// The answer arrived but is not in the expected shape.
    #[error("unparsable answer: {detail}")]
    Unparsable { detail: String },

    #[error("empty answer")]
    EmptyAnswer,
}

/// Category of a non-fatal condition absorbed at its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    /// One embedded image was dropped (corrupt payload, codec, no anchor).
    ImageExtractionWarning,
    /// The routing verdict fell back to heuristics.
    RoutingUncertainty,
    /// A field (or the whole rule set) fell back to raw/default values.
    FieldSynthesisFailure,
    /// An image description could not be obtained.
    VisionAnalysisFailure,
}

impl fmt::Display for DegradationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DegradationKind::ImageExtractionWarning => "image extraction warning",
            DegradationKind::RoutingUncertainty => "routing uncertainty",
            DegradationKind::FieldSynthesisFailure => "field synthesis failure",
            DegradationKind::VisionAnalysisFailure => "vision analysis failure",
        };
        f.write_str(s)
    }
}

/// A non-fatal condition, with enough context to reproduce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub kind: DegradationKind,
    pub stage: PipelineStage,
    /// Zero-based data row, when the condition belongs to one row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    /// Image position: 1-based within its row once anchored, otherwise the
    /// 1-based drawing order in the worksheet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<usize>,
    pub detail: String,
}

impl Degradation {
    pub fn new(kind: DegradationKind, stage: PipelineStage, detail: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            row: None,
            image: None,
            detail: detail.into(),
        }
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn at_image(mut self, image: usize) -> Self {
        self.image = Some(image);
        self
    }
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} during {}", self.kind, self.stage)?;
        if let Some(row) = self.row {
            write!(f, " (row {row}")?;
            if let Some(image) = self.image {
                write!(f, ", image {image}")?;
            }
            f.write_str(")")?;
        } else if let Some(image) = self.image {
            write!(f, " (image {image})")?;
        }
        write!(f, ": {}", self.detail)
    }
}
