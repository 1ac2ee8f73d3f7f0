//! Values returned to the caller: [`PipelineResult`] for a run and
//! [`AnalysisReport`] for a preview.
//!
//! Both serialize to JSON. Record field names are the RAG1/RAG2 wire names.

use crate::capability::SampleRow;
use crate::error::{Degradation, DegradationKind};
use crate::pipeline::ingest::{DetectedEncoding, SourceKind};
use crate::pipeline::route::{HeuristicScores, RoutingDecision};
use crate::pipeline::standardize::RuleOrigin;
use crate::pipeline::validate::ValidationOutcome;
use crate::pipeline::PipelineStage;
use crate::schema::{SchemaTag, StandardizedRecord};
use serde::{Deserialize, Serialize};

/// What was ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub kind: SourceKind,
    pub size_bytes: usize,
    pub encoding: DetectedEncoding,
    pub columns: Vec<String>,
}

/// Wall-clock time spent in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: PipelineStage,
    pub duration_ms: u64,
}

/// How the run went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub file: FileInfo,
    pub row_count: usize,
    pub image_count: usize,
    /// RAG1 records that ended up with a caption.
    pub captioned_records: usize,
    pub routing: RoutingDecision,
    pub rule_origin: RuleOrigin,
    pub stages: Vec<StageTiming>,
    pub total_duration_ms: u64,
}

impl ProcessingMetadata {
    pub fn stage_duration_ms(&self, stage: PipelineStage) -> Option<u64> {
        self.stages
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.duration_ms)
    }
}

/// Outcome of a completed run.
///
/// `records` holds one record per ingested row, in row order, whatever the
/// validation outcome says about them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub schema: SchemaTag,
    pub records: Vec<StandardizedRecord>,
    pub validation: ValidationOutcome,
    pub metadata: ProcessingMetadata,
    /// Every non-fatal condition, in the order it occurred.
    pub degradations: Vec<Degradation>,
}

impl PipelineResult {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn degradations_of(&self, kind: DegradationKind) -> impl Iterator<Item = &Degradation> {
        self.degradations.iter().filter(move |d| d.kind == kind)
    }
}

/// Preview of how a source would be routed, without standardizing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub file: FileInfo,
    pub row_count: usize,
    pub image_count: usize,
    /// Data rows holding at least one image.
    pub rows_with_images: Vec<usize>,
    pub heuristic: HeuristicScores,
    pub routing: RoutingDecision,
    pub sample: Vec<SampleRow>,
    pub degradations: Vec<Degradation>,
}
