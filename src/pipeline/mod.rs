//! Pipeline stages for tabular-to-RAG standardization.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and the orchestrator only sequences them.
//!
//! ## Data Flow
//!
//! ```text
//! ingest ──▶ route ──▶ standardize ──▶ validate
//!  │  (CSV/XLSX)  (schema)  (records)      (advisory)
//!  └─ images: drawing anchors → ImageAnchorMap, used by caption
//! ```
//!
//! 1. [`ingest`]  : decode the source into a [`ingest::RawTable`]; for
//!    spreadsheets also delegate to [`images`]
//! 2. [`images`]  : extract, anchor and normalize embedded pictures
//! 3. [`route`]   : heuristics plus a text-capability verdict pick RAG1/RAG2
//! 4. [`standardize`]: per-row field synthesis, translation and, via
//!    [`caption`], image captions
//! 5. [`validate`]: schema checks and confidence, never a filter
//!
//! [`queue`] holds the one-call-at-a-time scheduling policy used for every
//! capability call made per row or per image.

pub mod caption;
pub mod images;
pub mod ingest;
pub mod queue;
pub mod route;
pub mod standardize;
pub mod validate;

use serde::{Deserialize, Serialize};
use std::fmt;

/// States of a pipeline run.
///
/// The run advances strictly forward:
/// `Ingesting → Routing → Standardizing → Validating → Done`. `Failed` is
/// terminal and reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Ingesting,
    Routing,
    Standardizing,
    Validating,
    Done,
    Failed,
}

impl PipelineStage {
    /// The next state on success, `None` for terminal states.
    pub fn next(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Ingesting => Some(PipelineStage::Routing),
            PipelineStage::Routing => Some(PipelineStage::Standardizing),
            PipelineStage::Standardizing => Some(PipelineStage::Validating),
            PipelineStage::Validating => Some(PipelineStage::Done),
            PipelineStage::Done | PipelineStage::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Ingesting => "ingesting",
            PipelineStage::Routing => "routing",
            PipelineStage::Standardizing => "standardizing",
            PipelineStage::Validating => "validating",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
