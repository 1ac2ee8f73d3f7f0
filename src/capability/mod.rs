//! Text and vision capability clients.
//!
//! The pipeline never talks to a model directly. It asks a [`TextCapability`]
//! to analyze, conceptualize or translate, and a [`VisionCapability`] to
//! describe images. Both are black boxes: prompt wording and transport belong
//! to the implementation ([`llm`] for edgequake-llm providers, test stubs in
//! `tests/`).
//!
//! ```text
//! request ──▶ capability ──▶ raw answer ──▶ answer::parse_json_answer
//!   (serde)     (LLM call)     (String)       (fences, JSON)
//! ```
//!
//! Every method returns `Result<_, CapabilityError>`. The caller converts a
//! failure into a [`crate::error::Degradation`] at its origin; nothing here
//! can abort a run.

pub mod answer;
pub mod encode;
pub mod llm;

use crate::error::CapabilityError;
use crate::pipeline::images::ImageAsset;
use crate::schema::SchemaTag;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// One sampled row, column name → display value.
pub type SampleRow = BTreeMap<String, String>;

/// Context for the routing call.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    /// `csv` or `xlsx`.
    pub source_kind: String,
    pub columns: Vec<String>,
    pub sample: Vec<SampleRow>,
    /// Schema the heuristics proposed.
    pub heuristic_schema: SchemaTag,
    pub image_count: usize,
}

/// Context for the transformation-rule call.
#[derive(Debug, Clone, Serialize)]
pub struct ConceptualizationRequest {
    pub schema: SchemaTag,
    pub columns: Vec<String>,
    pub sample: Vec<SampleRow>,
    /// Target field → source column, as routed.
    pub mapping: BTreeMap<String, String>,
}

/// Fields of one synthesized record, offered for translation.
#[derive(Debug, Clone, Serialize)]
pub struct TranslationRequest {
    pub schema: SchemaTag,
    pub row: usize,
    pub fields: BTreeMap<String, String>,
}

/// Language-model calls used by the router and the standardizer.
///
/// Each method returns the raw answer text; the core parses it.
#[async_trait]
pub trait TextCapability: Send + Sync {
    /// Propose a schema, a rationale and optionally a column mapping.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, CapabilityError>;

    /// Propose per-field transformation rules.
    async fn conceptualize(
        &self,
        request: &ConceptualizationRequest,
    ) -> Result<String, CapabilityError>;

    /// Translate the textual fields of one record.
    async fn translate(&self, request: &TranslationRequest) -> Result<String, CapabilityError>;
}

/// Image-understanding calls used for caption synthesis.
///
/// `Ok(None)` means the backend answered but had nothing to say about the
/// image; it is reported separately from a failed call so callers null out
/// rather than fabricate.
#[async_trait]
pub trait VisionCapability: Send + Sync {
    async fn describe_image(&self, asset: &ImageAsset) -> Result<Option<String>, CapabilityError>;

    /// Describe several images in one call; the answer keeps input order.
    async fn describe_images(
        &self,
        assets: &[&ImageAsset],
    ) -> Result<Vec<Option<String>>, CapabilityError>;
}

/// Capabilities with no backend. Every call reports `Unavailable`.
///
/// Used for heuristic-only runs and when no vision provider is configured.
#[derive(Debug, Clone, Default)]
pub struct DisabledCapabilities {
    reason: String,
}

impl DisabledCapabilities {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable(&self) -> CapabilityError {
        let reason = if self.reason.is_empty() {
            "no backend configured".to_string()
        } else {
            self.reason.clone()
        };
        CapabilityError::Unavailable { reason }
    }
}

#[async_trait]
impl TextCapability for DisabledCapabilities {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<String, CapabilityError> {
        Err(self.unavailable())
    }

    async fn conceptualize(
        &self,
        _request: &ConceptualizationRequest,
    ) -> Result<String, CapabilityError> {
        Err(self.unavailable())
    }

    async fn translate(&self, _request: &TranslationRequest) -> Result<String, CapabilityError> {
        Err(self.unavailable())
    }
}

#[async_trait]
impl VisionCapability for DisabledCapabilities {
    async fn describe_image(&self, _asset: &ImageAsset) -> Result<Option<String>, CapabilityError> {
        Err(self.unavailable())
    }

    async fn describe_images(
        &self,
        _assets: &[&ImageAsset],
    ) -> Result<Vec<Option<String>>, CapabilityError> {
        Err(self.unavailable())
    }
}
