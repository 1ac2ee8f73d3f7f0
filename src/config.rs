//! Configuration types for a standardization run.
//!
//! Every knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. The config is immutable once built and is
//! threaded into [`crate::orchestrator::Pipeline`] at construction; leaf
//! stages receive only the values they need.

use crate::error::StandardizeError;
use crate::progress::ProgressCallback;
use crate::schema::SchemaTag;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;

/// Hard ceiling for normalized image edges, in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 1024;

/// Hard ceiling for the routing sample, in rows.
pub const MAX_ROUTING_SAMPLE_ROWS: usize = 100;

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_tab2rag::{PipelineConfig, SchemaTag};
///
/// let config = PipelineConfig::builder()
///     .model("gpt-4.1-mini")
///     .confidence_threshold(0.9)
///     .forced_schema(SchemaTag::Rag1)
///     .build()
///     .unwrap();
/// assert_eq!(config.forced_schema, Some(SchemaTag::Rag1));
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Text model identifier, e.g. "gpt-4.1-nano". If None, uses provider default.
    pub model: Option<String>,

    /// Vision model identifier. Falls back to `model` when unset.
    pub vision_model: Option<String>,

    /// LLM provider name (e.g. "openai", "azure", "ollama").
    /// If None along with `provider`, the environment is consulted.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for every capability call. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens a capability call may generate. Default: 2048.
    pub max_tokens: usize,

    /// Maximum retry attempts on a failed capability call. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 60.
    ///
    /// A timeout takes the same fallback path as a failed call.
    pub api_timeout_secs: u64,

    /// Rows shown to the router. Default and maximum: 100.
    pub routing_sample_rows: usize,

    /// Rows shown to the conceptualization call. Default: 10.
    pub conceptualization_sample_rows: usize,

    /// Advisory confidence threshold for validation. Default: 0.80.
    pub confidence_threshold: f64,

    /// Longest edge of a normalized image. Default and maximum: 1024.
    pub max_image_dimension: u32,

    /// Largest accepted source file in bytes. Default: 50 MiB.
    pub max_file_bytes: usize,

    /// Skip the routing call and use this schema. Default: None.
    pub forced_schema: Option<SchemaTag>,

    /// Ask the text capability to translate each record. Default: true.
    pub translate_records: bool,

    /// Ask the vision capability for image captions. Default: true.
    pub describe_images: bool,

    /// Optional per-row progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: None,
            vision_model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 2048,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            routing_sample_rows: MAX_ROUTING_SAMPLE_ROWS,
            conceptualization_sample_rows: 10,
            confidence_threshold: 0.80,
            max_image_dimension: MAX_IMAGE_DIMENSION,
            max_file_bytes: 50 * 1024 * 1024,
            forced_schema: None,
            translate_records: true,
            describe_images: true,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("model", &self.model)
            .field("vision_model", &self.vision_model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("routing_sample_rows", &self.routing_sample_rows)
            .field("confidence_threshold", &self.confidence_threshold)
            .field("max_image_dimension", &self.max_image_dimension)
            .field("forced_schema", &self.forced_schema)
            .field("translate_records", &self.translate_records)
            .field("describe_images", &self.describe_images)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Model used for vision calls: `vision_model`, else `model`.
    pub fn effective_vision_model(&self) -> Option<&str> {
        self.vision_model.as_deref().or(self.model.as_deref())
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn vision_model(mut self, model: impl Into<String>) -> Self {
        self.config.vision_model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn routing_sample_rows(mut self, n: usize) -> Self {
        self.config.routing_sample_rows = n.clamp(1, MAX_ROUTING_SAMPLE_ROWS);
        self
    }

    pub fn conceptualization_sample_rows(mut self, n: usize) -> Self {
        self.config.conceptualization_sample_rows = n.max(1);
        self
    }

    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.config.confidence_threshold = threshold;
        self
    }

    pub fn max_image_dimension(mut self, px: u32) -> Self {
        self.config.max_image_dimension = px.clamp(16, MAX_IMAGE_DIMENSION);
        self
    }

    pub fn max_file_bytes(mut self, bytes: usize) -> Self {
        self.config.max_file_bytes = bytes;
        self
    }

    pub fn forced_schema(mut self, schema: SchemaTag) -> Self {
        self.config.forced_schema = Some(schema);
        self
    }

    pub fn translate_records(mut self, v: bool) -> Self {
        self.config.translate_records = v;
        self
    }

    pub fn describe_images(mut self, v: bool) -> Self {
        self.config.describe_images = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, StandardizeError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.confidence_threshold) || c.confidence_threshold.is_nan() {
            return Err(StandardizeError::InvalidConfig(format!(
                "Confidence threshold must be 0.0–1.0, got {}",
                c.confidence_threshold
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(StandardizeError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_file_bytes == 0 {
            return Err(StandardizeError::InvalidConfig(
                "Maximum file size must be ≥ 1 byte".into(),
            ));
        }
        Ok(self.config)
    }
}
