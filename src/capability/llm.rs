//! Capability clients over edgequake-llm providers.
//!
//! [`LlmTextClient`] and [`LlmVisionClient`] turn capability requests into
//! chat calls. This module stays thin: prompt wording lives in
//! [`crate::prompts`], answer parsing in the core.
//!
//! ## Retry Strategy
//!
//! Every call is wrapped in a per-attempt `tokio::time::timeout` and retried
//! with exponential backoff (`retry_backoff_ms * 2^(attempt-1)`): with 500 ms
//! base and 3 retries the wait sequence is 500 ms → 1 s → 2 s. When every
//! attempt timed out the error is [`CapabilityError::Timeout`], otherwise
//! [`CapabilityError::CallFailed`]. Both take the same fallback path upstream.

use crate::capability::answer::parse_json_answer;
use crate::capability::encode::to_image_data;
use crate::capability::{
    AnalysisRequest, ConceptualizationRequest, TextCapability, TranslationRequest,
    VisionCapability,
};
use crate::config::PipelineConfig;
use crate::error::{CapabilityError, StandardizeError};
use crate::pipeline::images::ImageAsset;
use crate::prompts;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Call settings shared by both clients.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub api_timeout_secs: u64,
}

impl From<&PipelineConfig> for CallSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout_secs: config.api_timeout_secs,
        }
    }
}

impl CallSettings {
    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// Send `messages`, retrying with backoff, and return the answer text.
async fn chat_with_retry(
    provider: &Arc<dyn LLMProvider>,
    messages: &[ChatMessage],
    settings: &CallSettings,
    label: &str,
) -> Result<String, CapabilityError> {
    let start = Instant::now();
    let options = settings.options();
    let per_call = Duration::from_secs(settings.api_timeout_secs);

    let mut last_err: Option<String> = None;
    let mut all_timed_out = true;

    for attempt in 0..=settings.max_retries {
        if attempt > 0 {
            let backoff = settings.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "{}: retry {}/{} after {}ms",
                label, attempt, settings.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match timeout(per_call, provider.chat(messages, Some(&options))).await {
            Ok(Ok(response)) => {
                debug!(
                    "{}: {} input tokens, {} output tokens, {:?}",
                    label,
                    response.prompt_tokens,
                    response.completion_tokens,
                    start.elapsed()
                );
                if response.content.trim().is_empty() {
                    return Err(CapabilityError::EmptyAnswer);
                }
                return Ok(response.content);
            }
            Ok(Err(e)) => {
                all_timed_out = false;
                let err_msg = format!("{}", e);
                warn!("{}: attempt {} failed: {}", label, attempt + 1, err_msg);
                last_err = Some(err_msg);
            }
            Err(_) => {
                warn!(
                    "{}: attempt {} timed out after {}s",
                    label,
                    attempt + 1,
                    settings.api_timeout_secs
                );
            }
        }
    }

    if all_timed_out {
        return Err(CapabilityError::Timeout {
            secs: settings.api_timeout_secs,
        });
    }
    Err(CapabilityError::CallFailed {
        retries: settings.max_retries,
        detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
    })
}

// ── Text ─────────────────────────────────────────────────────────────────

/// [`TextCapability`] backed by a chat model.
pub struct LlmTextClient {
    provider: Arc<dyn LLMProvider>,
    settings: CallSettings,
}

impl LlmTextClient {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: CallSettings) -> Self {
        Self { provider, settings }
    }

    async fn ask(&self, system: &str, user: String, label: &str) -> Result<String, CapabilityError> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        chat_with_retry(&self.provider, &messages, &self.settings, label).await
    }
}

#[async_trait]
impl TextCapability for LlmTextClient {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, CapabilityError> {
        self.ask(
            prompts::ROUTING_SYSTEM_PROMPT,
            prompts::routing_user_prompt(request),
            "analyze",
        )
        .await
    }

    async fn conceptualize(
        &self,
        request: &ConceptualizationRequest,
    ) -> Result<String, CapabilityError> {
        self.ask(
            prompts::CONCEPTUALIZATION_SYSTEM_PROMPT,
            prompts::conceptualization_user_prompt(request),
            "conceptualize",
        )
        .await
    }

    async fn translate(&self, request: &TranslationRequest) -> Result<String, CapabilityError> {
        let label = format!("translate row {}", request.row);
        self.ask(
            prompts::TRANSLATION_SYSTEM_PROMPT,
            prompts::translation_user_prompt(request),
            &label,
        )
        .await
    }
}

// ── Vision ───────────────────────────────────────────────────────────────

/// [`VisionCapability`] backed by a multimodal chat model.
pub struct LlmVisionClient {
    provider: Arc<dyn LLMProvider>,
    settings: CallSettings,
}

impl LlmVisionClient {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: CallSettings) -> Self {
        Self { provider, settings }
    }
}

#[async_trait]
impl VisionCapability for LlmVisionClient {
    async fn describe_image(&self, asset: &ImageAsset) -> Result<Option<String>, CapabilityError> {
        // The image carries all the content; the user text stays empty.
        let messages = vec![
            ChatMessage::system(prompts::IMAGE_DESCRIPTION_PROMPT),
            ChatMessage::user_with_images("", vec![to_image_data(asset)]),
        ];
        let label = format!("describe {}", asset.media_path);
        match chat_with_retry(&self.provider, &messages, &self.settings, &label).await {
            Ok(text) => Ok(Some(text)),
            Err(CapabilityError::EmptyAnswer) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn describe_images(
        &self,
        assets: &[&ImageAsset],
    ) -> Result<Vec<Option<String>>, CapabilityError> {
        if assets.is_empty() {
            return Ok(Vec::new());
        }
        let images = assets.iter().map(|a| to_image_data(a)).collect();
        let messages = vec![
            ChatMessage::system(prompts::MULTI_IMAGE_DESCRIPTION_PROMPT),
            ChatMessage::user_with_images("", images),
        ];
        let label = format!("describe {} images", assets.len());
        let raw = chat_with_retry(&self.provider, &messages, &self.settings, &label).await?;

        let descriptions: Vec<Option<String>> = parse_json_answer(&raw)?;
        if descriptions.len() != assets.len() {
            return Err(CapabilityError::Unparsable {
                detail: format!(
                    "expected {} descriptions, got {}",
                    assets.len(),
                    descriptions.len()
                ),
            });
        }
        Ok(descriptions)
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, StandardizeError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        StandardizeError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve a provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI key** (`OPENAI_API_KEY`) with the configured or default model.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
///
/// `model` overrides the configured model at steps 2 and 4; the vision
/// client passes its own model here.
pub fn resolve_provider(
    config: &PipelineConfig,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, StandardizeError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = model.or(config.model.as_deref());

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model.unwrap_or(DEFAULT_MODEL));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model.unwrap_or(DEFAULT_MODEL));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| StandardizeError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, AZURE_OPENAI_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
