//! Structured extraction: drive the vision model over preview artifacts.
//!
//! This module converts a document's preview images into one model call
//! and returns the parsed JSON object. It is intentionally thin — the
//! schema and prompt are synthesised in [`crate::schema`] so they can
//! evolve without touching retry or error-handling logic here.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from model APIs are transient and frequent under
//! concurrent load, and models occasionally return malformed JSON despite
//! the schema instruction. Both cases retry with exponential backoff
//! (`retry_backoff_ms * 2^attempt`): with 500 ms base and 3 retries the
//! wait sequence is 500 ms → 1 s → 2 s, under 4 s of back-off per item.

use crate::config::ProcessingConfig;
use crate::error::{ItemError, LedgerLensError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Resolve the extraction provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`) — the caller constructed
///    and configured the provider entirely; useful in tests or when the
///    caller needs custom middleware.
/// 2. **Named provider + model** (`config.provider_name`) — reads the
///    corresponding API key from the environment.
/// 3. **Full auto-detection** — the factory scans known API key variables
///    and picks the first available provider.
pub fn resolve_provider(
    config: &ProcessingConfig,
) -> Result<Arc<dyn LLMProvider>, LedgerLensError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return ProviderFactory::create_llm_provider(name, model).map_err(|e| {
            LedgerLensError::ExtractorNotConfigured {
                provider: name.clone(),
                hint: format!("{e}"),
            }
        });
    }

    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| LedgerLensError::ExtractorNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No provider could be auto-detected from the environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure one explicitly.\n\
                Error: {e}"
            ),
        })?;
    Ok(provider)
}

/// Base64-wrap one preview artifact for the model request body.
pub fn encode_artifact(path: &Path, index: usize) -> Result<ImageData, ItemError> {
    let bytes = std::fs::read(path).map_err(|e| ItemError::Extraction {
        index,
        retries: 0,
        detail: format!("read artifact '{}': {e}", path.display()),
    })?;
    Ok(ImageData::new(STANDARD.encode(&bytes), "image/jpeg").with_detail("high"))
}

/// Extract structured fields from one document's preview images.
///
/// ## Message Layout
///
/// 1. **System message** — the rendered extraction prompt followed by the
///    structured-output schema the reply must satisfy
/// 2. **User message** — the page JPEGs as base64 attachments (empty text)
///
/// The empty user text is intentional: model APIs require at least one
/// user turn to respond to, but the images carry all the actual content.
pub async fn extract_document(
    provider: &Arc<dyn LLMProvider>,
    index: usize,
    images: Vec<ImageData>,
    prompt: &str,
    schema: &Value,
    config: &ProcessingConfig,
) -> Result<Value, ItemError> {
    let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    let system = format!(
        "{prompt}\n\nYour reply must be exactly one JSON object that validates against this JSON Schema:\n{schema_text}"
    );

    let messages = vec![
        ChatMessage::system(system),
        ChatMessage::user_with_images("", images),
    ];

    let options = CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    };

    let mut last_err: Option<String> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "Item {}: extraction retry {}/{} after {}ms",
                index, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match provider.chat(&messages, Some(&options)).await {
            Ok(response) => {
                debug!(
                    "Item {}: extraction used {} input / {} output tokens",
                    index, response.prompt_tokens, response.completion_tokens
                );
                match parse_json_reply(&response.content) {
                    Ok(value) => return Ok(value),
                    Err(detail) => {
                        warn!("Item {}: malformed extraction reply — {}", index, detail);
                        last_err = Some(detail);
                    }
                }
            }
            Err(e) => {
                let detail = format!("{e}");
                warn!("Item {}: extraction attempt {} failed — {}", index, attempt + 1, detail);
                last_err = Some(detail);
            }
        }
    }

    Err(ItemError::Extraction {
        index,
        retries: config.max_retries as u8,
        detail: last_err.unwrap_or_else(|| "unknown error".to_string()),
    })
}

/// Parse the model reply, tolerating a fenced code block around the JSON.
fn parse_json_reply(content: &str) -> Result<Value, String> {
    let text = strip_code_fences(content.trim());
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("reply is not valid JSON: {e}"))?;
    if !value.is_object() {
        return Err("reply is valid JSON but not an object".to_string());
    }
    Ok(value)
}

/// Remove a wrapping ```json fence that models emit despite instructions.
fn strip_code_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. "json") on the fence line.
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => return text,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
