//! Batch orchestration: fan out per-document work and account progress.
//!
//! For each accepted document the pipeline persists the original, produces
//! previews, and — when extraction is configured — runs structured
//! extraction against them. Items are processed concurrently and
//! independently; a single item's failure is isolated: it is recorded in
//! the batch's progress data and never aborts its siblings.
//!
//! Progress accounting is the load-bearing invariant here: `total` is
//! fixed when the batch is accepted and **every** item increments exactly
//! once, success or failure, so `current` strictly reaches `total` and
//! subscribers always observe batch completion. Increments commute, so
//! item workers need no ordering between them.
//!
//! Batch processing runs to completion independently of any observer:
//! cancelling a progress subscription stops only that subscriber's poll
//! loop. There is no timeout on the batch itself — a slow extraction
//! delays only its own item's increment.

use crate::config::ProcessingConfig;
use crate::error::{ItemError, LedgerLensError};
use crate::pipeline::preview::{Preview, PreviewConverter, PREVIEW_CONTENT_TYPE};
use crate::pipeline::{extract, persist};
use crate::progress::{ItemReport, ItemStatus, ProgressPatch, ProgressStore, ProgressTracker};
use crate::schema::{build_schema, render_prompt, FieldDescriptor, DEFAULT_EXTRACTION_TEMPLATE};
use edgequake_llm::LLMProvider;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// `type` tag of batch progress records.
pub const BATCH_PROGRESS_KIND: &str = "document-batch";

/// One uploaded document within a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub file_name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// User-defined definitions that drive schema and prompt synthesis.
#[derive(Debug, Clone, Default)]
pub struct ExtractionContext {
    pub fields: Vec<FieldDescriptor>,
    pub categories: Vec<FieldDescriptor>,
    pub projects: Vec<FieldDescriptor>,
}

impl ExtractionContext {
    /// Extraction only makes sense when at least one field instructs it.
    fn wants_extraction(&self) -> bool {
        self.fields
            .iter()
            .any(|f| f.instruction.as_deref().is_some_and(|i| !i.trim().is_empty()))
    }
}

/// Everything shared by the per-item extraction calls of one batch.
struct ExtractionAssets {
    provider: Arc<dyn LLMProvider>,
    schema: Value,
    prompt: String,
}

/// Result of one item, paired with the report written to progress data.
#[derive(Debug)]
pub struct ItemOutcome {
    pub item_index: usize,
    pub stored_path: Option<PathBuf>,
    pub preview: Option<Preview>,
    pub extracted: Option<Value>,
    pub report: ItemReport,
}

/// Result of a whole batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub progress_id: String,
    pub total: usize,
    pub outcomes: Vec<ItemOutcome>,
}

/// Orchestrates per-document conversion and extraction for one process.
pub struct DocumentPipeline {
    config: ProcessingConfig,
    converter: PreviewConverter,
    tracker: ProgressTracker,
}

impl DocumentPipeline {
    pub fn new(config: ProcessingConfig, store: Arc<dyn ProgressStore>) -> Self {
        let converter = PreviewConverter::new(&config);
        let tracker = ProgressTracker::new(store, config.poll_interval);
        Self {
            config,
            converter,
            tracker,
        }
    }

    /// The tracker backing this pipeline's progress records, for
    /// subscribing and for serving reads.
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// The converter, for serving preview requests outside a batch.
    pub fn converter(&self) -> &PreviewConverter {
        &self.converter
    }

    /// Process one batch of documents under a fresh progress id.
    ///
    /// See [`DocumentPipeline::process_batch_with_id`].
    pub async fn process_batch(
        &self,
        owner_id: &str,
        items: Vec<BatchItem>,
        extraction: Option<&ExtractionContext>,
    ) -> Result<BatchOutcome, LedgerLensError> {
        let progress_id = Uuid::new_v4().to_string();
        self.process_batch_with_id(owner_id, &progress_id, items, extraction)
            .await
    }

    /// Process one batch of documents under a caller-chosen progress id,
    /// letting a subscriber attach before the first orchestration step
    /// (the record is created by whichever side gets there first).
    ///
    /// Fixes `total` to the accepted item count, then fans the items out
    /// at the configured concurrency. The returned outcomes are ordered
    /// by item index regardless of completion order.
    pub async fn process_batch_with_id(
        &self,
        owner_id: &str,
        progress_id: &str,
        items: Vec<BatchItem>,
        extraction: Option<&ExtractionContext>,
    ) -> Result<BatchOutcome, LedgerLensError> {
        if items.is_empty() {
            return Err(LedgerLensError::InvalidParameter {
                name: "items",
                reason: "a batch must contain at least one document".to_string(),
            });
        }

        // Resolve shared extraction assets before accepting the batch so a
        // misconfigured provider fails the request, not every item.
        let assets = match extraction {
            Some(ctx) if ctx.wants_extraction() => {
                let provider = extract::resolve_provider(&self.config)?;
                let template = self
                    .config
                    .extraction_template
                    .as_deref()
                    .unwrap_or(DEFAULT_EXTRACTION_TEMPLATE);
                Some(Arc::new(ExtractionAssets {
                    provider,
                    schema: build_schema(&ctx.fields),
                    prompt: render_prompt(template, &ctx.fields, &ctx.categories, &ctx.projects),
                }))
            }
            _ => None,
        };

        let total = items.len();
        self.tracker
            .get_or_create(owner_id, progress_id, BATCH_PROGRESS_KIND)
            .await;
        self.tracker
            .update(
                owner_id,
                progress_id,
                ProgressPatch {
                    total: Some(total as u32),
                    ..Default::default()
                },
            )
            .await;
        info!("Batch {} accepted: {} items", progress_id, total);

        let mut outcomes: Vec<ItemOutcome> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let assets = assets.clone();
                async move {
                    let result = self
                        .process_item(owner_id, index, item, assets.as_deref())
                        .await;

                    let (stored_path, preview, extracted, report) = match result {
                        Ok((stored, preview, extracted)) => (
                            Some(stored),
                            Some(preview),
                            extracted,
                            ItemReport {
                                item_index: index,
                                status: ItemStatus::Succeeded,
                                error_kind: None,
                            },
                        ),
                        Err(e) => {
                            warn!("Batch item failed: {}", e);
                            (
                                None,
                                None,
                                None,
                                ItemReport {
                                    item_index: index,
                                    status: ItemStatus::Failed,
                                    error_kind: Some(e.kind().to_string()),
                                },
                            )
                        }
                    };

                    // Account exactly once per item, success or failure.
                    self.tracker
                        .append_report(owner_id, progress_id, report.clone())
                        .await;
                    self.tracker
                        .increment(owner_id, progress_id, 1)
                        .await;

                    ItemOutcome {
                        item_index: index,
                        stored_path,
                        preview,
                        extracted,
                        report,
                    }
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        outcomes.sort_by_key(|o| o.item_index);

        let failed = outcomes
            .iter()
            .filter(|o| o.report.status == ItemStatus::Failed)
            .count();
        info!(
            "Batch {} complete: {}/{} items succeeded",
            progress_id,
            total - failed,
            total
        );

        Ok(BatchOutcome {
            progress_id: progress_id.to_string(),
            total,
            outcomes,
        })
    }

    async fn process_item(
        &self,
        owner_id: &str,
        index: usize,
        item: BatchItem,
        assets: Option<&ExtractionAssets>,
    ) -> Result<(PathBuf, Preview, Option<Value>), ItemError> {
        let documents_dir = self.config.documents_dir(owner_id);
        let stored = persist::persist_original(&documents_dir, &item.file_name, &item.bytes)
            .await
            .map_err(|e| ItemError::Persist {
                index,
                detail: e.to_string(),
            })?;

        let preview = self
            .converter
            .produce(owner_id, &stored, &item.media_type)
            .await
            .map_err(|e| ItemError::Conversion {
                index,
                detail: e.to_string(),
            })?;

        // Extraction reads the converted artifacts; a pass-through or
        // degraded preview has no visual form the model can consume.
        let extracted = match assets {
            Some(assets) if preview.content_type == PREVIEW_CONTENT_TYPE => {
                let images = preview
                    .paths
                    .iter()
                    .map(|p| extract::encode_artifact(p, index))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(
                    extract::extract_document(
                        &assets.provider,
                        index,
                        images,
                        &assets.prompt,
                        &assets.schema,
                        &self.config,
                    )
                    .await?,
                )
            }
            _ => None,
        };

        Ok((stored, preview, extracted))
    }
}
