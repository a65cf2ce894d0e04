//! # ledgerlens
//!
//! The asynchronous document-processing core of an expense platform:
//! convert uploaded documents into normalised visual previews, extract
//! structured fields from them with a vision model, stream per-batch
//! progress live to subscribers, and resolve historical exchange rates
//! through a tiered provider chain with time-boxed caching.
//!
//! ## Why this shape?
//!
//! Everything with real algorithmic or concurrency content lives here —
//! content-addressed convert-once previews, diff-based server push,
//! commutative progress accounting, multi-provider fallback, dynamic
//! schema synthesis. Authentication, entity storage, and UI are external
//! collaborators; the only storage this crate touches directly is the
//! progress record store, behind the [`progress::ProgressStore`] port.
//!
//! ## Pipeline Overview
//!
//! ```text
//! batch upload
//!  │
//!  ├─ 1. Persist  original bytes under the owner's document dir
//!  ├─ 2. Preview  rasterise pages / downscale images (convert-once)
//!  ├─ 3. Extract  schema-constrained vision-model call per document
//!  └─ 4. Account  one progress increment per item, success or failure
//!                  │
//!                  └─▶ subscribers observe change via a diff-on-timer stream
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ledgerlens::{
//!     BatchItem, DocumentPipeline, MemoryProgressStore, ProcessingConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProcessingConfig::builder()
//!         .data_root("./data")
//!         .build()?;
//!     let pipeline = DocumentPipeline::new(config, Arc::new(MemoryProgressStore::new()));
//!
//!     let items = vec![BatchItem {
//!         file_name: "receipt.pdf".into(),
//!         media_type: "application/pdf".into(),
//!         bytes: std::fs::read("receipt.pdf")?,
//!     }];
//!     let outcome = pipeline.process_batch("owner-1", items, None).await?;
//!     println!("batch {} processed", outcome.progress_id);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `lens` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! ledgerlens = { version = "0.4", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod rates;
pub mod schema;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{
    BatchItem, BatchOutcome, DocumentPipeline, ExtractionContext, ItemOutcome,
    BATCH_PROGRESS_KIND,
};
pub use config::{ProcessingConfig, ProcessingConfigBuilder};
pub use error::{ItemError, LedgerLensError};
pub use pipeline::preview::{Preview, PreviewConverter, PREVIEW_CONTENT_TYPE, PREVIEW_FORMAT};
pub use progress::{
    ItemReport, ItemStatus, MemoryProgressStore, ProgressEvent, ProgressPatch, ProgressRecord,
    ProgressSnapshot, ProgressStore, ProgressStream, ProgressTracker,
};
pub use rates::cache::{SweeperHandle, TimedCache};
pub use rates::{CachedRateResolver, ExchangeRateResolver, RateKey, RateLookup};
pub use schema::{build_schema, render_prompt, FieldDescriptor, FieldKind};
