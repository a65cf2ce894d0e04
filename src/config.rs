//! Configuration for the document-processing subsystem.
//!
//! All behaviour is controlled through [`ProcessingConfig`], built via its
//! [`ProcessingConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, serialise them for logging, and
//! diff two runs to understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A twenty-field constructor is unreadable and breaks on every new field.
//! The builder pattern lets callers set only what they care about and rely
//! on well-documented defaults for the rest.

use crate::error::LedgerLensError;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the document pipeline, progress streaming, and rate
/// resolution.
///
/// Built via [`ProcessingConfig::builder()`] or using
/// [`ProcessingConfig::default()`].
///
/// # Example
/// ```rust
/// use ledgerlens::ProcessingConfig;
///
/// let config = ProcessingConfig::builder()
///     .data_root("/var/lib/ledgerlens")
///     .concurrency(8)
///     .jpeg_quality(85)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ProcessingConfig {
    /// Root directory for persisted originals and preview artifacts.
    /// Default: `./data`.
    ///
    /// Originals land under `<root>/documents/<owner>/`, previews under
    /// `<root>/previews/<owner>/`. The per-owner preview directory name
    /// convention is load-bearing: artifact file names are the cache keys.
    pub data_root: PathBuf,

    /// Target pixel width when rasterising a document page. Default: 1240.
    ///
    /// 1240 px is wide enough for a receipt or invoice to stay legible on a
    /// retina display and for a vision model to read line items, while
    /// keeping artifact files in the low hundreds of kilobytes.
    pub preview_page_width: u32,

    /// Maximum number of pages rasterised per document. Default: 10.
    ///
    /// Uploaded expense documents are overwhelmingly 1–3 pages. The cap
    /// bounds conversion time and disk use when someone uploads a 300-page
    /// PDF by mistake; pages past the cap are simply not previewed.
    pub max_preview_pages: usize,

    /// Maximum preview dimension (width or height) for raster uploads.
    /// Default: 1600.
    ///
    /// Phone photos arrive at 4000+ px. Downscaling to fit 1600 px keeps
    /// aspect ratio, cuts artifact size roughly tenfold, and still leaves
    /// enough resolution for extraction.
    pub max_preview_dimension: u32,

    /// JPEG quality for preview artifacts, 1–100. Default: 80.
    pub jpeg_quality: u8,

    /// Number of batch items processed concurrently. Default: 4.
    ///
    /// Conversion and extraction are I/O-bound; fanning out across items
    /// cuts batch wall-clock time without external locking because progress
    /// increments are commutative.
    pub concurrency: usize,

    /// LLM model identifier, e.g. "gpt-4.1-nano". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic"). If None along with
    /// `provider`, extraction is unavailable unless auto-detected from env.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for extraction completions. Default: 0.0.
    ///
    /// Extraction is transcription, not generation: the model should report
    /// exactly what the document says. Zero temperature keeps it faithful.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per document. Default: 4096.
    pub max_tokens: usize,

    /// Maximum retry attempts on a transient extraction failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s. Exponential backoff
    /// avoids the thundering-herd problem where N concurrent workers retry
    /// simultaneously against a recovering API endpoint.
    pub retry_backoff_ms: u64,

    /// Custom extraction prompt template. If None, uses the built-in default.
    /// See [`crate::schema`] for the recognised placeholders.
    pub extraction_template: Option<String>,

    /// Interval between progress-store polls per subscriber. Default: 2 s.
    ///
    /// The backing store has no change notification, so the stream is
    /// diff-on-timer: a subscriber sees a change at most one interval after
    /// the write. Lowering this trades store reads for latency.
    pub poll_interval: Duration,

    /// How long a resolved exchange rate stays cached. Default: 1 hour.
    ///
    /// A `(from, to, date)` rate is an immutable historical fact; the TTL
    /// exists only to bound memory, not because entries go stale.
    pub rate_cache_ttl: Duration,

    /// Interval of the cache's background sweep. Default: 10 minutes.
    pub rate_sweep_period: Duration,

    /// Base URL of the primary (JSON, date-ranged) rate provider.
    /// Default: `https://api.frankfurter.app`.
    pub primary_rate_base_url: String,

    /// URL template of the fallback (HTML) rate provider. `{from}` and
    /// `{date}` are substituted before the request.
    pub fallback_rate_url: String,

    /// Per-HTTP-call timeout for rate providers, in seconds. Default: 20.
    pub http_timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            preview_page_width: 1240,
            max_preview_pages: 10,
            max_preview_dimension: 1600,
            jpeg_quality: 80,
            concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            extraction_template: None,
            poll_interval: Duration::from_secs(2),
            rate_cache_ttl: Duration::from_secs(60 * 60),
            rate_sweep_period: Duration::from_secs(10 * 60),
            primary_rate_base_url: "https://api.frankfurter.app".to_string(),
            fallback_rate_url: "https://www.x-rates.com/historical/?from={from}&amount=1&date={date}"
                .to_string(),
            http_timeout_secs: 20,
        }
    }
}

impl fmt::Debug for ProcessingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingConfig")
            .field("data_root", &self.data_root)
            .field("preview_page_width", &self.preview_page_width)
            .field("max_preview_pages", &self.max_preview_pages)
            .field("max_preview_dimension", &self.max_preview_dimension)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("max_retries", &self.max_retries)
            .field("poll_interval", &self.poll_interval)
            .field("rate_cache_ttl", &self.rate_cache_ttl)
            .field("primary_rate_base_url", &self.primary_rate_base_url)
            .finish()
    }
}

impl ProcessingConfig {
    /// Create a new builder for `ProcessingConfig`.
    pub fn builder() -> ProcessingConfigBuilder {
        ProcessingConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory holding one owner's persisted originals.
    pub fn documents_dir(&self, owner_id: &str) -> PathBuf {
        self.data_root.join("documents").join(owner_id)
    }

    /// Directory holding one owner's preview artifacts.
    pub fn previews_dir(&self, owner_id: &str) -> PathBuf {
        self.data_root.join("previews").join(owner_id)
    }
}

/// Builder for [`ProcessingConfig`].
#[derive(Debug)]
pub struct ProcessingConfigBuilder {
    config: ProcessingConfig,
}

impl ProcessingConfigBuilder {
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.data_root = root.into();
        self
    }

    pub fn preview_page_width(mut self, px: u32) -> Self {
        self.config.preview_page_width = px.clamp(200, 4000);
        self
    }

    pub fn max_preview_pages(mut self, n: usize) -> Self {
        self.config.max_preview_pages = n.max(1);
        self
    }

    pub fn max_preview_dimension(mut self, px: u32) -> Self {
        self.config.max_preview_dimension = px.max(100);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
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

    pub fn extraction_template(mut self, template: impl Into<String>) -> Self {
        self.config.extraction_template = Some(template.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn rate_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.rate_cache_ttl = ttl;
        self
    }

    pub fn rate_sweep_period(mut self, period: Duration) -> Self {
        self.config.rate_sweep_period = period;
        self
    }

    pub fn primary_rate_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.primary_rate_base_url = url.into();
        self
    }

    pub fn fallback_rate_url(mut self, url: impl Into<String>) -> Self {
        self.config.fallback_rate_url = url.into();
        self
    }

    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProcessingConfig, LedgerLensError> {
        let c = &self.config;
        if c.jpeg_quality == 0 || c.jpeg_quality > 100 {
            return Err(LedgerLensError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.jpeg_quality
            )));
        }
        if c.concurrency == 0 {
            return Err(LedgerLensError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.poll_interval.is_zero() {
            return Err(LedgerLensError::InvalidConfig(
                "Poll interval must be non-zero".into(),
            ));
        }
        Ok(self.config)
    }
}
