//! Error types for the ledgerlens library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`LedgerLensError`] — **Fatal**: the request cannot proceed at all
//!   (bad parameters, missing source file, no rate from any provider).
//!   Returned as `Err(LedgerLensError)` from the top-level APIs.
//!
//! * [`ItemError`] — **Non-fatal**: a single batch item failed (corrupt
//!   document, extraction glitch) but its siblings are fine. Folded into
//!   the batch's progress record so subscribers can observe partial
//!   failure rather than losing the whole batch to one bad document.
//!
//! The separation lets callers decide their own tolerance: surface the
//! first item failure, log and continue, or collect all failed items for
//! a post-run report.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the ledgerlens library.
///
/// Item-level failures use [`ItemError`] and are recorded in the batch's
/// progress data rather than propagated here.
#[derive(Debug, Error)]
pub enum LedgerLensError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// A request parameter is missing or malformed.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// A currency code is not three ASCII letters.
    #[error("Invalid currency code '{code}': expected a 3-letter ISO code like 'USD'")]
    InvalidCurrency { code: String },

    /// A date string does not parse as an ISO calendar date.
    #[error("Invalid date '{input}': expected YYYY-MM-DD")]
    InvalidDate { input: String },

    /// A file name would escape the owner's directory.
    #[error("Unsafe file name '{name}': path separators and '..' are not allowed")]
    UnsafeFileName { name: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Not-found errors ──────────────────────────────────────────────────
    /// Source document was not found at the given path.
    #[error("Source document not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// A preview page index past the number of produced previews.
    #[error("Preview page {index} not found ({available} pages available)")]
    PreviewPageNotFound { index: usize, available: usize },

    /// No progress record with this id is visible to the caller.
    #[error("Progress record '{id}' not found")]
    ProgressNotFound { id: String },

    /// Every rate provider was tried and none produced a rate.
    ///
    /// Distinct from a legitimate zero rate — callers must never treat a
    /// missing rate as `0.0`.
    #[error("No exchange rate found for {from}->{to} on {date}")]
    RateNotFound {
        from: String,
        to: String,
        date: String,
    },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// Paginated-document rasterisation failed (corrupt or unreadable file).
    #[error("Preview conversion failed for '{path}': {detail}")]
    ConversionFailed { path: PathBuf, detail: String },

    /// The owner's preview directory could not be created.
    ///
    /// Directory creation is a hard precondition: no partial artifact is
    /// written when it fails.
    #[error("Failed to create preview directory '{path}': {source}")]
    PreviewDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Install pdfium or set PDFIUM_DYNAMIC_LIB_PATH to an existing copy."
    )]
    PdfiumBindingFailed(String),

    // ── Upstream errors ───────────────────────────────────────────────────
    /// The configured extraction provider is not initialised (missing API key etc.).
    #[error("Extraction provider '{provider}' is not configured.\n{hint}")]
    ExtractorNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not persist an uploaded original.
    #[error("Failed to write document '{path}': {source}")]
    PersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerLensError {
    /// Whether this error is user-correctable (bad input) rather than a
    /// server-side failure. Transports map this to a 4xx/5xx split.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            LedgerLensError::InvalidParameter { .. }
                | LedgerLensError::InvalidCurrency { .. }
                | LedgerLensError::InvalidDate { .. }
                | LedgerLensError::UnsafeFileName { .. }
                | LedgerLensError::InvalidConfig(_)
        )
    }
}

/// A non-fatal error for a single batch item.
///
/// Recorded in the batch's progress data when an item fails. The overall
/// batch always runs to completion: every item increments progress exactly
/// once, failed or not.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ItemError {
    /// Persisting the uploaded original failed.
    #[error("Item {index}: persist failed: {detail}")]
    Persist { index: usize, detail: String },

    /// Preview conversion failed (corrupt or unsupported document).
    #[error("Item {index}: conversion failed: {detail}")]
    Conversion { index: usize, detail: String },

    /// Structured extraction failed after retries.
    #[error("Item {index}: extraction failed after {retries} retries: {detail}")]
    Extraction {
        index: usize,
        retries: u8,
        detail: String,
    },
}

impl ItemError {
    /// Stable machine-readable kind, stored in per-item progress reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Persist { .. } => "persist",
            ItemError::Conversion { .. } => "conversion",
            ItemError::Extraction { .. } => "extraction",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_not_found_display() {
        let e = LedgerLensError::RateNotFound {
            from: "CHF".into(),
            to: "EUR".into(),
            date: "2024-03-01".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("CHF->EUR"), "got: {msg}");
        assert!(msg.contains("2024-03-01"));
    }

    #[test]
    fn user_error_split() {
        assert!(LedgerLensError::InvalidCurrency { code: "x".into() }.is_user_error());
        assert!(!LedgerLensError::RateNotFound {
            from: "A".into(),
            to: "B".into(),
            date: "d".into()
        }
        .is_user_error());
        assert!(!LedgerLensError::Internal("boom".into()).is_user_error());
    }

    #[test]
    fn item_error_kinds_are_stable() {
        let e = ItemError::Conversion {
            index: 2,
            detail: "bad header".into(),
        };
        assert_eq!(e.kind(), "conversion");
        assert!(e.to_string().contains("Item 2"));

        let e = ItemError::Extraction {
            index: 0,
            retries: 3,
            detail: "timeout".into(),
        };
        assert_eq!(e.kind(), "extraction");
        assert!(e.to_string().contains("3 retries"));
    }
}
