//! Per-document pipeline stages.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. switch the rasterisation backend) without
//! touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! persist ──▶ preview ──▶ extract
//! (original)  (artifacts) (structured fields)
//! ```
//!
//! 1. [`persist`] — write the uploaded original under the owner's
//!    document directory (atomic temp-file + rename)
//! 2. [`preview`] — produce normalised visual artifacts; pdfium work runs
//!    in `spawn_blocking` because it is CPU-bound and not async-safe
//! 3. [`extract`] — drive the vision-model call with retry/backoff; the
//!    only stage with network I/O
//!
//! The fan-out across a batch's items lives in [`crate::batch`]; these
//! stages know nothing about progress accounting.

pub mod extract;
pub mod persist;
pub mod preview;
