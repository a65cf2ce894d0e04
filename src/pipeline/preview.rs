//! Preview conversion: normalised visual artifacts for uploaded documents.
//!
//! ## Convert-once via basename-keyed artifacts
//!
//! Artifacts are named deterministically under the owner's preview
//! directory — `<basename>.<page>.jpg` for paginated documents,
//! `<basename>.jpg` for resized raster images — and their existence on
//! disk **is** the cache: there is no metadata record to keep in sync.
//! Any request finding the artifacts returns them unconverted, so a given
//! source is rasterised or resized at most once. Two concurrent requests
//! for the same uncached source may both convert; they write identical
//! bytes to identical names, which is duplicate work but never corruption.
//!
//! ## Why spawn_blocking?
//!
//! pdfium wraps a C++ library with thread-local state that must not run on
//! async worker threads, and image decode/re-encode is CPU-bound. Both
//! branches run under `tokio::task::spawn_blocking` so rendering a fat
//! scan never stalls the runtime's I/O threads.

use crate::config::ProcessingConfig;
use crate::error::LedgerLensError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Artifact extension; part of the on-disk cache-key convention.
pub const PREVIEW_FORMAT: &str = "jpg";

/// Content type of every converted artifact.
pub const PREVIEW_CONTENT_TYPE: &str = "image/jpeg";

/// Content type reported when resize degrades to the unmodified original.
pub const UNKNOWN_CONTENT_TYPE: &str = "application/octet-stream";

/// Result of preview production: one or more artifact paths, in page order.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub content_type: String,
    pub paths: Vec<PathBuf>,
}

/// Converts source documents into cached preview artifacts.
pub struct PreviewConverter {
    previews_root: PathBuf,
    page_width: u32,
    max_pages: usize,
    max_dimension: u32,
    jpeg_quality: u8,
}

impl PreviewConverter {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            previews_root: config.data_root.join("previews"),
            page_width: config.preview_page_width,
            max_pages: config.max_preview_pages,
            max_dimension: config.max_preview_dimension,
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Produce (or reuse) previews for one source document.
    ///
    /// * `application/pdf` — one JPEG per page, capped at the configured
    ///   page count; conversion failure is an error the caller must handle
    ///   per item.
    /// * `image/*` — a single downscaled JPEG; decode or resize failure
    ///   degrades to the original path with an unknown content type.
    /// * anything else — identity pass-through of the original.
    pub async fn produce(
        &self,
        owner_id: &str,
        source_path: &Path,
        media_type: &str,
    ) -> Result<Preview, LedgerLensError> {
        if !source_path.exists() {
            return Err(LedgerLensError::SourceNotFound {
                path: source_path.to_path_buf(),
            });
        }

        if media_type == "application/pdf" {
            self.produce_paginated(owner_id, source_path).await
        } else if media_type.starts_with("image/") {
            self.produce_raster(owner_id, source_path).await
        } else {
            Ok(Preview {
                content_type: media_type.to_string(),
                paths: vec![source_path.to_path_buf()],
            })
        }
    }

    /// Resolve a single preview page.
    ///
    /// An index past the produced count is a "not found" signal, never a
    /// panic: clients routinely probe page N+1 to detect the last page.
    pub async fn page(
        &self,
        owner_id: &str,
        source_path: &Path,
        media_type: &str,
        index: usize,
    ) -> Result<PathBuf, LedgerLensError> {
        let preview = self.produce(owner_id, source_path, media_type).await?;
        preview
            .paths
            .get(index)
            .cloned()
            .ok_or(LedgerLensError::PreviewPageNotFound {
                index,
                available: preview.paths.len(),
            })
    }

    // ── Paginated documents ───────────────────────────────────────────────

    async fn produce_paginated(
        &self,
        owner_id: &str,
        source_path: &Path,
    ) -> Result<Preview, LedgerLensError> {
        let owner_dir = self.ensure_owner_dir(owner_id)?;
        let stem = source_stem(source_path);

        let cached = cached_page_artifacts(&owner_dir, &stem);
        if !cached.is_empty() {
            debug!(
                "Reusing {} cached page previews for '{}'",
                cached.len(),
                source_path.display()
            );
            return Ok(Preview {
                content_type: PREVIEW_CONTENT_TYPE.to_string(),
                paths: cached,
            });
        }

        let path = source_path.to_path_buf();
        let page_width = self.page_width;
        let max_pages = self.max_pages;
        let quality = self.jpeg_quality;

        let paths = tokio::task::spawn_blocking(move || {
            rasterise_pages_blocking(&path, &owner_dir, &stem, page_width, max_pages, quality)
        })
        .await
        .map_err(|e| LedgerLensError::Internal(format!("Rasterise task panicked: {e}")))??;

        info!(
            "Rasterised {} page previews for '{}'",
            paths.len(),
            source_path.display()
        );
        Ok(Preview {
            content_type: PREVIEW_CONTENT_TYPE.to_string(),
            paths,
        })
    }

    // ── Raster images ─────────────────────────────────────────────────────

    async fn produce_raster(
        &self,
        owner_id: &str,
        source_path: &Path,
    ) -> Result<Preview, LedgerLensError> {
        let owner_dir = self.ensure_owner_dir(owner_id)?;
        let stem = source_stem(source_path);
        let artifact = owner_dir.join(format!("{stem}.{PREVIEW_FORMAT}"));

        if artifact.exists() {
            debug!("Reusing cached preview '{}'", artifact.display());
            return Ok(Preview {
                content_type: PREVIEW_CONTENT_TYPE.to_string(),
                paths: vec![artifact],
            });
        }

        let path = source_path.to_path_buf();
        let target = artifact.clone();
        let max_dimension = self.max_dimension;
        let quality = self.jpeg_quality;

        let resized = tokio::task::spawn_blocking(move || {
            resize_image_blocking(&path, &target, max_dimension, quality)
        })
        .await
        .map_err(|e| LedgerLensError::Internal(format!("Resize task panicked: {e}")))?;

        match resized {
            Ok(()) => Ok(Preview {
                content_type: PREVIEW_CONTENT_TYPE.to_string(),
                paths: vec![artifact],
            }),
            Err(detail) => {
                // Graceful degradation: serve the unmodified original
                // rather than failing the whole request.
                warn!(
                    "Image preview failed for '{}' ({}); serving original",
                    source_path.display(),
                    detail
                );
                Ok(Preview {
                    content_type: UNKNOWN_CONTENT_TYPE.to_string(),
                    paths: vec![source_path.to_path_buf()],
                })
            }
        }
    }

    /// Directory creation is a hard precondition: if it fails, no partial
    /// artifact is ever written.
    fn ensure_owner_dir(&self, owner_id: &str) -> Result<PathBuf, LedgerLensError> {
        let owner_dir = self.previews_root.join(owner_id);
        std::fs::create_dir_all(&owner_dir).map_err(|e| LedgerLensError::PreviewDirFailed {
            path: owner_dir.clone(),
            source: e,
        })?;
        Ok(owner_dir)
    }
}

/// Basename of the source, the key of the artifact-name convention.
fn source_stem(source_path: &Path) -> String {
    source_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

/// Collect consecutive `<stem>.<i>.jpg` artifacts starting at page 0.
///
/// Consecutive-from-zero is the invariant the writer upholds, so a gap
/// means "end of document", not a hole to repair.
fn cached_page_artifacts(owner_dir: &Path, stem: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for index in 0.. {
        let candidate = owner_dir.join(format!("{stem}.{index}.{PREVIEW_FORMAT}"));
        if !candidate.exists() {
            break;
        }
        paths.push(candidate);
    }
    paths
}

/// Rasterise up to `max_pages` pages to JPEG artifacts. Blocking.
fn rasterise_pages_blocking(
    source_path: &Path,
    owner_dir: &Path,
    stem: &str,
    page_width: u32,
    max_pages: usize,
    quality: u8,
) -> Result<Vec<PathBuf>, LedgerLensError> {
    let bindings = Pdfium::bind_to_system_library()
        .map_err(|e| LedgerLensError::PdfiumBindingFailed(format!("{e:?}")))?;
    let pdfium = Pdfium::new(bindings);

    let document = pdfium.load_pdf_from_file(source_path, None).map_err(|e| {
        LedgerLensError::ConversionFailed {
            path: source_path.to_path_buf(),
            detail: format!("{e:?}"),
        }
    })?;

    let pages = document.pages();
    let page_count = (pages.len() as usize).min(max_pages);
    debug!(
        "Rasterising {} of {} pages from '{}'",
        page_count,
        pages.len(),
        source_path.display()
    );

    let render_config = PdfRenderConfig::new().set_target_width(page_width as i32);

    let mut paths = Vec::with_capacity(page_count);
    for index in 0..page_count {
        let page = pages
            .get(index as u16)
            .map_err(|e| LedgerLensError::ConversionFailed {
                path: source_path.to_path_buf(),
                detail: format!("page {index}: {e:?}"),
            })?;
        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| LedgerLensError::ConversionFailed {
                    path: source_path.to_path_buf(),
                    detail: format!("page {index}: {e:?}"),
                })?;
        let image = bitmap.as_image();

        let artifact = owner_dir.join(format!("{stem}.{index}.{PREVIEW_FORMAT}"));
        write_jpeg(&image, &artifact, quality)?;
        paths.push(artifact);
    }

    Ok(paths)
}

/// Downscale to fit `max_dimension` and re-encode as JPEG. Blocking.
///
/// Returns a plain detail string on failure so the caller can degrade
/// without wrapping a fatal error type around a recoverable condition.
fn resize_image_blocking(
    source_path: &Path,
    artifact: &Path,
    max_dimension: u32,
    quality: u8,
) -> Result<(), String> {
    let img = image::open(source_path).map_err(|e| format!("decode: {e}"))?;

    let img = if img.width() > max_dimension || img.height() > max_dimension {
        img.thumbnail(max_dimension, max_dimension)
    } else {
        img
    };

    write_jpeg(&img, artifact, quality).map_err(|e| e.to_string())
}

/// Encode to an in-memory JPEG, then write in a single call so concurrent
/// writers of the same artifact land identical bytes.
fn write_jpeg(image: &DynamicImage, path: &Path, quality: u8) -> Result<(), LedgerLensError> {
    let mut buf = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut buf), quality);
    image
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| LedgerLensError::ConversionFailed {
            path: path.to_path_buf(),
            detail: format!("jpeg encode: {e}"),
        })?;
    std::fs::write(path, &buf).map_err(|e| LedgerLensError::ConversionFailed {
        path: path.to_path_buf(),
        detail: format!("write: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn converter(root: &Path) -> PreviewConverter {
        let config = ProcessingConfig::builder()
            .data_root(root)
            .max_preview_dimension(100)
            .build()
            .unwrap();
        PreviewConverter::new(&config)
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb([200, 120, 40]),
        ));
        img.save_with_format(path, image::ImageFormat::Png).unwrap();
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let c = converter(dir.path());
        let err = c
            .produce("o", &dir.path().join("absent.png"), "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerLensError::SourceNotFound { .. }));
    }

    #[tokio::test]
    async fn passthrough_for_unknown_media_types() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, "plain text").unwrap();

        let c = converter(dir.path());
        let preview = c.produce("o", &source, "text/plain").await.unwrap();
        assert_eq!(preview.content_type, "text/plain");
        assert_eq!(preview.paths, vec![source]);
    }

    #[tokio::test]
    async fn raster_is_downscaled_and_named_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("photo.png");
        write_png(&source, 400, 200);

        let c = converter(dir.path());
        let preview = c.produce("alice", &source, "image/png").await.unwrap();

        assert_eq!(preview.content_type, PREVIEW_CONTENT_TYPE);
        let expected = dir.path().join("previews/alice/photo.jpg");
        assert_eq!(preview.paths, vec![expected.clone()]);

        let resized = image::open(&expected).unwrap();
        assert_eq!(resized.width(), 100, "long edge fits max dimension");
        assert_eq!(resized.height(), 50, "aspect ratio preserved");
    }

    #[tokio::test]
    async fn small_raster_is_reencoded_not_upscaled() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tiny.png");
        write_png(&source, 40, 30);

        let c = converter(dir.path());
        let preview = c.produce("o", &source, "image/png").await.unwrap();
        let artifact = image::open(&preview.paths[0]).unwrap();
        assert_eq!((artifact.width(), artifact.height()), (40, 30));
    }

    #[tokio::test]
    async fn second_conversion_reuses_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("photo.png");
        write_png(&source, 400, 200);

        let c = converter(dir.path());
        let first = c.produce("o", &source, "image/png").await.unwrap();

        // Replace the artifact with marker bytes: a second call must serve
        // it from disk rather than re-running the resizer.
        std::fs::write(&first.paths[0], b"marker").unwrap();
        let second = c.produce("o", &source, "image/png").await.unwrap();
        assert_eq!(second.paths, first.paths);
        assert_eq!(std::fs::read(&second.paths[0]).unwrap(), b"marker");
    }

    #[tokio::test]
    async fn corrupt_image_degrades_to_original() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.png");
        std::fs::write(&source, b"not an image at all").unwrap();

        let c = converter(dir.path());
        let preview = c.produce("o", &source, "image/png").await.unwrap();
        assert_eq!(preview.content_type, UNKNOWN_CONTENT_TYPE);
        assert_eq!(preview.paths, vec![source]);
    }

    #[tokio::test]
    async fn cached_pdf_pages_are_served_without_pdfium() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("invoice.pdf");
        std::fs::write(&source, b"%PDF-1.4 stub").unwrap();

        // Pre-materialise page artifacts under the convention.
        let owner_dir = dir.path().join("previews/o");
        std::fs::create_dir_all(&owner_dir).unwrap();
        std::fs::write(owner_dir.join("invoice.0.jpg"), b"p0").unwrap();
        std::fs::write(owner_dir.join("invoice.1.jpg"), b"p1").unwrap();

        let c = converter(dir.path());
        let preview = c.produce("o", &source, "application/pdf").await.unwrap();
        assert_eq!(preview.content_type, PREVIEW_CONTENT_TYPE);
        assert_eq!(
            preview.paths,
            vec![
                owner_dir.join("invoice.0.jpg"),
                owner_dir.join("invoice.1.jpg")
            ]
        );
    }

    #[tokio::test]
    async fn page_index_past_count_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("invoice.pdf");
        std::fs::write(&source, b"%PDF-1.4 stub").unwrap();

        let owner_dir = dir.path().join("previews/o");
        std::fs::create_dir_all(&owner_dir).unwrap();
        std::fs::write(owner_dir.join("invoice.0.jpg"), b"p0").unwrap();

        let c = converter(dir.path());
        assert!(c.page("o", &source, "application/pdf", 0).await.is_ok());
        let err = c
            .page("o", &source, "application/pdf", 3)
            .await
            .unwrap_err();
        match err {
            LedgerLensError::PreviewPageNotFound { index, available } => {
                assert_eq!((index, available), (3, 1));
            }
            other => panic!("expected PreviewPageNotFound, got {other:?}"),
        }
    }
}
