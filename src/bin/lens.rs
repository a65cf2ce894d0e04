//! CLI binary for ledgerlens.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ProcessingConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use ledgerlens::{
    BatchItem, CachedRateResolver, DocumentPipeline, ItemStatus, MemoryProgressStore,
    ProcessingConfig, ProgressEvent, BATCH_PROGRESS_KIND,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

// ── CLI definition ───────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "lens",
    version,
    about = "Document previews, extraction batches, and exchange rates"
)]
struct Cli {
    /// Root directory for originals and preview artifacts
    #[arg(long, default_value = "./data", global = true)]
    data_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert one document into preview artifacts
    Preview {
        /// Source document
        file: PathBuf,
        /// Declared media type; guessed from the extension when omitted
        #[arg(long)]
        media_type: Option<String>,
        /// Owner namespace for the artifact directory
        #[arg(long, default_value = "local")]
        owner: String,
    },
    /// Resolve an exchange rate for a currency pair and date
    Rate {
        from: String,
        to: String,
        /// ISO date, e.g. 2024-03-01
        date: String,
    },
    /// Run a processing batch over local files, streaming live progress
    Batch {
        /// Documents to process
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = "local")]
        owner: String,
    },
}

fn guess_media_type(path: &Path) -> String {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf".to_string(),
        Some("png") => "image/png".to_string(),
        Some("jpg") | Some("jpeg") => "image/jpeg".to_string(),
        Some("webp") => "image/webp".to_string(),
        Some("gif") => "image/gif".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ProcessingConfig::builder()
        .data_root(&cli.data_root)
        .build()?;

    match cli.command {
        Command::Preview {
            file,
            media_type,
            owner,
        } => run_preview(config, &file, media_type, &owner).await,
        Command::Rate { from, to, date } => run_rate(config, &from, &to, &date).await,
        Command::Batch { files, owner } => run_batch(config, files, &owner).await,
    }
}

async fn run_preview(
    config: ProcessingConfig,
    file: &Path,
    media_type: Option<String>,
    owner: &str,
) -> Result<()> {
    let media_type = media_type.unwrap_or_else(|| guess_media_type(file));
    let pipeline = DocumentPipeline::new(config, Arc::new(MemoryProgressStore::new()));

    let preview = pipeline
        .converter()
        .produce(owner, file, &media_type)
        .await
        .with_context(|| format!("converting '{}'", file.display()))?;

    println!("{} ({})", green("converted"), preview.content_type);
    for (index, path) in preview.paths.iter().enumerate() {
        println!("  {} {}", dim(&format!("[{index}]")), path.display());
    }
    Ok(())
}

async fn run_rate(config: ProcessingConfig, from: &str, to: &str, date: &str) -> Result<()> {
    let resolver = CachedRateResolver::new(&config)?;
    let lookup = resolver
        .lookup(from, to, date)
        .await
        .with_context(|| format!("resolving {from}->{to} for {date}"))?;

    let suffix = if lookup.cached { dim("(cached)") } else { String::new() };
    println!(
        "1 {} = {} {} on {} {}",
        from.to_uppercase(),
        lookup.rate,
        to.to_uppercase(),
        date,
        suffix
    );
    Ok(())
}

async fn run_batch(config: ProcessingConfig, files: Vec<PathBuf>, owner: &str) -> Result<()> {
    let mut items = Vec::with_capacity(files.len());
    for file in &files {
        let bytes =
            std::fs::read(file).with_context(|| format!("reading '{}'", file.display()))?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("file has no name")?;
        items.push(BatchItem {
            media_type: guess_media_type(file),
            file_name,
            bytes,
        });
    }

    let pipeline = Arc::new(DocumentPipeline::new(config, Arc::new(MemoryProgressStore::new())));
    let progress_id = uuid::Uuid::new_v4().to_string();

    // Subscribe before the first orchestration step: the record is created
    // by whichever side gets there first.
    let mut progress = pipeline
        .tracker()
        .subscribe(owner, &progress_id, BATCH_PROGRESS_KIND)
        .await;

    let bar = ProgressBar::new(items.len() as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:42.green/238}] {pos:>3}/{len} documents  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );

    let runner = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        let owner = owner.to_string();
        let progress_id = progress_id.clone();
        async move {
            pipeline
                .process_batch_with_id(&owner, &progress_id, items, None)
                .await
        }
    });

    while let Some(event) = progress.next().await {
        match event {
            ProgressEvent::Snapshot(snapshot) => {
                if snapshot.total > 0 {
                    bar.set_length(snapshot.total as u64);
                }
                bar.set_position(snapshot.current as u64);
            }
            ProgressEvent::Error { error } => {
                bar.println(format!("{} progress stream: {error}", red("✗")));
                break;
            }
        }
    }
    bar.finish_and_clear();

    let outcome = runner.await.context("batch task panicked")??;
    for item in &outcome.outcomes {
        let file = files
            .get(item.item_index)
            .map(|f| f.display().to_string())
            .unwrap_or_default();
        match item.report.status {
            ItemStatus::Succeeded => println!("  {} {}", green("✓"), file),
            ItemStatus::Failed => println!(
                "  {} {} {}",
                red("✗"),
                file,
                dim(item.report.error_kind.as_deref().unwrap_or("unknown"))
            ),
        }
    }
    let failed = outcome
        .outcomes
        .iter()
        .filter(|o| o.report.status == ItemStatus::Failed)
        .count();
    println!(
        "batch {}: {}/{} documents processed",
        outcome.progress_id,
        outcome.total - failed,
        outcome.total
    );
    Ok(())
}
