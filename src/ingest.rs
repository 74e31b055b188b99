//! # Ingestion
//!
//! Builds the similarity index that retrieval mode reads. Every crawled file
//! is stripped of blank lines, prefixed with its `FILE:` header, cut into
//! fragments of at most `chunk_tokens` tokens, embedded and added to a
//! [`VectorStore`], which is then built and written to disk.

use std::fs;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::context::{FileRecord, strip_blank_lines};
use crate::crawler::{CrawlConfig, crawl};
use crate::error::{GreptError, Result};
use crate::observer::{Notice, Observer};
use crate::tokens::TokenBudgeter;
use crate::vector_store::VectorStore;

/// Counts from one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub files: usize,
    pub fragments: usize,
}

/// Crawl, split, embed and save into `dir`.
///
/// # Errors
/// [`GreptError::NoFiles`] when the crawl yields nothing with content, and
/// any embedding or store error.
pub fn ingest(
    crawl_config: &CrawlConfig,
    budgeter: &TokenBudgeter,
    chunk_tokens: usize,
    store: &mut VectorStore,
    dir: &Path,
    observer: &mut dyn Observer,
) -> Result<IngestReport> {
    let paths = crawl(crawl_config, observer);
    if paths.is_empty() {
        return Err(GreptError::NoFiles);
    }

    let progress = ProgressBar::new(paths.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let mut files = 0;
    for path in &paths {
        progress.set_message(path.display().to_string());
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                let reason = err.to_string();
                warn!("could not read file {}: {reason}", path.display());
                observer.notice(Notice::CrawlWarning {
                    path,
                    reason: &reason,
                });
                progress.inc(1);
                continue;
            }
        };

        let text = format!(
            "{}{}",
            FileRecord::header(path),
            strip_blank_lines(&source, false)
        );
        for fragment in budgeter.split(&text, chunk_tokens)? {
            store.add(fragment)?;
        }
        files += 1;
        progress.inc(1);
    }

    if store.is_empty() {
        progress.abandon();
        return Err(GreptError::NoFiles);
    }

    store.build()?;
    store.save(dir)?;
    progress.finish_with_message("done");

    let report = IngestReport {
        files,
        fragments: store.len(),
    };
    info!(
        "ingested {} file(s) as {} fragment(s) into {}",
        report.files,
        report.fragments,
        dir.display()
    );
    observer.notice(Notice::Info(&format!(
        "Indexed {} file(s) as {} fragment(s) in {}",
        report.files,
        report.fragments,
        dir.display()
    )));
    Ok(report)
}
