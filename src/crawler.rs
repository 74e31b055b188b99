//! # File crawler
//!
//! Walks the roots given on the command line and collects the files that
//! should be fed to the model.
//!
//! Rules, in the order they are applied to each path:
//!
//! - symbolic links are skipped silently (never followed);
//! - directories whose name starts with `.` are not entered;
//! - a regular file is kept when it is not executable, its extension passes
//!   the suffix filter (an empty filter passes everything) and it is not in
//!   the ignore set;
//! - anything else, or anything whose metadata cannot be read, is reported as
//!   a crawl warning and skipped.
//!
//! Traversal is a `walkdir` walk per root, bounded at `max_depth`, so
//! `max_depth = 1` means "direct entries of each root only". The result is a
//! [`BTreeSet`], so the same tree always yields the same, sorted, file list.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{GreptError, Result};
use crate::observer::{Notice, Observer};

/// Name of the ignore file looked up in the working directory.
pub const IGNORE_FILE: &str = ".greptignore";

/// What to crawl and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlConfig {
    roots: Vec<PathBuf>,
    max_depth: usize,
    suffixes: BTreeSet<String>,
    ignore: BTreeSet<PathBuf>,
}

impl CrawlConfig {
    /// Build a crawl configuration.
    ///
    /// Suffixes may be given with or without the leading dot. Ignore entries
    /// are matched against crawled paths after dropping `.` components.
    ///
    /// # Errors
    /// [`GreptError::Validation`] when `max_depth` is 0 or no root is given.
    pub fn new<P, S, I>(roots: Vec<P>, max_depth: usize, suffixes: S, ignore: I) -> Result<Self>
    where
        P: Into<PathBuf>,
        S: IntoIterator,
        S::Item: AsRef<str>,
        I: IntoIterator,
        I::Item: AsRef<Path>,
    {
        if max_depth < 1 {
            return Err(GreptError::Validation(
                "level must be greater than 0".to_string(),
            ));
        }
        let roots: Vec<PathBuf> = roots.into_iter().map(Into::into).collect();
        if roots.is_empty() {
            return Err(GreptError::Validation("no files specified".to_string()));
        }
        let suffixes = suffixes
            .into_iter()
            .map(|s| s.as_ref().trim_start_matches('.').to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let ignore = ignore
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .collect();

        Ok(Self {
            roots,
            max_depth,
            suffixes,
            ignore,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Whether a regular, non-executable file at `path` passes the suffix
    /// filter and the ignore set.
    pub fn accepts(&self, path: &Path) -> bool {
        let suffix_ok = self.suffixes.is_empty()
            || path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| self.suffixes.contains(ext));
        suffix_ok && !self.ignore.contains(&normalize(path))
    }
}

/// Crawl every root of `config` and return the accepted files.
pub fn crawl(config: &CrawlConfig, observer: &mut dyn Observer) -> BTreeSet<PathBuf> {
    let mut files = BTreeSet::new();
    for root in &config.roots {
        walk_root(config, root, &mut files, observer);
    }
    debug!("crawl found {} file(s)", files.len());
    files
}

fn walk_root(
    config: &CrawlConfig,
    root: &Path,
    files: &mut BTreeSet<PathBuf>,
    observer: &mut dyn Observer,
) {
    let walker = WalkDir::new(root)
        .max_depth(config.max_depth)
        .follow_links(false)
        .follow_root_links(false)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && is_hidden(entry.path())));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().unwrap_or(root).to_path_buf();
                warn_unreadable(&path, &err.to_string(), observer);
                continue;
            }
        };
        let path = entry.path();
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            debug!("skipping symlink {}", path.display());
        } else if file_type.is_file() {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn_unreadable(path, &err.to_string(), observer);
                    continue;
                }
            };
            if is_executable(&metadata) {
                debug!("skipping executable {}", path.display());
                continue;
            }
            if config.accepts(path) && files.insert(path.to_path_buf()) {
                observer.notice(Notice::FileFound { path });
            }
        } else if !file_type.is_dir() {
            warn_unreadable(path, "not a regular file or directory", observer);
        }
    }
}

fn warn_unreadable(path: &Path, reason: &str, observer: &mut dyn Observer) {
    warn!("could not read {}: {reason}", path.display());
    observer.notice(Notice::CrawlWarning { path, reason });
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// Drop `.` components so `./src/a.rs` and `src/a.rs` compare equal.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Read the ignore file at `path`.
///
/// One path per line; blank lines and lines starting with `#` are skipped. A
/// missing file is an empty ignore list.
pub fn load_ignore_file(path: &Path) -> Result<Vec<PathBuf>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}
