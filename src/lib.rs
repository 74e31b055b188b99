//! # grept (library root)
//!
//! Ask natural-language questions about local files with an LLM.
//!
//! The crate is the engine behind the `grept` CLI:
//! - Finding files (`crawler`) and counting their tokens (`tokens`).
//! - Choosing what context goes with a question (`context`): whole files, or
//!   fragments retrieved from a similarity index (`vector_store`, built by
//!   `ingest`).
//! - Talking to an OpenAI compatible completion service with retries (`api`).
//! - The interactive loop and its commands (`session`).
//! - Command line parsing (`commands`) and configuration (`config`).
//!
//! Nothing in here prints. Progress, warnings and replies are delivered to an
//! [`observer::Observer`]; the CLI renders them with
//! [`observer::TerminalObserver`].
//!
//! ## Configuration location
//! The YAML config lives under the per-platform configuration directory, e.g.:
//!
//! - macOS: `~/Library/Application Support/com.grept.grept/config.yaml`
//! - Linux (XDG): `~/.config/grept/config.yaml`
//! - Windows: `C:\Users\<you>\AppData\Roaming\grept\grept\config\config.yaml`
//!
//! `GREPT_CONFIG` overrides the path.

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{GreptError, Result};

pub mod api;
pub mod commands;
pub mod config;
pub mod context;
pub mod crawler;
pub mod error;
pub mod ingest;
pub mod message;
pub mod observer;
pub mod session;
pub mod tokens;
pub mod vector_store;

/// Return the per-platform configuration directory used by grept.
///
/// The directory is **not** created by this function.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
///
/// # Examples
/// ```no_run
/// let cfg = grept::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "grept", "grept").ok_or_else(|| {
        GreptError::Validation("Unable to determine config directory".to_string())
    })?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

/// Config file to load: `$GREPT_CONFIG` when set, else `config_dir()/config.yaml`.
pub fn config_path() -> Result<PathBuf> {
    match std::env::var_os(config::CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(config_dir()?.join("config.yaml")),
    }
}
