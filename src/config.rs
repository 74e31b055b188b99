//! This module provides functionality for loading and handling grept's configuration.
//!
//! It defines the `GreptConfig` struct, which holds the configuration parameters,
//! and a `load_config` function to load the configuration from a YAML file.
//! Every field has a default, so a missing file or a partial file is fine.
//!
//! # Examples
//!
//! ```no_run
//! use grept::config::load_config;
//!
//! let config = load_config("/path/to/config.yaml".as_ref()).unwrap();
//! println!("{:?}", config);
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::RetryPolicy;
use crate::error::Result;
use crate::tokens::max_input_tokens;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "GREPT_CONFIG";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with following attributes: \
extremely succinct, truthful, dont make stuff up, answer in the context of the provided code.\n";

/// Represents grept's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct GreptConfig {
    /// Credential for the completion service. Comes from the command line or
    /// `OPENAI_API_KEY`, never from the file.
    #[serde(skip)]
    pub api_key: Option<String>,

    /// The base URL of the API.
    pub api_base: String,

    /// The name of the model to be used for generating responses.
    pub model: String,

    /// Overrides the model's known input limit.
    pub context_max_tokens: Option<usize>,

    /// Stream replies fragment by fragment. Defaults to true.
    pub should_stream: Option<bool>,

    /// Attempts per question before the turn fails.
    pub max_retries: u32,

    pub retry_delay_ms: u64,

    pub request_timeout_secs: u64,

    pub system_prompt: String,

    /// Token size of the fragments written by `--ingest`.
    pub chunk_tokens: usize,
}

impl Default for GreptConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo-16k".to_string(),
            context_max_tokens: None,
            should_stream: None,
            max_retries: 2,
            retry_delay_ms: 1000,
            request_timeout_secs: 120,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            chunk_tokens: 256,
        }
    }
}

impl GreptConfig {
    /// Input limit the token budget is checked against.
    pub fn hard_max(&self) -> usize {
        self.context_max_tokens
            .unwrap_or_else(|| max_input_tokens(&self.model))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(self)
    }
}

/// Loads grept's configuration from a YAML file.
///
/// A file that does not exist yields [`GreptConfig::default`].
///
/// # Errors
///
/// - [`GreptError::Io`](crate::error::GreptError::Io) when the file exists but cannot be read.
/// - [`GreptError::Config`](crate::error::GreptError::Config) when it is not valid YAML for `GreptConfig`.
pub fn load_config(file: &Path) -> Result<GreptConfig> {
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("no config at {}, using defaults", file.display());
            return Ok(GreptConfig::default());
        }
        Err(err) => return Err(err.into()),
    };
    info!("loading config from {}", file.display());
    if content.trim().is_empty() {
        return Ok(GreptConfig::default());
    }
    let config: GreptConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
