//! # Errors
//!
//! A single error type for the whole crate. Each variant maps to one failure
//! site.
//!
//! Advisory conditions (unreadable paths, token budget pressure) are not
//! errors; they are reported through [`crate::observer::Observer`].

use async_openai::error::OpenAIError;
use thiserror::Error;

/// Everything that can go wrong inside grept.
#[derive(Debug, Error)]
pub enum GreptError {
    /// Bad command line or configuration values.
    #[error("{0}")]
    Validation(String),

    /// The crawl produced no files to talk about.
    #[error("no files found")]
    NoFiles,

    /// No API key was supplied for the completion service.
    #[error("OPENAI_API_KEY not found in environment")]
    Credential,

    /// Every attempt at the completion service failed.
    #[error("completion failed after {attempts} attempt(s): {message}")]
    Service { attempts: u32, message: String },

    /// Error reported by the OpenAI client (request building or transport).
    #[error(transparent)]
    Api(#[from] OpenAIError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    /// The similarity store could not be loaded, built or queried.
    #[error("similarity store: {0}")]
    Store(String),

    /// The embedding model failed to load or run.
    #[error("embedding: {0}")]
    Embedding(String),

    #[error("tokenizer: {0}")]
    Tokenizer(String),

    /// A message was appended out of turn order.
    #[error("conversation: {0}")]
    Conversation(&'static str),

    #[error("input: {0}")]
    Readline(#[from] rustyline::error::ReadlineError),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GreptError>;
