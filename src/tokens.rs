//! # Token budget
//!
//! Counts tokens with the tiktoken vocabulary of the completion model and
//! compares running totals against the model's input limit.
//!
//! The budgeter never truncates anything. When the direct context gets within
//! [`BUDGET_MARGIN`] tokens of the limit, callers emit an advisory and carry on.

use tiktoken_rs::{CoreBPE, Rank, cl100k_base, get_bpe_from_model};
use tracing::debug;

use crate::error::{GreptError, Result};

/// Distance from the hard max at which the budget warning fires.
pub const BUDGET_MARGIN: usize = 1000;

/// Limit assumed for models missing from [`MAX_INPUT_TOKENS`].
pub const DEFAULT_MAX_INPUT_TOKENS: usize = 4096;

/// Documented input limits of the models grept knows about.
pub const MAX_INPUT_TOKENS: &[(&str, usize)] = &[
    ("gpt-3.5-turbo-16k", 16384),
    ("gpt-3.5-turbo", 4096),
    ("gpt-4", 8192),
    ("gpt-4-32k", 32768),
];

/// Input limit for `model`, or [`DEFAULT_MAX_INPUT_TOKENS`] when unknown.
pub fn max_input_tokens(model: &str) -> usize {
    MAX_INPUT_TOKENS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, max)| *max)
        .unwrap_or(DEFAULT_MAX_INPUT_TOKENS)
}

/// Token counter bound to one model's vocabulary and input limit.
pub struct TokenBudgeter {
    bpe: CoreBPE,
    hard_max: usize,
}

impl std::fmt::Debug for TokenBudgeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgeter")
            .field("hard_max", &self.hard_max)
            .finish_non_exhaustive()
    }
}

impl TokenBudgeter {
    /// Budgeter for `model`.
    ///
    /// Models tiktoken does not recognise (for example local models behind an
    /// OpenAI compatible server) are counted with `cl100k_base`.
    pub fn for_model(model: &str, hard_max: usize) -> Result<Self> {
        let bpe = match get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(err) => {
                debug!("no tiktoken vocabulary for {model} ({err}), using cl100k_base");
                cl100k_base().map_err(|e| GreptError::Tokenizer(e.to_string()))?
            }
        };
        Ok(Self { bpe, hard_max })
    }

    pub fn hard_max(&self) -> usize {
        self.hard_max
    }

    /// Number of tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// `total` plus the tokens in `text`.
    pub fn accumulate(&self, total: usize, text: &str) -> usize {
        total.saturating_add(self.count(text))
    }

    /// True once `total` is within [`BUDGET_MARGIN`] of the hard max.
    pub fn near_limit(&self, total: usize) -> bool {
        total > self.hard_max.saturating_sub(BUDGET_MARGIN)
    }

    /// Split `text` into consecutive pieces of at most `max_tokens` tokens.
    ///
    /// A boundary that would cut a multi-byte character is moved back to the
    /// previous character boundary, or forward when a single token does not
    /// hold a whole character. The pieces always concatenate back to `text`.
    pub fn split(&self, text: &str, max_tokens: usize) -> Result<Vec<String>> {
        if max_tokens == 0 {
            return Err(GreptError::Validation(
                "chunk size must be greater than 0".to_string(),
            ));
        }
        let tokens = self.bpe.encode_with_special_tokens(text);
        let mut pieces = Vec::with_capacity(tokens.len() / max_tokens + 1);
        let mut start = 0;
        while start < tokens.len() {
            let (piece, end) = self.decode_from(&tokens, start, max_tokens)?;
            pieces.push(piece);
            start = end;
        }
        Ok(pieces)
    }

    /// Decode the longest valid piece starting at `start`, preferring at most
    /// `max_tokens` tokens.
    fn decode_from(
        &self,
        tokens: &[Rank],
        start: usize,
        max_tokens: usize,
    ) -> Result<(String, usize)> {
        let limit = (start + max_tokens).min(tokens.len());
        let shorter = (start + 1..=limit).rev();
        let longer = limit + 1..=tokens.len();
        let mut last_error = None;
        for end in shorter.chain(longer) {
            match self.bpe.decode(tokens[start..end].to_vec()) {
                Ok(piece) => return Ok((piece, end)),
                Err(err) => last_error = Some(err),
            }
        }
        Err(GreptError::Tokenizer(
            last_error.map_or_else(|| "nothing to decode".to_string(), |e| e.to_string()),
        ))
    }
}
