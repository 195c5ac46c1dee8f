//! Caller-owned results copied out of native records

use crate::token::TokenId;
use serde::{Deserialize, Serialize};

/// Why a completion ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCause {
    /// The model emitted its end-of-generation token
    Eos,
    /// A stop sequence matched
    Word(String),
    /// The token budget was exhausted
    Limit,
    /// `stop_completion` was called
    Interrupted,
    /// The context window filled up
    ContextFull,
}

/// Outcome of a completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub tokens_predicted: i32,
    pub tokens_evaluated: i32,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    /// Matched stop sequence, empty when none matched
    pub stopping_word: String,
}

impl CompletionResult {
    /// Stop cause derived from the flags.
    ///
    /// `None` means generation was interrupted before any terminal cause.
    pub fn stop_cause(&self) -> Option<StopCause> {
        if self.stopped_eos {
            Some(StopCause::Eos)
        } else if self.stopped_word {
            Some(StopCause::Word(self.stopping_word.clone()))
        } else if self.stopped_limit {
            Some(StopCause::Limit)
        } else if self.truncated {
            Some(StopCause::ContextFull)
        } else {
            None
        }
    }

    pub(crate) fn from_stop_cause(
        text: String,
        tokens_predicted: i32,
        tokens_evaluated: i32,
        cause: Option<&StopCause>,
    ) -> Self {
        let mut result = Self {
            text,
            tokens_predicted,
            tokens_evaluated,
            ..Default::default()
        };
        match cause {
            Some(StopCause::Eos) => result.stopped_eos = true,
            Some(StopCause::Word(word)) => {
                result.stopped_word = true;
                result.stopping_word = word.clone();
            }
            Some(StopCause::Limit) => {
                result.stopped_limit = true;
                result.truncated = true;
            }
            Some(StopCause::ContextFull) => result.truncated = true,
            Some(StopCause::Interrupted) | None => {}
        }
        result
    }
}

/// Tokens of a prompt that may reference media
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizeResult {
    pub tokens: Vec<TokenId>,
    pub has_media: bool,
    pub bitmap_hashes: Vec<String>,
    pub chunk_positions: Vec<usize>,
    pub chunk_positions_media: Vec<usize>,
}

/// A chat prompt formatted through a Jinja template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResult {
    pub prompt: String,
    pub json_schema: Option<String>,
    pub tools: Option<String>,
    pub tool_choice: Option<String>,
    pub parallel_tool_calls: bool,
}

/// Prompt-processing and generation throughput
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    pub model_name: String,
    pub model_size: i64,
    pub model_params: i64,
    pub pp_avg: f64,
    pub pp_std: f64,
    pub tg_avg: f64,
    pub tg_std: f64,
}

/// Static facts about the loaded model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub description: String,
    pub size: i64,
    pub params: i64,
    pub n_ctx: i32,
    pub n_embd: i32,
}
