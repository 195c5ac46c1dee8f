//! # Cactus
//!
//! A safe Rust bridge to the cactus on-device inference engine.
//!
//! ## Features
//!
//! - Handle-based contexts with automatic cleanup: every native context and
//!   every engine-allocated result is released exactly once
//! - Text completion, whole or token by token, with stop sequences and
//!   thread-safe cancellation
//! - Tokenization, detokenization and embeddings
//! - Multimodal prompts (vision/audio projectors), text-to-speech vocoders and
//!   LoRA adapters attached to a live context
//! - Chat-template formatting, including Jinja templates with tool calling
//! - JSON/environment configuration and `tracing` diagnostics
//! - Optional async layer on tokio (`async` feature)
//!
//! The safe API is generic over an [`Engine`]; enable the `native` feature to
//! link `libcactus` through [`NativeEngine`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use cactus::{CompletionParams, Context, InitParams};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctx = Context::load(&InitParams::new("path/to/model.gguf").with_n_ctx(4096))?;
//!
//! let result = ctx.completion(
//!     &CompletionParams::new("The capital of France is")
//!         .with_n_predict(32)
//!         .with_stop_sequence("\n"),
//! )?;
//!
//! println!("Generated: {}", result.text);
//! # Ok(())
//! # }
//! ```

pub mod sys;
pub mod engine;
pub mod error;
pub mod params;
pub mod marshal;
pub mod demarshal;
pub mod result;
pub mod token;
pub mod context;
pub mod streaming;
pub mod lora;
pub mod multimodal;
pub mod vocoder;
pub mod chat;
pub mod config;
pub mod logging;

#[cfg(feature = "async")]
pub mod async_support;

pub use context::{Context, ContextHandle, ExtensionState, MultimodalState, StopHandle, VocoderState};
pub use engine::{Capability, Engine};
pub use error::{CactusError, Result};
pub use params::{CacheType, CompletionParams, EmbdNormalize, InitParams, Mirostat, PoolingType};
pub use result::{BenchResult, ChatResult, CompletionResult, ModelInfo, StopCause, TokenizeResult};
pub use token::{TokenId, TokenPiece};
pub use streaming::CompletionStream;
pub use lora::LoraAdapter;
pub use chat::{ChatMessage, JinjaChatRequest};
pub use vocoder::TtsType;
pub use config::CactusConfig;
pub use logging::init_logging;

#[cfg(feature = "native")]
pub use engine::NativeEngine;

#[cfg(feature = "async")]
pub use async_support::{AsyncContext, TokenStream};

pub mod prelude {
    pub use crate::{
        CactusConfig, CactusError, ChatMessage, CompletionParams, CompletionResult, Context,
        Engine, InitParams, LoraAdapter, StopCause, StopHandle, TokenPiece,
    };

    #[cfg(feature = "native")]
    pub use crate::NativeEngine;
}
