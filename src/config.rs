//! Configuration management with serde integration
//!
//! A [`CactusConfig`] describes everything needed to bring up a context:
//! model and context parameters, default sampling, extensions to attach, and
//! logging. It can be built in code, loaded from JSON, or read from `CACTUS_*`
//! environment variables.
//!
//! Relative model, projector and vocoder paths are resolved against
//! [`CactusConfig::models_dir`], which the caller owns; there is no process-wide
//! default location.
//!
//! ## Example
//!
//! ```rust
//! use cactus::config::{CactusConfig, ModelConfig};
//!
//! let config = CactusConfig {
//!     model: ModelConfig {
//!         path: "qwen3-0.6b-q8_0.gguf".to_string(),
//!         n_ctx: 4096,
//!         ..Default::default()
//!     },
//!     models_dir: Some("/data/models".into()),
//!     ..Default::default()
//! };
//!
//! let params = config.to_init_params();
//! assert_eq!(params.model_path, std::path::PathBuf::from("/data/models/qwen3-0.6b-q8_0.gguf"));
//! ```

use crate::engine::Engine;
use crate::lora::LoraAdapter;
use crate::params::{CacheType, CompletionParams, EmbdNormalize, InitParams, Mirostat, PoolingType};
use crate::{CactusError, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Complete cactus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CactusConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Directory relative paths are resolved against
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
}

/// Model and context parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: String,
    #[serde(default)]
    pub chat_template: Option<String>,
    #[serde(default = "default_n_ctx")]
    pub n_ctx: i32,
    #[serde(default = "default_n_batch")]
    pub n_batch: i32,
    #[serde(default = "default_n_batch")]
    pub n_ubatch: i32,
    #[serde(default)]
    pub n_gpu_layers: i32,
    /// 0 uses every available core
    #[serde(default)]
    pub n_threads: i32,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
    #[serde(default)]
    pub embedding: bool,
    #[serde(default)]
    pub pooling_type: PoolingType,
    #[serde(default)]
    pub embd_normalize: EmbdNormalize,
    #[serde(default)]
    pub flash_attn: bool,
    #[serde(default)]
    pub cache_type_k: Option<CacheType>,
    #[serde(default)]
    pub cache_type_v: Option<CacheType>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            chat_template: None,
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_ubatch: default_n_batch(),
            n_gpu_layers: 0,
            n_threads: 0,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            pooling_type: PoolingType::default(),
            embd_normalize: EmbdNormalize::default(),
            flash_attn: false,
            cache_type_k: None,
            cache_type_v: None,
        }
    }
}

/// Default sampling for completions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_min_p")]
    pub min_p: f64,
    #[serde(default = "default_one")]
    pub typical_p: f64,
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: i32,
    #[serde(default = "default_one")]
    pub penalty_repeat: f64,
    #[serde(default)]
    pub penalty_freq: f64,
    #[serde(default)]
    pub penalty_present: f64,
    #[serde(default)]
    pub mirostat: Mirostat,
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f64,
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f64,
    #[serde(default = "default_seed")]
    pub seed: i32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub ignore_eos: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n_predict: default_n_predict(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            typical_p: 1.0,
            penalty_last_n: default_penalty_last_n(),
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: Mirostat::Disabled,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            seed: default_seed(),
            stop_sequences: Vec::new(),
            grammar: None,
            ignore_eos: false,
        }
    }
}

/// Extensions attached right after the context is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    #[serde(default)]
    pub mmproj_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub mmproj_use_gpu: bool,
    #[serde(default)]
    pub vocoder_path: Option<PathBuf>,
    #[serde(default)]
    pub lora: Vec<LoraAdapter>,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            mmproj_path: None,
            mmproj_use_gpu: true,
            vocoder_path: None,
            lora: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (error, warn, info, debug, trace, `cactus=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path (None = stderr)
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Colored output
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            ansi: true,
        }
    }
}

fn default_n_ctx() -> i32 {
    2048
}
fn default_n_batch() -> i32 {
    512
}
fn default_n_predict() -> i32 {
    -1
}
fn default_temperature() -> f64 {
    0.8
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f64 {
    0.95
}
fn default_min_p() -> f64 {
    0.05
}
fn default_one() -> f64 {
    1.0
}
fn default_penalty_last_n() -> i32 {
    64
}
fn default_mirostat_tau() -> f64 {
    5.0
}
fn default_mirostat_eta() -> f64 {
    0.1
}
fn default_seed() -> i32 {
    -1
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, CactusError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| CactusError::ConfigError(format!("Invalid {}: {}", name, e)))
}

impl CactusConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CactusError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CactusError::ConfigError(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| CactusError::ConfigError(format!("Failed to parse JSON config: {}", e)))
    }

    /// Save configuration to a JSON file
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<(), CactusError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| CactusError::ConfigError(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from `CACTUS_*` environment variables
    pub fn from_env() -> Result<Self, CactusError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source, e.g. a map in tests
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CactusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("CACTUS_MODEL_PATH") {
            config.model.path = path;
        }
        if let Some(dir) = lookup("CACTUS_MODELS_DIR") {
            config.models_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = lookup("CACTUS_N_CTX") {
            config.model.n_ctx = parse_var("CACTUS_N_CTX", &v)?;
        }
        if let Some(v) = lookup("CACTUS_N_BATCH") {
            config.model.n_batch = parse_var("CACTUS_N_BATCH", &v)?;
        }
        if let Some(v) = lookup("CACTUS_N_GPU_LAYERS") {
            config.model.n_gpu_layers = parse_var("CACTUS_N_GPU_LAYERS", &v)?;
        }
        if let Some(v) = lookup("CACTUS_N_THREADS") {
            config.model.n_threads = parse_var("CACTUS_N_THREADS", &v)?;
        }
        if let Some(v) = lookup("CACTUS_FLASH_ATTN") {
            config.model.flash_attn = parse_var("CACTUS_FLASH_ATTN", &v)?;
        }

        if let Some(v) = lookup("CACTUS_N_PREDICT") {
            config.sampling.n_predict = parse_var("CACTUS_N_PREDICT", &v)?;
        }
        if let Some(v) = lookup("CACTUS_TEMPERATURE") {
            config.sampling.temperature = parse_var("CACTUS_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("CACTUS_TOP_K") {
            config.sampling.top_k = parse_var("CACTUS_TOP_K", &v)?;
        }
        if let Some(v) = lookup("CACTUS_TOP_P") {
            config.sampling.top_p = parse_var("CACTUS_TOP_P", &v)?;
        }
        if let Some(v) = lookup("CACTUS_SEED") {
            config.sampling.seed = parse_var("CACTUS_SEED", &v)?;
        }

        if let Some(path) = lookup("CACTUS_MMPROJ_PATH") {
            config.extensions.mmproj_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CACTUS_VOCODER_PATH") {
            config.extensions.vocoder_path = Some(PathBuf::from(path));
        }

        if let Some(level) = lookup("CACTUS_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(file) = lookup("CACTUS_LOG_FILE") {
            config.logging.file = Some(PathBuf::from(file));
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), CactusError> {
        if self.model.path.is_empty() {
            return Err(CactusError::ConfigError("Model path cannot be empty".to_string()));
        }

        if self.model.n_ctx < 0 {
            return Err(CactusError::ConfigError("Context size cannot be negative".to_string()));
        }

        if self.model.n_batch <= 0 || self.model.n_ubatch <= 0 {
            return Err(CactusError::ConfigError("Batch sizes must be greater than 0".to_string()));
        }

        if self.model.n_gpu_layers < -1 {
            return Err(CactusError::ConfigError("GPU layers must be -1 (all) or more".to_string()));
        }

        if self.model.n_threads < 0 {
            return Err(CactusError::ConfigError("Thread count cannot be negative".to_string()));
        }

        if self.sampling.temperature < 0.0 {
            return Err(CactusError::ConfigError("Temperature cannot be negative".to_string()));
        }

        if self.sampling.top_p <= 0.0 || self.sampling.top_p > 1.0 {
            return Err(CactusError::ConfigError("Top-p must be between 0 and 1".to_string()));
        }

        if self.sampling.penalty_repeat <= 0.0 {
            return Err(CactusError::ConfigError("Repeat penalty must be positive".to_string()));
        }

        if self.sampling.stop_sequences.iter().any(String::is_empty) {
            return Err(CactusError::ConfigError("Stop sequences cannot be empty".to_string()));
        }

        if let Some(adapter) = self.extensions.lora.iter().find(|a| !a.scale.is_finite()) {
            return Err(CactusError::ConfigError(format!(
                "LoRA scale for {} must be finite",
                adapter.path.display()
            )));
        }

        tracing_subscriber::EnvFilter::try_new(&self.logging.level)
            .map_err(|e| CactusError::ConfigError(format!("Invalid log level: {}", e)))?;

        Ok(())
    }

    /// Resolve `path` against `models_dir` when it is relative
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.models_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Convert to context initialization parameters
    pub fn to_init_params(&self) -> InitParams {
        let model = &self.model;
        InitParams {
            model_path: self.resolve_path(&model.path),
            chat_template: model.chat_template.clone(),
            n_ctx: model.n_ctx,
            n_batch: model.n_batch,
            n_ubatch: model.n_ubatch,
            n_gpu_layers: model.n_gpu_layers,
            n_threads: if model.n_threads == 0 {
                num_cpus::get() as i32
            } else {
                model.n_threads
            },
            use_mmap: model.use_mmap,
            use_mlock: model.use_mlock,
            embedding: model.embedding,
            pooling_type: model.pooling_type,
            embd_normalize: model.embd_normalize,
            flash_attn: model.flash_attn,
            cache_type_k: model.cache_type_k,
            cache_type_v: model.cache_type_v,
        }
    }

    /// Completion parameters for `prompt` using the configured sampling
    pub fn to_completion_params(&self, prompt: impl Into<String>) -> CompletionParams {
        let s = &self.sampling;
        CompletionParams {
            prompt: prompt.into(),
            n_predict: s.n_predict,
            n_threads: 0,
            seed: s.seed,
            temperature: s.temperature,
            top_k: s.top_k,
            top_p: s.top_p,
            min_p: s.min_p,
            typical_p: s.typical_p,
            penalty_last_n: s.penalty_last_n,
            penalty_repeat: s.penalty_repeat,
            penalty_freq: s.penalty_freq,
            penalty_present: s.penalty_present,
            mirostat: s.mirostat,
            mirostat_tau: s.mirostat_tau,
            mirostat_eta: s.mirostat_eta,
            ignore_eos: s.ignore_eos,
            n_probs: 0,
            stop_sequences: s.stop_sequences.clone(),
            grammar: s.grammar.clone(),
        }
    }
}

impl<E: Engine> Context<E> {
    /// Create a context and attach every configured extension.
    ///
    /// If any attach fails the context is freed and the error returned.
    pub fn from_config(engine: Arc<E>, config: &CactusConfig) -> Result<Self, CactusError> {
        config.validate()?;
        let mut ctx = Context::new(engine, &config.to_init_params())?;

        if let Some(mmproj) = &config.extensions.mmproj_path {
            ctx.init_multimodal(config.resolve_path(mmproj), config.extensions.mmproj_use_gpu)?;
        }
        if let Some(vocoder) = &config.extensions.vocoder_path {
            ctx.init_vocoder(config.resolve_path(vocoder))?;
        }
        if !config.extensions.lora.is_empty() {
            let adapters: Vec<LoraAdapter> = config
                .extensions
                .lora
                .iter()
                .map(|a| LoraAdapter::new(config.resolve_path(&a.path), a.scale))
                .collect();
            ctx.apply_lora_adapters(&adapters)?;
        }

        info!(
            handle = %ctx.handle(),
            multimodal = ctx.extensions().multimodal.is_some(),
            vocoder = ctx.extensions().vocoder.is_some(),
            lora = ctx.extensions().lora_adapters.len(),
            "context ready"
        );
        Ok(ctx)
    }
}

/// Preset configurations
pub mod presets {
    use super::*;

    /// Deterministic output for extraction and tool calls
    pub fn precise() -> CactusConfig {
        let mut config = CactusConfig::default();
        config.sampling.temperature = 0.0;
        config.sampling.top_k = 1;
        config.sampling.seed = 42;
        config
    }

    /// Conversational defaults with a larger window
    pub fn chatbot() -> CactusConfig {
        let mut config = CactusConfig::default();
        config.model.n_ctx = 4096;
        config.sampling.temperature = 0.7;
        config.sampling.top_p = 0.9;
        config.sampling.penalty_repeat = 1.1;
        config
    }

    /// Small footprint for phones and low-memory devices
    pub fn mobile() -> CactusConfig {
        let mut config = CactusConfig::default();
        config.model.n_ctx = 1024;
        config.model.n_batch = 256;
        config.model.n_ubatch = 256;
        config.model.cache_type_k = Some(CacheType::Q8_0);
        config.model.cache_type_v = Some(CacheType::Q8_0);
        config.model.n_threads = (num_cpus::get() as i32).min(4);
        config
    }

    /// Embedding extraction
    pub fn embeddings() -> CactusConfig {
        let mut config = CactusConfig::default();
        config.model.embedding = true;
        config.model.pooling_type = PoolingType::Mean;
        config.model.embd_normalize = EmbdNormalize::Euclidean;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let mut config = CactusConfig::default();
        assert!(config.validate().is_err());
        config.model.path = "model.gguf".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_serialization() {
        let mut config = presets::chatbot();
        config.model.path = "m.gguf".to_string();
        config.extensions.lora.push(LoraAdapter::new("a.gguf", 0.5));
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: CactusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.model.n_ctx, 4096);
        assert_eq!(deserialized.sampling.temperature, config.sampling.temperature);
        assert_eq!(deserialized.extensions.lora, config.extensions.lora);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CactusConfig = serde_json::from_str(r#"{"model": {"path": "m.gguf"}}"#).unwrap();
        assert_eq!(config.model.n_ctx, 2048);
        assert_eq!(config.sampling.top_k, 40);
        assert!(config.model.use_mmap);
        assert!(config.extensions.mmproj_use_gpu);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CACTUS_MODEL_PATH", "tiny.gguf"),
            ("CACTUS_MODELS_DIR", "/models"),
            ("CACTUS_N_CTX", "512"),
            ("CACTUS_TEMPERATURE", "0.2"),
        ]
        .into_iter()
        .collect();
        let config = CactusConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.model.n_ctx, 512);
        assert_eq!(config.sampling.temperature, 0.2);
        assert_eq!(config.to_init_params().model_path, PathBuf::from("/models/tiny.gguf"));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = CactusConfig::from_lookup(|k| (k == "CACTUS_N_CTX").then(|| "lots".to_string())).unwrap_err();
        assert!(matches!(err, CactusError::ConfigError(msg) if msg.contains("CACTUS_N_CTX")));
    }

    #[test]
    fn test_validation() {
        let mut config = CactusConfig::default();
        config.model.path = "model.gguf".to_string();
        config.sampling.temperature = -1.0;
        assert!(config.validate().is_err());

        config.sampling.temperature = 0.5;
        config.model.n_batch = 0;
        assert!(config.validate().is_err());

        config.model.n_batch = 512;
        config.logging.level = "cactus=loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        assert_eq!(presets::precise().sampling.top_k, 1);
        assert!(presets::mobile().model.n_threads <= 4);
        assert!(presets::embeddings().model.embedding);
    }

    #[test]
    fn test_completion_params_from_config() {
        let mut config = CactusConfig::default();
        config.sampling.stop_sequences = vec!["</s>".to_string()];
        config.sampling.n_predict = 12;
        let params = config.to_completion_params("Hello");
        assert_eq!(params.prompt, "Hello");
        assert_eq!(params.n_predict, 12);
        assert_eq!(params.stop_sequences, vec!["</s>"]);
    }
}
