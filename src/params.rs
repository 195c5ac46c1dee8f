//! Caller-facing parameters for context initialization and completion

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pooling applied to token embeddings in embedding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    #[default]
    Unspecified,
    None,
    Mean,
    Cls,
    Last,
    Rank,
}

impl PoolingType {
    pub fn as_raw(&self) -> i32 {
        match self {
            PoolingType::Unspecified => -1,
            PoolingType::None => 0,
            PoolingType::Mean => 1,
            PoolingType::Cls => 2,
            PoolingType::Last => 3,
            PoolingType::Rank => 4,
        }
    }
}

/// Normalization applied to returned embeddings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbdNormalize {
    None,
    MaxAbs,
    Taxicab,
    #[default]
    Euclidean,
    /// p-norm with the given exponent (> 2)
    PNorm(i32),
}

impl EmbdNormalize {
    pub fn as_raw(&self) -> i32 {
        match self {
            EmbdNormalize::None => -1,
            EmbdNormalize::MaxAbs => 0,
            EmbdNormalize::Taxicab => 1,
            EmbdNormalize::Euclidean => 2,
            EmbdNormalize::PNorm(p) => *p,
        }
    }
}

/// KV-cache element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    F32,
    F16,
    Bf16,
    Q8_0,
    Q4_0,
    Q4_1,
    Iq4Nl,
    Q5_0,
    Q5_1,
}

impl CacheType {
    /// Name understood by the engine
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::F32 => "f32",
            CacheType::F16 => "f16",
            CacheType::Bf16 => "bf16",
            CacheType::Q8_0 => "q8_0",
            CacheType::Q4_0 => "q4_0",
            CacheType::Q4_1 => "q4_1",
            CacheType::Iq4Nl => "iq4_nl",
            CacheType::Q5_0 => "q5_0",
            CacheType::Q5_1 => "q5_1",
        }
    }
}

/// Mirostat sampling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mirostat {
    #[default]
    Disabled,
    V1,
    V2,
}

impl Mirostat {
    pub fn as_raw(&self) -> i32 {
        match self {
            Mirostat::Disabled => 0,
            Mirostat::V1 => 1,
            Mirostat::V2 => 2,
        }
    }
}

/// Parameters for creating a context
///
/// Counts are kept signed so that bad values coming from configuration are
/// reported as [`crate::CactusError::MarshallingError`] instead of wrapping.
#[derive(Debug, Clone, PartialEq)]
pub struct InitParams {
    pub model_path: PathBuf,
    pub chat_template: Option<String>,
    pub n_ctx: i32,
    pub n_batch: i32,
    pub n_ubatch: i32,
    /// Layers offloaded to the GPU; -1 offloads all of them
    pub n_gpu_layers: i32,
    pub n_threads: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub embedding: bool,
    pub pooling_type: PoolingType,
    pub embd_normalize: EmbdNormalize,
    pub flash_attn: bool,
    pub cache_type_k: Option<CacheType>,
    pub cache_type_v: Option<CacheType>,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            chat_template: None,
            n_ctx: 2048,
            n_batch: 512,
            n_ubatch: 512,
            n_gpu_layers: 0,
            n_threads: num_cpus::get() as i32,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            pooling_type: PoolingType::Unspecified,
            embd_normalize: EmbdNormalize::Euclidean,
            flash_attn: false,
            cache_type_k: None,
            cache_type_v: None,
        }
    }
}

impl InitParams {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Resolve a relative model path against a models directory.
    ///
    /// Absolute paths are left untouched.
    pub fn resolve_model_path<P: AsRef<Path>>(mut self, models_dir: P) -> Self {
        if self.model_path.is_relative() {
            self.model_path = models_dir.as_ref().join(&self.model_path);
        }
        self
    }

    pub fn with_chat_template(mut self, template: impl Into<String>) -> Self {
        self.chat_template = Some(template.into());
        self
    }

    pub fn with_n_ctx(mut self, n_ctx: i32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_n_batch(mut self, n_batch: i32) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_n_ubatch(mut self, n_ubatch: i32) -> Self {
        self.n_ubatch = n_ubatch;
        self
    }

    pub fn with_n_gpu_layers(mut self, n_gpu_layers: i32) -> Self {
        self.n_gpu_layers = n_gpu_layers;
        self
    }

    pub fn with_n_threads(mut self, n_threads: i32) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    pub fn with_mlock(mut self, use_mlock: bool) -> Self {
        self.use_mlock = use_mlock;
        self
    }

    pub fn with_embedding(mut self, pooling: PoolingType, normalize: EmbdNormalize) -> Self {
        self.embedding = true;
        self.pooling_type = pooling;
        self.embd_normalize = normalize;
        self
    }

    pub fn with_flash_attn(mut self, flash_attn: bool) -> Self {
        self.flash_attn = flash_attn;
        self
    }

    pub fn with_cache_types(mut self, k: Option<CacheType>, v: Option<CacheType>) -> Self {
        self.cache_type_k = k;
        self.cache_type_v = v;
        self
    }
}

/// Parameters for a single completion request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub prompt: String,
    /// Token budget; -1 generates until a natural stop
    pub n_predict: i32,
    /// Threads used for generation; 0 keeps the context setting
    pub n_threads: i32,
    /// RNG seed; -1 picks a random seed
    pub seed: i32,
    pub temperature: f64,
    pub top_k: i32,
    pub top_p: f64,
    pub min_p: f64,
    pub typical_p: f64,
    pub penalty_last_n: i32,
    pub penalty_repeat: f64,
    pub penalty_freq: f64,
    pub penalty_present: f64,
    pub mirostat: Mirostat,
    pub mirostat_tau: f64,
    pub mirostat_eta: f64,
    pub ignore_eos: bool,
    pub n_probs: i32,
    pub stop_sequences: Vec<String>,
    pub grammar: Option<String>,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            n_predict: -1,
            n_threads: 0,
            seed: -1,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: Mirostat::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            ignore_eos: false,
            n_probs: 0,
            stop_sequences: Vec::new(),
            grammar: None,
        }
    }
}

impl CompletionParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_n_predict(mut self, n_predict: i32) -> Self {
        self.n_predict = n_predict;
        self
    }

    pub fn with_n_threads(mut self, n_threads: i32) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_seed(mut self, seed: i32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, top_k: i32) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_min_p(mut self, min_p: f64) -> Self {
        self.min_p = min_p;
        self
    }

    pub fn with_typical_p(mut self, typical_p: f64) -> Self {
        self.typical_p = typical_p;
        self
    }

    pub fn with_penalties(mut self, last_n: i32, repeat: f64, freq: f64, present: f64) -> Self {
        self.penalty_last_n = last_n;
        self.penalty_repeat = repeat;
        self.penalty_freq = freq;
        self.penalty_present = present;
        self
    }

    pub fn with_mirostat(mut self, mode: Mirostat, tau: f64, eta: f64) -> Self {
        self.mirostat = mode;
        self.mirostat_tau = tau;
        self.mirostat_eta = eta;
        self
    }

    pub fn with_ignore_eos(mut self, ignore_eos: bool) -> Self {
        self.ignore_eos = ignore_eos;
        self
    }

    pub fn with_n_probs(mut self, n_probs: i32) -> Self {
        self.n_probs = n_probs;
        self
    }

    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }

    pub fn with_stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences.extend(stops.into_iter().map(Into::into));
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }

    /// Greedy decoding: always pick the most likely token
    pub fn greedy(self) -> Self {
        self.with_temperature(0.0).with_top_k(1)
    }
}
