//! Conversion of caller parameters into ABI records
//!
//! A record owns every buffer its raw struct points into (strings, pointer
//! arrays), so the raw pointers stay valid for as long as the record lives.
//! All validation happens here, before anything reaches the engine.

use crate::error::{CactusError, Result};
use crate::params::{CompletionParams, InitParams};
use crate::sys;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::ptr;

// ==================== Primitive helpers ====================

/// Convert a string to a C string, rejecting interior NUL bytes
pub fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| CactusError::marshal(format!("{} contains a NUL byte", what)))
}

pub fn c_string_opt(value: Option<&str>, what: &str) -> Result<Option<CString>> {
    value.map(|v| c_string(v, what)).transpose()
}

pub fn path_c_string(path: &Path, what: &str) -> Result<CString> {
    let path_str = path
        .to_str()
        .ok_or_else(|| CactusError::marshal(format!("{} is not valid UTF-8: {}", what, path.display())))?;
    if path_str.is_empty() {
        return Err(CactusError::marshal(format!("{} is empty", what)));
    }
    c_string(path_str, what)
}

/// Null sentinel for absent optional strings
pub fn opt_ptr(value: &Option<CString>) -> *const c_char {
    value.as_ref().map_or(ptr::null(), |s| s.as_ptr())
}

pub fn count(len: usize, what: &str) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| CactusError::marshal(format!("too many {}: {}", what, len)))
}

fn non_negative(value: i32, what: &str) -> Result<()> {
    if value < 0 {
        return Err(CactusError::marshal(format!("{} must not be negative, got {}", what, value)));
    }
    Ok(())
}

fn at_least(value: i32, min: i32, what: &str) -> Result<()> {
    if value < min {
        return Err(CactusError::marshal(format!("{} must be at least {}, got {}", what, min, value)));
    }
    Ok(())
}

fn finite_non_negative(value: f64, what: &str) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(CactusError::marshal(format!("{} must be a finite non-negative number, got {}", what, value)));
    }
    Ok(())
}

fn probability(value: f64, what: &str) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(CactusError::marshal(format!("{} must be within [0, 1], got {}", what, value)));
    }
    Ok(())
}

// ==================== String arrays ====================

/// An owned `char**` + count pair
#[derive(Debug, Default)]
pub struct CStringArray {
    strings: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStringArray {
    pub fn new<S: AsRef<str>>(values: &[S], what: &str) -> Result<Self> {
        count(values.len(), what)?;
        let strings = values
            .iter()
            .map(|v| c_string(v.as_ref(), what))
            .collect::<Result<Vec<_>>>()?;
        let ptrs = strings.iter().map(|s| s.as_ptr()).collect();
        Ok(Self { strings, ptrs })
    }

    pub fn from_paths<P: AsRef<Path>>(paths: &[P], what: &str) -> Result<Self> {
        count(paths.len(), what)?;
        let strings = paths
            .iter()
            .map(|p| path_c_string(p.as_ref(), what))
            .collect::<Result<Vec<_>>>()?;
        let ptrs = strings.iter().map(|s| s.as_ptr()).collect();
        Ok(Self { strings, ptrs })
    }

    /// Pointer to the array, null when empty
    pub fn as_ptr(&self) -> *const *const c_char {
        if self.ptrs.is_empty() {
            ptr::null()
        } else {
            self.ptrs.as_ptr()
        }
    }

    pub fn len(&self) -> c_int {
        // Bounded by the check in the constructors.
        self.strings.len() as c_int
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

// ==================== Init params ====================

/// `cactus_init_params_c_t` together with the strings it points to
#[derive(Debug)]
pub struct InitParamsRecord {
    _model_path: CString,
    _chat_template: Option<CString>,
    _cache_type_k: Option<CString>,
    _cache_type_v: Option<CString>,
    raw: sys::cactus_init_params_c_t,
}

impl InitParamsRecord {
    pub fn new(params: &InitParams) -> Result<Self> {
        at_least(params.n_ctx, 0, "n_ctx")?;
        at_least(params.n_batch, 1, "n_batch")?;
        at_least(params.n_ubatch, 1, "n_ubatch")?;
        at_least(params.n_gpu_layers, -1, "n_gpu_layers")?;
        non_negative(params.n_threads, "n_threads")?;
        if let crate::params::EmbdNormalize::PNorm(p) = params.embd_normalize {
            at_least(p, 3, "embd_normalize p-norm exponent")?;
        }

        let model_path = path_c_string(&params.model_path, "model path")?;
        let chat_template = c_string_opt(params.chat_template.as_deref(), "chat template")?;
        let cache_type_k = c_string_opt(params.cache_type_k.map(|c| c.as_str()), "cache_type_k")?;
        let cache_type_v = c_string_opt(params.cache_type_v.map(|c| c.as_str()), "cache_type_v")?;

        let raw = sys::cactus_init_params_c_t {
            model_path: model_path.as_ptr(),
            chat_template: opt_ptr(&chat_template),
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            n_ubatch: params.n_ubatch,
            n_gpu_layers: params.n_gpu_layers,
            n_threads: params.n_threads,
            use_mmap: params.use_mmap,
            use_mlock: params.use_mlock,
            embedding: params.embedding,
            pooling_type: params.pooling_type.as_raw(),
            embd_normalize: params.embd_normalize.as_raw(),
            flash_attn: params.flash_attn,
            cache_type_k: opt_ptr(&cache_type_k),
            cache_type_v: opt_ptr(&cache_type_v),
            progress_callback: None,
        };

        Ok(Self {
            _model_path: model_path,
            _chat_template: chat_template,
            _cache_type_k: cache_type_k,
            _cache_type_v: cache_type_v,
            raw,
        })
    }

    pub fn raw(&self) -> &sys::cactus_init_params_c_t {
        &self.raw
    }

    pub fn as_ptr(&self) -> *const sys::cactus_init_params_c_t {
        &self.raw
    }
}

// ==================== Completion params ====================

/// `cactus_completion_params_c_t` together with the buffers it points to
#[derive(Debug)]
pub struct CompletionParamsRecord {
    _prompt: CString,
    _stop_sequences: CStringArray,
    _grammar: Option<CString>,
    raw: sys::cactus_completion_params_c_t,
}

impl CompletionParamsRecord {
    pub fn new(params: &CompletionParams) -> Result<Self> {
        validate_completion(params)?;

        let prompt = c_string(&params.prompt, "prompt")?;
        let stop_sequences = CStringArray::new(&params.stop_sequences, "stop sequences")?;
        let grammar = c_string_opt(params.grammar.as_deref(), "grammar")?;

        let raw = sys::cactus_completion_params_c_t {
            prompt: prompt.as_ptr(),
            n_predict: params.n_predict,
            n_threads: params.n_threads,
            seed: params.seed,
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            min_p: params.min_p,
            typical_p: params.typical_p,
            penalty_last_n: params.penalty_last_n,
            penalty_repeat: params.penalty_repeat,
            penalty_freq: params.penalty_freq,
            penalty_present: params.penalty_present,
            mirostat: params.mirostat.as_raw(),
            mirostat_tau: params.mirostat_tau,
            mirostat_eta: params.mirostat_eta,
            ignore_eos: params.ignore_eos,
            n_probs: params.n_probs,
            stop_sequences: stop_sequences.as_ptr(),
            stop_sequence_count: stop_sequences.len(),
            grammar: opt_ptr(&grammar),
            token_callback: None,
        };

        Ok(Self {
            _prompt: prompt,
            _stop_sequences: stop_sequences,
            _grammar: grammar,
            raw,
        })
    }

    pub fn raw(&self) -> &sys::cactus_completion_params_c_t {
        &self.raw
    }

    pub fn as_ptr(&self) -> *const sys::cactus_completion_params_c_t {
        &self.raw
    }
}

fn validate_completion(params: &CompletionParams) -> Result<()> {
    at_least(params.n_predict, -1, "n_predict")?;
    non_negative(params.n_threads, "n_threads")?;
    non_negative(params.top_k, "top_k")?;
    at_least(params.penalty_last_n, -1, "penalty_last_n")?;
    non_negative(params.n_probs, "n_probs")?;

    finite_non_negative(params.temperature, "temperature")?;
    finite_non_negative(params.penalty_repeat, "penalty_repeat")?;
    finite_non_negative(params.mirostat_tau, "mirostat_tau")?;
    finite_non_negative(params.mirostat_eta, "mirostat_eta")?;
    probability(params.top_p, "top_p")?;
    probability(params.min_p, "min_p")?;
    probability(params.typical_p, "typical_p")?;

    // Frequency and presence penalties may be negative.
    if !params.penalty_freq.is_finite() || !params.penalty_present.is_finite() {
        return Err(CactusError::marshal("penalties must be finite"));
    }

    if params.stop_sequences.iter().any(|s| s.is_empty()) {
        return Err(CactusError::marshal("stop sequences must not be empty"));
    }

    Ok(())
}

// ==================== LoRA adapters ====================

/// Array of `cactus_lora_adapter_c_t` together with the adapter paths
#[derive(Debug)]
pub struct LoraAdaptersRecord {
    _paths: Vec<CString>,
    raw: Vec<sys::cactus_lora_adapter_c_t>,
}

impl LoraAdaptersRecord {
    pub fn new(adapters: &[crate::lora::LoraAdapter]) -> Result<Self> {
        count(adapters.len(), "LoRA adapters")?;
        let mut paths = Vec::with_capacity(adapters.len());
        let mut raw = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            if !adapter.scale.is_finite() {
                return Err(CactusError::marshal(format!(
                    "LoRA scale must be finite, got {} for {}",
                    adapter.scale,
                    adapter.path.display()
                )));
            }
            let path = path_c_string(&adapter.path, "LoRA adapter path")?;
            raw.push(sys::cactus_lora_adapter_c_t {
                path: path.as_ptr(),
                scale: adapter.scale,
            });
            paths.push(path);
        }
        Ok(Self { _paths: paths, raw })
    }

    pub fn as_ptr(&self) -> *const sys::cactus_lora_adapter_c_t {
        if self.raw.is_empty() {
            ptr::null()
        } else {
            self.raw.as_ptr()
        }
    }

    pub fn len(&self) -> c_int {
        self.raw.len() as c_int
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}
