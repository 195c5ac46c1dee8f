//! In-process engine used by the integration tests
//!
//! `FakeEngine` implements the whole cactus ABI without a model. Every string
//! and array it hands out is tracked in a ledger, so tests can assert that the
//! bridge released each allocation exactly once.

#![allow(dead_code)]

use cactus::sys::*;
use cactus::{Capability, Engine};
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::io::Write;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

pub const N_EMBD: i32 = 8;
pub const MODEL_PARAMS: i64 = 1_000_000;
pub const DEFAULT_N_CTX: i32 = 4096;

/// Token id for a character: ids 0..=2 are reserved for control tokens.
pub fn token_id(c: char) -> i32 {
    c as i32 + 3
}

fn piece_id(piece: &[u8]) -> i32 {
    String::from_utf8_lossy(piece).chars().next().map(token_id).unwrap_or(3)
}

// ==================== Allocation ledger ====================

#[derive(Default)]
pub struct Ledger {
    live: Mutex<HashSet<usize>>,
    allocated: AtomicUsize,
    bad_frees: AtomicUsize,
}

impl Ledger {
    fn track(&self, addr: usize) {
        self.live.lock().unwrap().insert(addr);
        self.allocated.fetch_add(1, Ordering::SeqCst);
    }

    /// Forget `addr`; false if it was never handed out or is already freed.
    fn release(&self, addr: usize) -> bool {
        if self.live.lock().unwrap().remove(&addr) {
            true
        } else {
            self.bad_frees.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn string(&self, value: &str) -> *mut c_char {
        self.bytes(value.as_bytes())
    }

    /// Raw bytes, which need not be valid UTF-8
    fn bytes(&self, value: &[u8]) -> *mut c_char {
        let value: Vec<u8> = value.iter().copied().filter(|&b| b != 0).collect();
        let raw = CString::new(value).unwrap().into_raw();
        self.track(raw as usize);
        raw
    }

    unsafe fn free_string(&self, raw: *mut c_char) {
        if !raw.is_null() && self.release(raw as usize) {
            drop(CString::from_raw(raw));
        }
    }

    fn slice<T>(&self, values: Vec<T>) -> (*mut T, c_int) {
        if values.is_empty() {
            return (ptr::null_mut(), 0);
        }
        let len = values.len() as c_int;
        let raw = Box::into_raw(values.into_boxed_slice()) as *mut T;
        self.track(raw as usize);
        (raw, len)
    }

    unsafe fn free_slice<T>(&self, raw: *mut T, count: c_int) {
        if !raw.is_null() && self.release(raw as usize) {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(raw, count as usize)));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn bad_frees(&self) -> usize {
        self.bad_frees.load(Ordering::SeqCst)
    }
}

// ==================== Captured records ====================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedInit {
    pub model_path: String,
    pub chat_template: Option<String>,
    pub n_ctx: i32,
    pub n_batch: i32,
    pub n_ubatch: i32,
    pub n_gpu_layers: i32,
    pub n_threads: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub embedding: bool,
    pub pooling_type: i32,
    pub embd_normalize: i32,
    pub flash_attn: bool,
    pub cache_type_k: Option<String>,
    pub cache_type_v: Option<String>,
    pub has_progress_callback: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedCompletion {
    pub prompt: String,
    pub n_predict: i32,
    pub n_threads: i32,
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
    pub mirostat: i32,
    pub mirostat_tau: f64,
    pub mirostat_eta: f64,
    pub ignore_eos: bool,
    pub n_probs: i32,
    pub stop_sequences: Vec<String>,
    pub grammar: Option<String>,
    pub has_token_callback: bool,
}

unsafe fn read_str(raw: *const c_char) -> Option<String> {
    if raw.is_null() {
        None
    } else {
        Some(CStr::from_ptr(raw).to_string_lossy().into_owned())
    }
}

unsafe fn read_str_array(raw: *const *const c_char, count: c_int) -> Vec<String> {
    if raw.is_null() || count <= 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(raw, count as usize)
        .iter()
        .filter_map(|s| read_str(*s))
        .collect()
}

unsafe fn read_tokens(raw: *const i32, count: c_int) -> Vec<i32> {
    if raw.is_null() || count <= 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(raw, count as usize).to_vec()
}

impl CapturedInit {
    unsafe fn read(raw: &cactus_init_params_c_t) -> Self {
        Self {
            model_path: read_str(raw.model_path).unwrap_or_default(),
            chat_template: read_str(raw.chat_template),
            n_ctx: raw.n_ctx,
            n_batch: raw.n_batch,
            n_ubatch: raw.n_ubatch,
            n_gpu_layers: raw.n_gpu_layers,
            n_threads: raw.n_threads,
            use_mmap: raw.use_mmap,
            use_mlock: raw.use_mlock,
            embedding: raw.embedding,
            pooling_type: raw.pooling_type,
            embd_normalize: raw.embd_normalize,
            flash_attn: raw.flash_attn,
            cache_type_k: read_str(raw.cache_type_k),
            cache_type_v: read_str(raw.cache_type_v),
            has_progress_callback: raw.progress_callback.is_some(),
        }
    }
}

impl CapturedCompletion {
    unsafe fn read(raw: &cactus_completion_params_c_t) -> Self {
        Self {
            prompt: read_str(raw.prompt).unwrap_or_default(),
            n_predict: raw.n_predict,
            n_threads: raw.n_threads,
            seed: raw.seed,
            temperature: raw.temperature,
            top_k: raw.top_k,
            top_p: raw.top_p,
            min_p: raw.min_p,
            typical_p: raw.typical_p,
            penalty_last_n: raw.penalty_last_n,
            penalty_repeat: raw.penalty_repeat,
            penalty_freq: raw.penalty_freq,
            penalty_present: raw.penalty_present,
            mirostat: raw.mirostat,
            mirostat_tau: raw.mirostat_tau,
            mirostat_eta: raw.mirostat_eta,
            ignore_eos: raw.ignore_eos,
            n_probs: raw.n_probs,
            stop_sequences: read_str_array(raw.stop_sequences, raw.stop_sequence_count),
            grammar: read_str(raw.grammar),
            has_token_callback: raw.token_callback.is_some(),
        }
    }
}

// ==================== Per-context state ====================

#[derive(Default)]
struct Inner {
    params: CapturedCompletion,
    cursor: usize,
    n_past: i32,
    mmproj: Option<String>,
    vocoder: Option<String>,
    lora: Vec<(String, f32)>,
    guide_tokens: Vec<i32>,
}

struct FakeContext {
    model_name: String,
    model_size: i64,
    n_ctx: i32,
    embedding: bool,
    stop: AtomicBool,
    inner: Mutex<Inner>,
}

impl FakeContext {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

unsafe fn fake<'a>(handle: cactus_context_handle_t) -> &'a FakeContext {
    assert!(!handle.is_null(), "engine called with a null handle");
    &*(handle as *const FakeContext)
}

enum Step {
    Token(i32, Vec<u8>),
    Eos,
    Interrupted,
    ContextFull,
}

/// Earliest complete stop sequence in `text`
pub fn find_full(text: &str, stops: &[String]) -> Option<(usize, String)> {
    stops
        .iter()
        .filter_map(|s| text.find(s.as_str()).map(|pos| (pos, s.clone())))
        .min_by_key(|(pos, _)| *pos)
}

/// Start of the longest trailing prefix of any stop sequence
fn find_partial(text: &str, stops: &[String]) -> Option<usize> {
    let bytes = text.as_bytes();
    stops
        .iter()
        .filter_map(|s| {
            let word = s.as_bytes();
            (1..word.len())
                .rev()
                .find(|&k| bytes.ends_with(&word[..k]))
                .map(|k| bytes.len() - k)
        })
        .min()
}

// ==================== Engine ====================

#[derive(Default)]
pub struct Stats {
    pub inits: AtomicUsize,
    pub frees: AtomicUsize,
    pub begins: AtomicUsize,
    pub ends: AtomicUsize,
    pub rewinds: AtomicUsize,
    pub stops: AtomicUsize,
}

impl Stats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeEngine {
    script: Vec<Vec<u8>>,
    step_delay: Duration,
    disabled: Vec<Capability>,
    pub ledger: Ledger,
    pub stats: Stats,
    last_init: Mutex<Option<CapturedInit>>,
    last_completion: Mutex<Option<CapturedCompletion>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    /// Generates "Hello, world!" one piece at a time, then end-of-generation.
    pub fn new() -> Self {
        Self {
            script: ["Hello", ",", " world", "!"].iter().map(|s| s.as_bytes().to_vec()).collect(),
            step_delay: Duration::ZERO,
            disabled: Vec::new(),
            ledger: Ledger::default(),
            stats: Stats::default(),
            last_init: Mutex::new(None),
            last_completion: Mutex::new(None),
        }
    }

    /// Pieces are raw bytes, so a character may be split across steps.
    pub fn with_script<I, S>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.script = pieces.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.disabled.push(capability);
        self
    }

    pub fn last_init(&self) -> Option<CapturedInit> {
        self.last_init.lock().unwrap().clone()
    }

    pub fn last_completion(&self) -> Option<CapturedCompletion> {
        self.last_completion.lock().unwrap().clone()
    }

    pub fn live_contexts(&self) -> usize {
        Stats::get(&self.stats.inits) - Stats::get(&self.stats.frees)
    }

    fn step(&self, ctx: &FakeContext) -> Step {
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        if ctx.stop.load(Ordering::SeqCst) {
            return Step::Interrupted;
        }
        let mut inner = ctx.lock();
        if inner.n_past >= ctx.n_ctx {
            return Step::ContextFull;
        }
        let piece = if inner.cursor < self.script.len() {
            self.script[inner.cursor].clone()
        } else if inner.params.ignore_eos && !self.script.is_empty() {
            self.script[inner.cursor % self.script.len()].clone()
        } else {
            return Step::Eos;
        };
        inner.cursor += 1;
        inner.n_past += 1;
        Step::Token(piece_id(&piece), piece)
    }

    fn start(&self, ctx: &FakeContext, params: CapturedCompletion, extra_tokens: i32) {
        *self.last_completion.lock().unwrap() = Some(params.clone());
        ctx.stop.store(false, Ordering::SeqCst);
        let mut inner = ctx.lock();
        inner.n_past = params.prompt.chars().count() as i32 + extra_tokens;
        inner.cursor = 0;
        inner.params = params;
    }

    unsafe fn run_completion(
        &self,
        handle: cactus_context_handle_t,
        params: *const cactus_completion_params_c_t,
        extra_tokens: i32,
        result: *mut cactus_completion_result_c_t,
    ) -> c_int {
        let ctx = fake(handle);
        let params = CapturedCompletion::read(&*params);
        if params.grammar.as_deref() == Some("invalid") {
            return 1;
        }
        let stops = params.stop_sequences.clone();
        let budget = params.n_predict;
        let evaluated = params.prompt.chars().count() as i32 + extra_tokens;
        self.start(ctx, params, extra_tokens);

        let out = &mut *result;
        let mut bytes: Vec<u8> = Vec::new();
        let mut stopping_word = None;
        out.tokens_predicted = 0;
        out.tokens_evaluated = evaluated;
        loop {
            if budget >= 0 && out.tokens_predicted >= budget {
                out.stopped_limit = true;
                out.truncated = true;
                break;
            }
            match self.step(ctx) {
                Step::Token(_, piece) => {
                    out.tokens_predicted += 1;
                    bytes.extend_from_slice(&piece);
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if let Some((pos, word)) = find_full(&text, &stops) {
                        bytes = text[..pos].as_bytes().to_vec();
                        out.stopped_word = true;
                        stopping_word = Some(word);
                        break;
                    }
                }
                Step::Eos => {
                    out.stopped_eos = true;
                    break;
                }
                Step::Interrupted => break,
                Step::ContextFull => {
                    out.truncated = true;
                    break;
                }
            }
        }

        out.text = self.ledger.string(&String::from_utf8_lossy(&bytes));
        out.stopping_word = stopping_word.map_or(ptr::null_mut(), |w| self.ledger.string(&w));
        0
    }

    fn tokenize_text(text: &str) -> Vec<i32> {
        text.chars().map(token_id).collect()
    }
}

fn model_is_loadable(path: &str) -> Option<i64> {
    let bytes = std::fs::read(path).ok()?;
    bytes.starts_with(b"GGUF").then_some(bytes.len() as i64)
}

unsafe impl Engine for FakeEngine {
    fn supports(&self, capability: Capability) -> bool {
        !self.disabled.contains(&capability)
    }

    unsafe fn init_context(&self, params: *const cactus_init_params_c_t) -> cactus_context_handle_t {
        let captured = CapturedInit::read(&*params);
        *self.last_init.lock().unwrap() = Some(captured.clone());
        let Some(model_size) = model_is_loadable(&captured.model_path) else {
            return ptr::null_mut();
        };

        let model_name = Path::new(&captured.model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ctx = Box::new(FakeContext {
            model_name,
            model_size,
            n_ctx: if captured.n_ctx == 0 { DEFAULT_N_CTX } else { captured.n_ctx },
            embedding: captured.embedding,
            stop: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        });
        self.stats.inits.fetch_add(1, Ordering::SeqCst);
        Box::into_raw(ctx) as cactus_context_handle_t
    }

    unsafe fn free_context(&self, handle: cactus_context_handle_t) {
        if handle.is_null() {
            return;
        }
        drop(Box::from_raw(handle as *mut FakeContext));
        self.stats.frees.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn completion(
        &self,
        handle: cactus_context_handle_t,
        params: *const cactus_completion_params_c_t,
        result: *mut cactus_completion_result_c_t,
    ) -> c_int {
        self.run_completion(handle, params, 0, result)
    }

    unsafe fn multimodal_completion(
        &self,
        handle: cactus_context_handle_t,
        params: *const cactus_completion_params_c_t,
        media_paths: *const *const c_char,
        media_count: c_int,
        result: *mut cactus_completion_result_c_t,
    ) -> c_int {
        if fake(handle).lock().mmproj.is_none() {
            return 2;
        }
        let media = read_str_array(media_paths, media_count);
        self.run_completion(handle, params, media.len() as i32 * 4, result)
    }

    unsafe fn stop_completion(&self, handle: cactus_context_handle_t) {
        fake(handle).stop.store(true, Ordering::SeqCst);
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn tokenize(&self, handle: cactus_context_handle_t, text: *const c_char) -> cactus_token_array_c_t {
        fake(handle);
        let (tokens, count) = self.ledger.slice(Self::tokenize_text(&read_str(text).unwrap_or_default()));
        cactus_token_array_c_t { tokens, count }
    }

    unsafe fn detokenize(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int) -> *mut c_char {
        fake(handle);
        let text: String = read_tokens(tokens, count)
            .into_iter()
            .filter_map(|id| u32::try_from(id - 3).ok().and_then(char::from_u32))
            .collect();
        self.ledger.string(&text)
    }

    unsafe fn tokenize_with_media(
        &self,
        handle: cactus_context_handle_t,
        text: *const c_char,
        media_paths: *const *const c_char,
        media_count: c_int,
    ) -> cactus_tokenize_result_c_t {
        let ctx = fake(handle);
        let media = read_str_array(media_paths, media_count);
        if !media.is_empty() && ctx.lock().mmproj.is_none() {
            return cactus_tokenize_result_c_t::default();
        }

        let mut tokens = Self::tokenize_text(&read_str(text).unwrap_or_default());
        let mut hashes = Vec::new();
        let mut positions = Vec::new();
        let mut media_positions = Vec::new();
        for path in &media {
            if positions.is_empty() {
                positions.push(0usize);
            }
            media_positions.push(tokens.len());
            positions.push(tokens.len());
            tokens.extend([1, 1, 1, 1]);
            let name = Path::new(path).file_name().map(|n| n.to_string_lossy().into_owned());
            hashes.push(self.ledger.string(&format!("hash-{}", name.unwrap_or_default())));
        }

        let (token_ptr, token_count) = self.ledger.slice(tokens);
        let (hash_ptr, hash_count) = self.ledger.slice(hashes);
        let (pos_ptr, pos_count) = self.ledger.slice(positions);
        let (media_ptr, media_pos_count) = self.ledger.slice(media_positions);
        cactus_tokenize_result_c_t {
            tokens: cactus_token_array_c_t { tokens: token_ptr, count: token_count },
            has_media: !media.is_empty(),
            bitmap_hashes: hash_ptr,
            bitmap_hash_count: hash_count,
            chunk_positions: pos_ptr,
            chunk_position_count: pos_count,
            chunk_positions_media: media_ptr,
            chunk_position_media_count: media_pos_count,
        }
    }

    unsafe fn embedding(&self, handle: cactus_context_handle_t, text: *const c_char) -> cactus_float_array_c_t {
        let ctx = fake(handle);
        let text = read_str(text).unwrap_or_default();
        if !ctx.embedding || text.is_empty() {
            return cactus_float_array_c_t::default();
        }
        let mut values = vec![0f32; N_EMBD as usize];
        for (i, b) in text.bytes().enumerate() {
            values[i % N_EMBD as usize] += b as f32;
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        values.iter_mut().for_each(|v| *v /= norm);
        let (values, count) = self.ledger.slice(values);
        cactus_float_array_c_t { values, count }
    }

    unsafe fn free_string(&self, s: *mut c_char) {
        self.ledger.free_string(s);
    }

    unsafe fn free_token_array(&self, arr: cactus_token_array_c_t) {
        self.ledger.free_slice(arr.tokens, arr.count);
    }

    unsafe fn free_float_array(&self, arr: cactus_float_array_c_t) {
        self.ledger.free_slice(arr.values, arr.count);
    }

    unsafe fn free_completion_result_members(&self, result: *mut cactus_completion_result_c_t) {
        let result = &mut *result;
        self.ledger.free_string(result.text);
        self.ledger.free_string(result.stopping_word);
        result.text = ptr::null_mut();
        result.stopping_word = ptr::null_mut();
    }

    unsafe fn free_tokenize_result(&self, result: *mut cactus_tokenize_result_c_t) {
        let result = &mut *result;
        self.ledger.free_slice(result.tokens.tokens, result.tokens.count);
        if !result.bitmap_hashes.is_null() {
            for hash in std::slice::from_raw_parts(result.bitmap_hashes, result.bitmap_hash_count as usize) {
                self.ledger.free_string(*hash);
            }
        }
        self.ledger.free_slice(result.bitmap_hashes, result.bitmap_hash_count);
        self.ledger.free_slice(result.chunk_positions, result.chunk_position_count);
        self.ledger
            .free_slice(result.chunk_positions_media, result.chunk_position_media_count);
        *result = cactus_tokenize_result_c_t::default();
    }

    unsafe fn free_lora_adapters(&self, adapters: *mut cactus_lora_adapters_c_t) {
        let adapters = &mut *adapters;
        if !adapters.adapters.is_null() {
            for adapter in std::slice::from_raw_parts(adapters.adapters, adapters.count as usize) {
                self.ledger.free_string(adapter.path as *mut c_char);
            }
        }
        self.ledger.free_slice(adapters.adapters, adapters.count);
        *adapters = cactus_lora_adapters_c_t::default();
    }

    unsafe fn free_chat_result_members(&self, result: *mut cactus_chat_result_c_t) {
        let result = &mut *result;
        for field in [result.prompt, result.json_schema, result.tools, result.tool_choice] {
            self.ledger.free_string(field);
        }
        *result = cactus_chat_result_c_t::default();
    }

    unsafe fn free_bench_result_members(&self, result: *mut cactus_bench_result_c_t) {
        let result = &mut *result;
        self.ledger.free_string(result.model_name);
        result.model_name = ptr::null_mut();
    }

    // A projector path containing "broken" fails to load; "audio" adds audio input.
    unsafe fn init_multimodal(&self, handle: cactus_context_handle_t, mmproj_path: *const c_char, _use_gpu: bool) -> c_int {
        let path = read_str(mmproj_path).unwrap_or_default();
        if path.contains("broken") {
            return 3;
        }
        fake(handle).lock().mmproj = Some(path);
        0
    }

    unsafe fn is_multimodal_enabled(&self, handle: cactus_context_handle_t) -> bool {
        fake(handle).lock().mmproj.is_some()
    }

    unsafe fn supports_vision(&self, handle: cactus_context_handle_t) -> bool {
        fake(handle).lock().mmproj.is_some()
    }

    unsafe fn supports_audio(&self, handle: cactus_context_handle_t) -> bool {
        fake(handle).lock().mmproj.as_deref().is_some_and(|p| p.contains("audio"))
    }

    unsafe fn release_multimodal(&self, handle: cactus_context_handle_t) {
        fake(handle).lock().mmproj = None;
    }

    unsafe fn init_vocoder(&self, handle: cactus_context_handle_t, vocoder_model_path: *const c_char) -> c_int {
        let path = read_str(vocoder_model_path).unwrap_or_default();
        if path.contains("broken") {
            return 5;
        }
        fake(handle).lock().vocoder = Some(path);
        0
    }

    unsafe fn is_vocoder_enabled(&self, handle: cactus_context_handle_t) -> bool {
        fake(handle).lock().vocoder.is_some()
    }

    unsafe fn get_tts_type(&self, handle: cactus_context_handle_t) -> c_int {
        if fake(handle).lock().vocoder.is_some() {
            2
        } else {
            -1
        }
    }

    unsafe fn get_formatted_audio_completion(
        &self,
        handle: cactus_context_handle_t,
        speaker_json: *const c_char,
        text_to_speak: *const c_char,
    ) -> *mut c_char {
        fake(handle);
        let speaker = read_str(speaker_json).unwrap_or_else(|| "default".to_string());
        let text = read_str(text_to_speak).unwrap_or_default();
        self.ledger.string(&format!("<|speaker|>{}<|text|>{}<|audio|>", speaker, text))
    }

    unsafe fn get_audio_guide_tokens(&self, handle: cactus_context_handle_t, text_to_speak: *const c_char) -> cactus_token_array_c_t {
        fake(handle);
        let text = read_str(text_to_speak).unwrap_or_default();
        let (tokens, count) = self.ledger.slice(Self::tokenize_text(&text));
        cactus_token_array_c_t { tokens, count }
    }

    unsafe fn decode_audio_tokens(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int) -> cactus_float_array_c_t {
        fake(handle);
        let samples = read_tokens(tokens, count).into_iter().map(|t| t as f32 / 1000.0).collect();
        let (values, count) = self.ledger.slice(samples);
        cactus_float_array_c_t { values, count }
    }

    unsafe fn set_guide_tokens(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int) {
        fake(handle).lock().guide_tokens = read_tokens(tokens, count);
    }

    unsafe fn release_vocoder(&self, handle: cactus_context_handle_t) {
        fake(handle).lock().vocoder = None;
    }

    unsafe fn apply_lora_adapters(
        &self,
        handle: cactus_context_handle_t,
        adapters: *const cactus_lora_adapter_c_t,
        count: c_int,
    ) -> c_int {
        let adapters: Vec<(String, f32)> = if adapters.is_null() || count <= 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts(adapters, count as usize)
                .iter()
                .map(|a| (read_str(a.path).unwrap_or_default(), a.scale))
                .collect()
        };
        if adapters.iter().any(|(path, _)| path.contains("broken")) {
            return -1;
        }
        fake(handle).lock().lora = adapters;
        0
    }

    unsafe fn remove_lora_adapters(&self, handle: cactus_context_handle_t) {
        fake(handle).lock().lora.clear();
    }

    unsafe fn get_loaded_lora_adapters(&self, handle: cactus_context_handle_t) -> cactus_lora_adapters_c_t {
        let loaded: Vec<cactus_lora_adapter_c_t> = fake(handle)
            .lock()
            .lora
            .iter()
            .map(|(path, scale)| cactus_lora_adapter_c_t {
                path: self.ledger.string(path),
                scale: *scale,
            })
            .collect();
        let (adapters, count) = self.ledger.slice(loaded);
        cactus_lora_adapters_c_t { adapters, count }
    }

    unsafe fn validate_chat_template(&self, handle: cactus_context_handle_t, use_jinja: bool, name: *const c_char) -> bool {
        fake(handle);
        match read_str(name).as_deref() {
            None | Some("chatml") => true,
            Some("jinja-only") => use_jinja,
            Some(_) => false,
        }
    }

    unsafe fn get_formatted_chat(
        &self,
        handle: cactus_context_handle_t,
        messages_json: *const c_char,
        chat_template: *const c_char,
    ) -> *mut c_char {
        fake(handle);
        match render_chat(&read_str(messages_json).unwrap_or_default(), read_str(chat_template).as_deref()) {
            Some(prompt) => self.ledger.string(&prompt),
            None => ptr::null_mut(),
        }
    }

    unsafe fn get_formatted_chat_with_jinja(
        &self,
        handle: cactus_context_handle_t,
        messages_json: *const c_char,
        chat_template: *const c_char,
        json_schema: *const c_char,
        tools: *const c_char,
        parallel_tool_calls: bool,
        tool_choice: *const c_char,
    ) -> cactus_chat_result_c_t {
        fake(handle);
        let Some(prompt) = render_chat(&read_str(messages_json).unwrap_or_default(), read_str(chat_template).as_deref())
        else {
            return cactus_chat_result_c_t::default();
        };
        let echo = |raw: *const c_char| read_str(raw).map_or(ptr::null_mut(), |s| self.ledger.string(&s));
        cactus_chat_result_c_t {
            prompt: self.ledger.string(&prompt),
            json_schema: echo(json_schema),
            tools: echo(tools),
            tool_choice: echo(tool_choice),
            parallel_tool_calls,
        }
    }

    unsafe fn set_completion_params(&self, handle: cactus_context_handle_t, params: *const cactus_completion_params_c_t) -> c_int {
        let params = CapturedCompletion::read(&*params);
        *self.last_completion.lock().unwrap() = Some(params.clone());
        fake(handle).lock().params = params;
        0
    }

    unsafe fn rewind(&self, handle: cactus_context_handle_t) {
        let mut inner = fake(handle).lock();
        inner.n_past = 0;
        inner.cursor = 0;
        self.stats.rewinds.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn init_sampling(&self, handle: cactus_context_handle_t) -> bool {
        fake(handle).lock().params.grammar.as_deref() != Some("invalid")
    }

    unsafe fn begin_completion(&self, handle: cactus_context_handle_t) {
        let ctx = fake(handle);
        ctx.stop.store(false, Ordering::SeqCst);
        ctx.lock().cursor = 0;
        self.stats.begins.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn end_completion(&self, handle: cactus_context_handle_t) {
        fake(handle);
        self.stats.ends.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn load_prompt(&self, handle: cactus_context_handle_t) {
        let mut inner = fake(handle).lock();
        inner.n_past = inner.params.prompt.chars().count() as i32;
    }

    unsafe fn load_prompt_with_media(&self, handle: cactus_context_handle_t, media_paths: *const *const c_char, media_count: c_int) {
        let media = read_str_array(media_paths, media_count);
        let mut inner = fake(handle).lock();
        inner.n_past = inner.params.prompt.chars().count() as i32 + media.len() as i32 * 4;
    }

    unsafe fn do_completion_step(&self, handle: cactus_context_handle_t, token_text: *mut *mut c_char) -> c_int {
        match self.step(fake(handle)) {
            Step::Token(id, piece) => {
                *token_text = self.ledger.bytes(&piece);
                id
            }
            Step::Eos => CACTUS_STEP_EOS,
            Step::Interrupted => CACTUS_STEP_INTERRUPTED,
            Step::ContextFull => CACTUS_STEP_CONTEXT_FULL,
        }
    }

    unsafe fn find_stopping_strings(
        &self,
        handle: cactus_context_handle_t,
        text: *const c_char,
        _last_token_size: usize,
        stop_type: c_int,
    ) -> usize {
        let stops = fake(handle).lock().params.stop_sequences.clone();
        let text = read_str(text).unwrap_or_default();
        let found = if stop_type == CACTUS_STOP_FULL {
            find_full(&text, &stops).map(|(pos, _)| pos)
        } else {
            find_partial(&text, &stops)
        };
        found.unwrap_or(CACTUS_NPOS)
    }

    unsafe fn get_n_ctx(&self, handle: cactus_context_handle_t) -> c_int {
        fake(handle).n_ctx
    }

    unsafe fn get_n_embd(&self, handle: cactus_context_handle_t) -> c_int {
        fake(handle);
        N_EMBD
    }

    unsafe fn get_model_desc(&self, handle: cactus_context_handle_t) -> *mut c_char {
        let ctx = fake(handle);
        self.ledger.string(&format!("{} 1M Q8_0", ctx.model_name))
    }

    unsafe fn get_model_size(&self, handle: cactus_context_handle_t) -> i64 {
        fake(handle).model_size
    }

    unsafe fn get_model_params(&self, handle: cactus_context_handle_t) -> i64 {
        fake(handle);
        MODEL_PARAMS
    }

    unsafe fn bench(&self, handle: cactus_context_handle_t, pp: c_int, tg: c_int, pl: c_int, nr: c_int) -> cactus_bench_result_c_t {
        let ctx = fake(handle);
        cactus_bench_result_c_t {
            model_name: self.ledger.string(&ctx.model_name),
            model_size: ctx.model_size,
            model_params: MODEL_PARAMS,
            pp_avg: pp as f64 * 10.0,
            pp_std: nr as f64,
            tg_avg: tg as f64 * 2.0,
            tg_std: pl as f64,
        }
    }
}

/// ChatML, or `role: content` lines for the "plain" template
fn render_chat(messages_json: &str, template: Option<&str>) -> Option<String> {
    let messages: Vec<serde_json::Value> = serde_json::from_str(messages_json).ok()?;
    let mut prompt = String::new();
    for message in &messages {
        let role = message.get("role")?.as_str()?;
        let content = message.get("content")?.as_str()?;
        match template {
            Some("plain") => prompt.push_str(&format!("{}: {}\n", role, content)),
            _ => prompt.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", role, content)),
        }
    }
    match template {
        Some("plain") => prompt.push_str("assistant:"),
        _ => prompt.push_str("<|im_start|>assistant\n"),
    }
    Some(prompt)
}

// ==================== Fixtures ====================

/// Write a file the fake engine accepts as a model
pub fn write_model(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"GGUF").unwrap();
    file.write_all(&[0u8; 60]).unwrap();
    path
}

/// Write an arbitrary auxiliary file (projector, vocoder, adapter)
pub fn write_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"aux").unwrap();
    path
}

pub struct Fixture {
    pub dir: TempDir,
    pub engine: Arc<FakeEngine>,
    pub model: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_engine(FakeEngine::new())
    }

    pub fn with_engine(engine: FakeEngine) -> Self {
        let dir = TempDir::new().unwrap();
        let model = write_model(dir.path(), "tiny-model.gguf");
        Self {
            dir,
            engine: Arc::new(engine),
            model,
        }
    }

    pub fn params(&self) -> cactus::InitParams {
        cactus::InitParams::new(&self.model)
    }

    pub fn context(&self) -> cactus::Context<FakeEngine> {
        cactus::Context::new(Arc::clone(&self.engine), &self.params()).unwrap()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        write_file(self.dir.path(), name)
    }

    pub fn outstanding(&self) -> usize {
        self.engine.ledger.outstanding()
    }
}
