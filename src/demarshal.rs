//! Scoped guards over engine-allocated memory
//!
//! Each guard owns one native allocation and runs the paired `free_*` call in
//! `Drop`, so the memory is released on every exit path. Data is always
//! deep-copied out of the guard before it drops.

use crate::engine::Engine;
use crate::result::{BenchResult, ChatResult, CompletionResult, TokenizeResult};
use crate::sys;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

/// Copy a NUL-terminated native string; null yields an empty string.
///
/// # Safety
/// `ptr` must be null or point to a valid NUL-terminated string.
pub unsafe fn copy_c_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Like [`copy_c_str`] but keeps null distinct from empty.
///
/// # Safety
/// Same as [`copy_c_str`].
pub unsafe fn copy_c_str_opt(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(copy_c_str(ptr))
    }
}

/// Copy `count` elements; null or non-positive counts yield an empty vector.
///
/// # Safety
/// `ptr` must be null or point to at least `count` initialised elements.
pub unsafe fn copy_slice<T: Copy>(ptr: *const T, count: c_int) -> Vec<T> {
    if ptr.is_null() || count <= 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(ptr, count as usize).to_vec()
    }
}

// ==================== Strings ====================

pub struct NativeString<'a, E: Engine> {
    engine: &'a E,
    ptr: *mut c_char,
}

impl<'a, E: Engine> NativeString<'a, E> {
    /// # Safety
    /// `ptr` must be null or a string allocated by `engine`.
    pub unsafe fn new(engine: &'a E, ptr: *mut c_char) -> Self {
        Self { engine, ptr }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn to_string_lossy(&self) -> String {
        unsafe { copy_c_str(self.ptr) }
    }

    /// Raw bytes without the terminator; empty for null
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.ptr.is_null() {
            Vec::new()
        } else {
            unsafe { CStr::from_ptr(self.ptr) }.to_bytes().to_vec()
        }
    }
}

impl<E: Engine> Drop for NativeString<'_, E> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { self.engine.free_string(self.ptr) };
            self.ptr = ptr::null_mut();
        }
    }
}

// ==================== Arrays ====================

pub struct NativeTokenArray<'a, E: Engine> {
    engine: &'a E,
    raw: sys::cactus_token_array_c_t,
}

impl<'a, E: Engine> NativeTokenArray<'a, E> {
    /// # Safety
    /// `raw` must have been returned by `engine` and not freed yet.
    pub unsafe fn new(engine: &'a E, raw: sys::cactus_token_array_c_t) -> Self {
        Self { engine, raw }
    }

    pub fn to_vec(&self) -> Vec<i32> {
        unsafe { copy_slice(self.raw.tokens, self.raw.count) }
    }
}

impl<E: Engine> Drop for NativeTokenArray<'_, E> {
    fn drop(&mut self) {
        if !self.raw.tokens.is_null() {
            unsafe { self.engine.free_token_array(self.raw) };
        }
    }
}

pub struct NativeFloatArray<'a, E: Engine> {
    engine: &'a E,
    raw: sys::cactus_float_array_c_t,
}

impl<'a, E: Engine> NativeFloatArray<'a, E> {
    /// # Safety
    /// `raw` must have been returned by `engine` and not freed yet.
    pub unsafe fn new(engine: &'a E, raw: sys::cactus_float_array_c_t) -> Self {
        Self { engine, raw }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        unsafe { copy_slice(self.raw.values, self.raw.count) }
    }
}

impl<E: Engine> Drop for NativeFloatArray<'_, E> {
    fn drop(&mut self) {
        if !self.raw.values.is_null() {
            unsafe { self.engine.free_float_array(self.raw) };
        }
    }
}

// ==================== Records ====================

/// Out-parameter for completion calls
pub struct NativeCompletionResult<'a, E: Engine> {
    engine: &'a E,
    raw: sys::cactus_completion_result_c_t,
}

impl<'a, E: Engine> NativeCompletionResult<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self {
            engine,
            raw: sys::cactus_completion_result_c_t::default(),
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut sys::cactus_completion_result_c_t {
        &mut self.raw
    }

    pub fn to_result(&self) -> CompletionResult {
        unsafe {
            CompletionResult {
                text: copy_c_str(self.raw.text),
                tokens_predicted: self.raw.tokens_predicted,
                tokens_evaluated: self.raw.tokens_evaluated,
                truncated: self.raw.truncated,
                stopped_eos: self.raw.stopped_eos,
                stopped_word: self.raw.stopped_word,
                stopped_limit: self.raw.stopped_limit,
                stopping_word: copy_c_str(self.raw.stopping_word),
            }
        }
    }
}

impl<E: Engine> Drop for NativeCompletionResult<'_, E> {
    fn drop(&mut self) {
        unsafe { self.engine.free_completion_result_members(&mut self.raw) };
    }
}

pub struct NativeTokenizeResult<'a, E: Engine> {
    engine: &'a E,
    raw: sys::cactus_tokenize_result_c_t,
}

impl<'a, E: Engine> NativeTokenizeResult<'a, E> {
    /// # Safety
    /// `raw` must have been returned by `engine` and not freed yet.
    pub unsafe fn new(engine: &'a E, raw: sys::cactus_tokenize_result_c_t) -> Self {
        Self { engine, raw }
    }

    pub fn to_result(&self) -> TokenizeResult {
        unsafe {
            let hashes = copy_slice(self.raw.bitmap_hashes as *const *mut c_char, self.raw.bitmap_hash_count);
            TokenizeResult {
                tokens: copy_slice(self.raw.tokens.tokens, self.raw.tokens.count),
                has_media: self.raw.has_media,
                bitmap_hashes: hashes.into_iter().map(|h| copy_c_str(h)).collect(),
                chunk_positions: copy_slice(self.raw.chunk_positions, self.raw.chunk_position_count),
                chunk_positions_media: copy_slice(
                    self.raw.chunk_positions_media,
                    self.raw.chunk_position_media_count,
                ),
            }
        }
    }
}

impl<E: Engine> Drop for NativeTokenizeResult<'_, E> {
    fn drop(&mut self) {
        unsafe { self.engine.free_tokenize_result(&mut self.raw) };
    }
}

pub struct NativeLoraAdapters<'a, E: Engine> {
    engine: &'a E,
    raw: sys::cactus_lora_adapters_c_t,
}

impl<'a, E: Engine> NativeLoraAdapters<'a, E> {
    /// # Safety
    /// `raw` must have been returned by `engine` and not freed yet.
    pub unsafe fn new(engine: &'a E, raw: sys::cactus_lora_adapters_c_t) -> Self {
        Self { engine, raw }
    }

    pub fn to_vec(&self) -> Vec<crate::lora::LoraAdapter> {
        unsafe {
            copy_slice(self.raw.adapters as *const sys::cactus_lora_adapter_c_t, self.raw.count)
                .into_iter()
                .map(|a| crate::lora::LoraAdapter::new(copy_c_str(a.path), a.scale))
                .collect()
        }
    }
}

impl<E: Engine> Drop for NativeLoraAdapters<'_, E> {
    fn drop(&mut self) {
        unsafe { self.engine.free_lora_adapters(&mut self.raw) };
    }
}

pub struct NativeChatResult<'a, E: Engine> {
    engine: &'a E,
    raw: sys::cactus_chat_result_c_t,
}

impl<'a, E: Engine> NativeChatResult<'a, E> {
    /// # Safety
    /// `raw` must have been returned by `engine` and not freed yet.
    pub unsafe fn new(engine: &'a E, raw: sys::cactus_chat_result_c_t) -> Self {
        Self { engine, raw }
    }

    pub fn to_result(&self) -> ChatResult {
        unsafe {
            ChatResult {
                prompt: copy_c_str(self.raw.prompt),
                json_schema: copy_c_str_opt(self.raw.json_schema),
                tools: copy_c_str_opt(self.raw.tools),
                tool_choice: copy_c_str_opt(self.raw.tool_choice),
                parallel_tool_calls: self.raw.parallel_tool_calls,
            }
        }
    }
}

impl<E: Engine> Drop for NativeChatResult<'_, E> {
    fn drop(&mut self) {
        unsafe { self.engine.free_chat_result_members(&mut self.raw) };
    }
}

pub struct NativeBenchResult<'a, E: Engine> {
    engine: &'a E,
    raw: sys::cactus_bench_result_c_t,
}

impl<'a, E: Engine> NativeBenchResult<'a, E> {
    /// # Safety
    /// `raw` must have been returned by `engine` and not freed yet.
    pub unsafe fn new(engine: &'a E, raw: sys::cactus_bench_result_c_t) -> Self {
        Self { engine, raw }
    }

    pub fn to_result(&self) -> BenchResult {
        BenchResult {
            model_name: unsafe { copy_c_str(self.raw.model_name) },
            model_size: self.raw.model_size,
            model_params: self.raw.model_params,
            pp_avg: self.raw.pp_avg,
            pp_std: self.raw.pp_std,
            tg_avg: self.raw.tg_avg,
            tg_std: self.raw.tg_std,
        }
    }
}

impl<E: Engine> Drop for NativeBenchResult<'_, E> {
    fn drop(&mut self) {
        unsafe { self.engine.free_bench_result_members(&mut self.raw) };
    }
}
