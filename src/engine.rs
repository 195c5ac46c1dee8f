//! The engine seam
//!
//! [`Engine`] exposes every entry point of the cactus ABI one to one. The safe
//! layer ([`crate::Context`]) is generic over it, so the implementation is
//! chosen at compile time: [`NativeEngine`] links `libcactus` when the `native`
//! feature is enabled, and tests plug in an in-process engine.

use crate::sys::{
    cactus_bench_result_c_t, cactus_chat_result_c_t, cactus_completion_params_c_t,
    cactus_completion_result_c_t, cactus_context_handle_t, cactus_float_array_c_t,
    cactus_init_params_c_t, cactus_lora_adapter_c_t, cactus_lora_adapters_c_t,
    cactus_token_array_c_t, cactus_tokenize_result_c_t,
};
use std::os::raw::{c_char, c_int};

/// Operation groups an engine may or may not provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Completion,
    Streaming,
    Tokenization,
    Embedding,
    Multimodal,
    Vocoder,
    Lora,
    Chat,
    Bench,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Completion => "completion",
            Capability::Streaming => "streaming",
            Capability::Tokenization => "tokenization",
            Capability::Embedding => "embedding",
            Capability::Multimodal => "multimodal",
            Capability::Vocoder => "vocoder",
            Capability::Lora => "lora",
            Capability::Chat => "chat",
            Capability::Bench => "bench",
        }
    }
}

/// ABI-level access to an inference engine
///
/// # Safety
///
/// Implementors must honour the cactus ABI contract: pointers handed out are
/// valid until released through the paired `free_*` call, counts describe the
/// exact number of initialised elements, and a handle returned by
/// [`Engine::init_context`] stays valid until [`Engine::free_context`].
/// Callers must only pass handles obtained from the same engine.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Engine: Send + Sync + 'static {
    /// Whether this engine implements an operation group.
    ///
    /// Calls into an unsupported group fail with
    /// [`crate::CactusError::Unsupported`] before reaching the engine.
    fn supports(&self, capability: Capability) -> bool {
        let _ = capability;
        true
    }

    // ==================== Lifecycle ====================

    unsafe fn init_context(&self, params: *const cactus_init_params_c_t) -> cactus_context_handle_t;
    unsafe fn free_context(&self, handle: cactus_context_handle_t);

    // ==================== Completion ====================

    unsafe fn completion(
        &self,
        handle: cactus_context_handle_t,
        params: *const cactus_completion_params_c_t,
        result: *mut cactus_completion_result_c_t,
    ) -> c_int;
    unsafe fn multimodal_completion(
        &self,
        handle: cactus_context_handle_t,
        params: *const cactus_completion_params_c_t,
        media_paths: *const *const c_char,
        media_count: c_int,
        result: *mut cactus_completion_result_c_t,
    ) -> c_int;
    unsafe fn stop_completion(&self, handle: cactus_context_handle_t);

    // ==================== Tokenization ====================

    unsafe fn tokenize(&self, handle: cactus_context_handle_t, text: *const c_char) -> cactus_token_array_c_t;
    unsafe fn detokenize(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int) -> *mut c_char;
    unsafe fn tokenize_with_media(
        &self,
        handle: cactus_context_handle_t,
        text: *const c_char,
        media_paths: *const *const c_char,
        media_count: c_int,
    ) -> cactus_tokenize_result_c_t;
    unsafe fn embedding(&self, handle: cactus_context_handle_t, text: *const c_char) -> cactus_float_array_c_t;

    // ==================== Memory ====================

    unsafe fn free_string(&self, s: *mut c_char);
    unsafe fn free_token_array(&self, arr: cactus_token_array_c_t);
    unsafe fn free_float_array(&self, arr: cactus_float_array_c_t);
    unsafe fn free_completion_result_members(&self, result: *mut cactus_completion_result_c_t);
    unsafe fn free_tokenize_result(&self, result: *mut cactus_tokenize_result_c_t);
    unsafe fn free_lora_adapters(&self, adapters: *mut cactus_lora_adapters_c_t);
    unsafe fn free_chat_result_members(&self, result: *mut cactus_chat_result_c_t);
    unsafe fn free_bench_result_members(&self, result: *mut cactus_bench_result_c_t);

    // ==================== Multimodal ====================

    unsafe fn init_multimodal(&self, handle: cactus_context_handle_t, mmproj_path: *const c_char, use_gpu: bool) -> c_int;
    unsafe fn is_multimodal_enabled(&self, handle: cactus_context_handle_t) -> bool;
    unsafe fn supports_vision(&self, handle: cactus_context_handle_t) -> bool;
    unsafe fn supports_audio(&self, handle: cactus_context_handle_t) -> bool;
    unsafe fn release_multimodal(&self, handle: cactus_context_handle_t);

    // ==================== Vocoder ====================

    unsafe fn init_vocoder(&self, handle: cactus_context_handle_t, vocoder_model_path: *const c_char) -> c_int;
    unsafe fn is_vocoder_enabled(&self, handle: cactus_context_handle_t) -> bool;
    unsafe fn get_tts_type(&self, handle: cactus_context_handle_t) -> c_int;
    unsafe fn get_formatted_audio_completion(
        &self,
        handle: cactus_context_handle_t,
        speaker_json: *const c_char,
        text_to_speak: *const c_char,
    ) -> *mut c_char;
    unsafe fn get_audio_guide_tokens(&self, handle: cactus_context_handle_t, text_to_speak: *const c_char) -> cactus_token_array_c_t;
    unsafe fn decode_audio_tokens(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int) -> cactus_float_array_c_t;
    unsafe fn set_guide_tokens(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int);
    unsafe fn release_vocoder(&self, handle: cactus_context_handle_t);

    // ==================== LoRA ====================

    unsafe fn apply_lora_adapters(
        &self,
        handle: cactus_context_handle_t,
        adapters: *const cactus_lora_adapter_c_t,
        count: c_int,
    ) -> c_int;
    unsafe fn remove_lora_adapters(&self, handle: cactus_context_handle_t);
    unsafe fn get_loaded_lora_adapters(&self, handle: cactus_context_handle_t) -> cactus_lora_adapters_c_t;

    // ==================== Chat ====================

    unsafe fn validate_chat_template(&self, handle: cactus_context_handle_t, use_jinja: bool, name: *const c_char) -> bool;
    unsafe fn get_formatted_chat(
        &self,
        handle: cactus_context_handle_t,
        messages_json: *const c_char,
        chat_template: *const c_char,
    ) -> *mut c_char;
    #[allow(clippy::too_many_arguments)]
    unsafe fn get_formatted_chat_with_jinja(
        &self,
        handle: cactus_context_handle_t,
        messages_json: *const c_char,
        chat_template: *const c_char,
        json_schema: *const c_char,
        tools: *const c_char,
        parallel_tool_calls: bool,
        tool_choice: *const c_char,
    ) -> cactus_chat_result_c_t;

    // ==================== Stepwise completion ====================

    unsafe fn set_completion_params(&self, handle: cactus_context_handle_t, params: *const cactus_completion_params_c_t) -> c_int;
    unsafe fn rewind(&self, handle: cactus_context_handle_t);
    unsafe fn init_sampling(&self, handle: cactus_context_handle_t) -> bool;
    unsafe fn begin_completion(&self, handle: cactus_context_handle_t);
    unsafe fn end_completion(&self, handle: cactus_context_handle_t);
    unsafe fn load_prompt(&self, handle: cactus_context_handle_t);
    unsafe fn load_prompt_with_media(&self, handle: cactus_context_handle_t, media_paths: *const *const c_char, media_count: c_int);
    unsafe fn do_completion_step(&self, handle: cactus_context_handle_t, token_text: *mut *mut c_char) -> c_int;
    unsafe fn find_stopping_strings(
        &self,
        handle: cactus_context_handle_t,
        text: *const c_char,
        last_token_size: usize,
        stop_type: c_int,
    ) -> usize;

    // ==================== Introspection ====================

    unsafe fn get_n_ctx(&self, handle: cactus_context_handle_t) -> c_int;
    unsafe fn get_n_embd(&self, handle: cactus_context_handle_t) -> c_int;
    unsafe fn get_model_desc(&self, handle: cactus_context_handle_t) -> *mut c_char;
    unsafe fn get_model_size(&self, handle: cactus_context_handle_t) -> i64;
    unsafe fn get_model_params(&self, handle: cactus_context_handle_t) -> i64;
    unsafe fn bench(&self, handle: cactus_context_handle_t, pp: c_int, tg: c_int, pl: c_int, nr: c_int) -> cactus_bench_result_c_t;
}

#[cfg(feature = "native")]
pub use native::NativeEngine;

#[cfg(feature = "native")]
mod native {
    use super::*;
    use crate::sys;

    /// The linked `libcactus` engine
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NativeEngine;

    unsafe impl Engine for NativeEngine {
        unsafe fn init_context(&self, params: *const cactus_init_params_c_t) -> cactus_context_handle_t {
            sys::cactus_init_context_c(params)
        }

        unsafe fn free_context(&self, handle: cactus_context_handle_t) {
            sys::cactus_free_context_c(handle)
        }

        unsafe fn completion(
            &self,
            handle: cactus_context_handle_t,
            params: *const cactus_completion_params_c_t,
            result: *mut cactus_completion_result_c_t,
        ) -> c_int {
            sys::cactus_completion_c(handle, params, result)
        }

        unsafe fn multimodal_completion(
            &self,
            handle: cactus_context_handle_t,
            params: *const cactus_completion_params_c_t,
            media_paths: *const *const c_char,
            media_count: c_int,
            result: *mut cactus_completion_result_c_t,
        ) -> c_int {
            sys::cactus_multimodal_completion_c(handle, params, media_paths, media_count, result)
        }

        unsafe fn stop_completion(&self, handle: cactus_context_handle_t) {
            sys::cactus_stop_completion_c(handle)
        }

        unsafe fn tokenize(&self, handle: cactus_context_handle_t, text: *const c_char) -> cactus_token_array_c_t {
            sys::cactus_tokenize_c(handle, text)
        }

        unsafe fn detokenize(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int) -> *mut c_char {
            sys::cactus_detokenize_c(handle, tokens, count)
        }

        unsafe fn tokenize_with_media(
            &self,
            handle: cactus_context_handle_t,
            text: *const c_char,
            media_paths: *const *const c_char,
            media_count: c_int,
        ) -> cactus_tokenize_result_c_t {
            sys::cactus_tokenize_with_media_c(handle, text, media_paths, media_count)
        }

        unsafe fn embedding(&self, handle: cactus_context_handle_t, text: *const c_char) -> cactus_float_array_c_t {
            sys::cactus_embedding_c(handle, text)
        }

        unsafe fn free_string(&self, s: *mut c_char) {
            sys::cactus_free_string_c(s)
        }

        unsafe fn free_token_array(&self, arr: cactus_token_array_c_t) {
            sys::cactus_free_token_array_c(arr)
        }

        unsafe fn free_float_array(&self, arr: cactus_float_array_c_t) {
            sys::cactus_free_float_array_c(arr)
        }

        unsafe fn free_completion_result_members(&self, result: *mut cactus_completion_result_c_t) {
            sys::cactus_free_completion_result_members_c(result)
        }

        unsafe fn free_tokenize_result(&self, result: *mut cactus_tokenize_result_c_t) {
            sys::cactus_free_tokenize_result_c(result)
        }

        unsafe fn free_lora_adapters(&self, adapters: *mut cactus_lora_adapters_c_t) {
            sys::cactus_free_lora_adapters_c(adapters)
        }

        unsafe fn free_chat_result_members(&self, result: *mut cactus_chat_result_c_t) {
            sys::cactus_free_chat_result_members_c(result)
        }

        unsafe fn free_bench_result_members(&self, result: *mut cactus_bench_result_c_t) {
            sys::cactus_free_bench_result_members_c(result)
        }

        unsafe fn init_multimodal(&self, handle: cactus_context_handle_t, mmproj_path: *const c_char, use_gpu: bool) -> c_int {
            sys::cactus_init_multimodal_c(handle, mmproj_path, use_gpu)
        }

        unsafe fn is_multimodal_enabled(&self, handle: cactus_context_handle_t) -> bool {
            sys::cactus_is_multimodal_enabled_c(handle)
        }

        unsafe fn supports_vision(&self, handle: cactus_context_handle_t) -> bool {
            sys::cactus_supports_vision_c(handle)
        }

        unsafe fn supports_audio(&self, handle: cactus_context_handle_t) -> bool {
            sys::cactus_supports_audio_c(handle)
        }

        unsafe fn release_multimodal(&self, handle: cactus_context_handle_t) {
            sys::cactus_release_multimodal_c(handle)
        }

        unsafe fn init_vocoder(&self, handle: cactus_context_handle_t, vocoder_model_path: *const c_char) -> c_int {
            sys::cactus_init_vocoder_c(handle, vocoder_model_path)
        }

        unsafe fn is_vocoder_enabled(&self, handle: cactus_context_handle_t) -> bool {
            sys::cactus_is_vocoder_enabled_c(handle)
        }

        unsafe fn get_tts_type(&self, handle: cactus_context_handle_t) -> c_int {
            sys::cactus_get_tts_type_c(handle)
        }

        unsafe fn get_formatted_audio_completion(
            &self,
            handle: cactus_context_handle_t,
            speaker_json: *const c_char,
            text_to_speak: *const c_char,
        ) -> *mut c_char {
            sys::cactus_get_formatted_audio_completion_c(handle, speaker_json, text_to_speak)
        }

        unsafe fn get_audio_guide_tokens(&self, handle: cactus_context_handle_t, text_to_speak: *const c_char) -> cactus_token_array_c_t {
            sys::cactus_get_audio_guide_tokens_c(handle, text_to_speak)
        }

        unsafe fn decode_audio_tokens(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int) -> cactus_float_array_c_t {
            sys::cactus_decode_audio_tokens_c(handle, tokens, count)
        }

        unsafe fn set_guide_tokens(&self, handle: cactus_context_handle_t, tokens: *const i32, count: c_int) {
            sys::cactus_set_guide_tokens_c(handle, tokens, count)
        }

        unsafe fn release_vocoder(&self, handle: cactus_context_handle_t) {
            sys::cactus_release_vocoder_c(handle)
        }

        unsafe fn apply_lora_adapters(
            &self,
            handle: cactus_context_handle_t,
            adapters: *const cactus_lora_adapter_c_t,
            count: c_int,
        ) -> c_int {
            sys::cactus_apply_lora_adapters_c(handle, adapters, count)
        }

        unsafe fn remove_lora_adapters(&self, handle: cactus_context_handle_t) {
            sys::cactus_remove_lora_adapters_c(handle)
        }

        unsafe fn get_loaded_lora_adapters(&self, handle: cactus_context_handle_t) -> cactus_lora_adapters_c_t {
            sys::cactus_get_loaded_lora_adapters_c(handle)
        }

        unsafe fn validate_chat_template(&self, handle: cactus_context_handle_t, use_jinja: bool, name: *const c_char) -> bool {
            sys::cactus_validate_chat_template_c(handle, use_jinja, name)
        }

        unsafe fn get_formatted_chat(
            &self,
            handle: cactus_context_handle_t,
            messages_json: *const c_char,
            chat_template: *const c_char,
        ) -> *mut c_char {
            sys::cactus_get_formatted_chat_c(handle, messages_json, chat_template)
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
            sys::cactus_get_formatted_chat_with_jinja_c(
                handle,
                messages_json,
                chat_template,
                json_schema,
                tools,
                parallel_tool_calls,
                tool_choice,
            )
        }

        unsafe fn set_completion_params(&self, handle: cactus_context_handle_t, params: *const cactus_completion_params_c_t) -> c_int {
            sys::cactus_set_completion_params_c(handle, params)
        }

        unsafe fn rewind(&self, handle: cactus_context_handle_t) {
            sys::cactus_rewind_c(handle)
        }

        unsafe fn init_sampling(&self, handle: cactus_context_handle_t) -> bool {
            sys::cactus_init_sampling_c(handle)
        }

        unsafe fn begin_completion(&self, handle: cactus_context_handle_t) {
            sys::cactus_begin_completion_c(handle)
        }

        unsafe fn end_completion(&self, handle: cactus_context_handle_t) {
            sys::cactus_end_completion_c(handle)
        }

        unsafe fn load_prompt(&self, handle: cactus_context_handle_t) {
            sys::cactus_load_prompt_c(handle)
        }

        unsafe fn load_prompt_with_media(&self, handle: cactus_context_handle_t, media_paths: *const *const c_char, media_count: c_int) {
            sys::cactus_load_prompt_with_media_c(handle, media_paths, media_count)
        }

        unsafe fn do_completion_step(&self, handle: cactus_context_handle_t, token_text: *mut *mut c_char) -> c_int {
            sys::cactus_do_completion_step_c(handle, token_text)
        }

        unsafe fn find_stopping_strings(
            &self,
            handle: cactus_context_handle_t,
            text: *const c_char,
            last_token_size: usize,
            stop_type: c_int,
        ) -> usize {
            sys::cactus_find_stopping_strings_c(handle, text, last_token_size, stop_type)
        }

        unsafe fn get_n_ctx(&self, handle: cactus_context_handle_t) -> c_int {
            sys::cactus_get_n_ctx_c(handle)
        }

        unsafe fn get_n_embd(&self, handle: cactus_context_handle_t) -> c_int {
            sys::cactus_get_n_embd_c(handle)
        }

        unsafe fn get_model_desc(&self, handle: cactus_context_handle_t) -> *mut c_char {
            sys::cactus_get_model_desc_c(handle)
        }

        unsafe fn get_model_size(&self, handle: cactus_context_handle_t) -> i64 {
            sys::cactus_get_model_size_c(handle)
        }

        unsafe fn get_model_params(&self, handle: cactus_context_handle_t) -> i64 {
            sys::cactus_get_model_params_c(handle)
        }

        unsafe fn bench(&self, handle: cactus_context_handle_t, pp: c_int, tg: c_int, pl: c_int, nr: c_int) -> cactus_bench_result_c_t {
            sys::cactus_bench_c(handle, pp, tg, pl, nr)
        }
    }
}
