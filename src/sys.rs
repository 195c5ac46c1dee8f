//! Raw ABI of the cactus native engine
//!
//! Every record here is `#[repr(C)]` and mirrors the engine's C header field for
//! field. Field order is part of the ABI: reordering two fields still compiles
//! but silently corrupts every call, so the layout is also described in
//! [`schema`] and checked against the compiled records by tests.
//!
//! **NOTE**: These are low-level bindings. Use the safe API in [`crate::Context`].

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_float, c_int};
use std::ptr;

// c_bool type alias matching C99 `bool`
pub type c_bool = bool;

//
// Constants
//

/// Step result: the model produced its end-of-generation token
pub const CACTUS_STEP_EOS: c_int = -1;

/// Step result: generation was interrupted by `cactus_stop_completion_c`
pub const CACTUS_STEP_INTERRUPTED: c_int = -2;

/// Step result: the context window is exhausted
pub const CACTUS_STEP_CONTEXT_FULL: c_int = -3;

/// `find_stopping_strings` mode: only complete stop sequences match
pub const CACTUS_STOP_FULL: c_int = 0;

/// `find_stopping_strings` mode: a trailing prefix of a stop sequence matches
pub const CACTUS_STOP_PARTIAL: c_int = 1;

/// `find_stopping_strings` result when nothing matched
pub const CACTUS_NPOS: usize = usize::MAX;

/// Status returned by native calls on success
pub const CACTUS_OK: c_int = 0;

//
// Opaque types
//

#[repr(C)]
pub struct cactus_context {
    _private: [u8; 0],
}

pub type cactus_context_handle_t = *mut cactus_context;

pub type cactus_progress_callback_t = Option<unsafe extern "C" fn(progress: c_float)>;

pub type cactus_token_callback_t = Option<unsafe extern "C" fn(token: *const c_char) -> c_bool>;

//
// Parameter records
//

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_init_params_c_t {
    pub model_path: *const c_char,
    pub chat_template: *const c_char,
    pub n_ctx: c_int,
    pub n_batch: c_int,
    pub n_ubatch: c_int,
    pub n_gpu_layers: c_int,
    pub n_threads: c_int,
    pub use_mmap: c_bool,
    pub use_mlock: c_bool,
    pub embedding: c_bool,
    pub pooling_type: c_int,
    pub embd_normalize: c_int,
    pub flash_attn: c_bool,
    pub cache_type_k: *const c_char,
    pub cache_type_v: *const c_char,
    pub progress_callback: cactus_progress_callback_t,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_completion_params_c_t {
    pub prompt: *const c_char,
    pub n_predict: c_int,
    pub n_threads: c_int,
    pub seed: c_int,
    pub temperature: f64,
    pub top_k: c_int,
    pub top_p: f64,
    pub min_p: f64,
    pub typical_p: f64,
    pub penalty_last_n: c_int,
    pub penalty_repeat: f64,
    pub penalty_freq: f64,
    pub penalty_present: f64,
    pub mirostat: c_int,
    pub mirostat_tau: f64,
    pub mirostat_eta: f64,
    pub ignore_eos: c_bool,
    pub n_probs: c_int,
    pub stop_sequences: *const *const c_char,
    pub stop_sequence_count: c_int,
    pub grammar: *const c_char,
    pub token_callback: cactus_token_callback_t,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_lora_adapter_c_t {
    pub path: *const c_char,
    pub scale: c_float,
}

//
// Result records (members are allocated by the engine)
//

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_completion_result_c_t {
    pub text: *mut c_char,
    pub tokens_predicted: c_int,
    pub tokens_evaluated: c_int,
    pub truncated: c_bool,
    pub stopped_eos: c_bool,
    pub stopped_word: c_bool,
    pub stopped_limit: c_bool,
    pub stopping_word: *mut c_char,
}

impl Default for cactus_completion_result_c_t {
    fn default() -> Self {
        Self {
            text: ptr::null_mut(),
            tokens_predicted: 0,
            tokens_evaluated: 0,
            truncated: false,
            stopped_eos: false,
            stopped_word: false,
            stopped_limit: false,
            stopping_word: ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_token_array_c_t {
    pub tokens: *mut i32,
    pub count: c_int,
}

impl Default for cactus_token_array_c_t {
    fn default() -> Self {
        Self { tokens: ptr::null_mut(), count: 0 }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_float_array_c_t {
    pub values: *mut c_float,
    pub count: c_int,
}

impl Default for cactus_float_array_c_t {
    fn default() -> Self {
        Self { values: ptr::null_mut(), count: 0 }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_tokenize_result_c_t {
    pub tokens: cactus_token_array_c_t,
    pub has_media: c_bool,
    pub bitmap_hashes: *mut *mut c_char,
    pub bitmap_hash_count: c_int,
    pub chunk_positions: *mut usize,
    pub chunk_position_count: c_int,
    pub chunk_positions_media: *mut usize,
    pub chunk_position_media_count: c_int,
}

impl Default for cactus_tokenize_result_c_t {
    fn default() -> Self {
        Self {
            tokens: cactus_token_array_c_t::default(),
            has_media: false,
            bitmap_hashes: ptr::null_mut(),
            bitmap_hash_count: 0,
            chunk_positions: ptr::null_mut(),
            chunk_position_count: 0,
            chunk_positions_media: ptr::null_mut(),
            chunk_position_media_count: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_lora_adapters_c_t {
    pub adapters: *mut cactus_lora_adapter_c_t,
    pub count: c_int,
}

impl Default for cactus_lora_adapters_c_t {
    fn default() -> Self {
        Self { adapters: ptr::null_mut(), count: 0 }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_chat_result_c_t {
    pub prompt: *mut c_char,
    pub json_schema: *mut c_char,
    pub tools: *mut c_char,
    pub tool_choice: *mut c_char,
    pub parallel_tool_calls: c_bool,
}

impl Default for cactus_chat_result_c_t {
    fn default() -> Self {
        Self {
            prompt: ptr::null_mut(),
            json_schema: ptr::null_mut(),
            tools: ptr::null_mut(),
            tool_choice: ptr::null_mut(),
            parallel_tool_calls: false,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cactus_bench_result_c_t {
    pub model_name: *mut c_char,
    pub model_size: i64,
    pub model_params: i64,
    pub pp_avg: f64,
    pub pp_std: f64,
    pub tg_avg: f64,
    pub tg_std: f64,
}

impl Default for cactus_bench_result_c_t {
    fn default() -> Self {
        Self {
            model_name: ptr::null_mut(),
            model_size: 0,
            model_params: 0,
            pp_avg: 0.0,
            pp_std: 0.0,
            tg_avg: 0.0,
            tg_std: 0.0,
        }
    }
}

//
// Entry points
//

#[cfg(feature = "native")]
#[link(name = "cactus")]
extern "C" {
    // Lifecycle
    pub fn cactus_init_context_c(params: *const cactus_init_params_c_t) -> cactus_context_handle_t;
    pub fn cactus_free_context_c(handle: cactus_context_handle_t);

    // Completion
    pub fn cactus_completion_c(
        handle: cactus_context_handle_t,
        params: *const cactus_completion_params_c_t,
        result: *mut cactus_completion_result_c_t,
    ) -> c_int;
    pub fn cactus_multimodal_completion_c(
        handle: cactus_context_handle_t,
        params: *const cactus_completion_params_c_t,
        media_paths: *const *const c_char,
        media_count: c_int,
        result: *mut cactus_completion_result_c_t,
    ) -> c_int;
    pub fn cactus_stop_completion_c(handle: cactus_context_handle_t);

    // Tokenization and embeddings
    pub fn cactus_tokenize_c(handle: cactus_context_handle_t, text: *const c_char) -> cactus_token_array_c_t;
    pub fn cactus_detokenize_c(handle: cactus_context_handle_t, tokens: *const i32, count: c_int) -> *mut c_char;
    pub fn cactus_tokenize_with_media_c(
        handle: cactus_context_handle_t,
        text: *const c_char,
        media_paths: *const *const c_char,
        media_count: c_int,
    ) -> cactus_tokenize_result_c_t;
    pub fn cactus_embedding_c(handle: cactus_context_handle_t, text: *const c_char) -> cactus_float_array_c_t;

    // Memory
    pub fn cactus_free_string_c(s: *mut c_char);
    pub fn cactus_free_token_array_c(arr: cactus_token_array_c_t);
    pub fn cactus_free_float_array_c(arr: cactus_float_array_c_t);
    pub fn cactus_free_completion_result_members_c(result: *mut cactus_completion_result_c_t);
    pub fn cactus_free_tokenize_result_c(result: *mut cactus_tokenize_result_c_t);
    pub fn cactus_free_lora_adapters_c(adapters: *mut cactus_lora_adapters_c_t);
    pub fn cactus_free_chat_result_members_c(result: *mut cactus_chat_result_c_t);
    pub fn cactus_free_bench_result_members_c(result: *mut cactus_bench_result_c_t);

    // Multimodal
    pub fn cactus_init_multimodal_c(handle: cactus_context_handle_t, mmproj_path: *const c_char, use_gpu: c_bool) -> c_int;
    pub fn cactus_is_multimodal_enabled_c(handle: cactus_context_handle_t) -> c_bool;
    pub fn cactus_supports_vision_c(handle: cactus_context_handle_t) -> c_bool;
    pub fn cactus_supports_audio_c(handle: cactus_context_handle_t) -> c_bool;
    pub fn cactus_release_multimodal_c(handle: cactus_context_handle_t);

    // Vocoder
    pub fn cactus_init_vocoder_c(handle: cactus_context_handle_t, vocoder_model_path: *const c_char) -> c_int;
    pub fn cactus_is_vocoder_enabled_c(handle: cactus_context_handle_t) -> c_bool;
    pub fn cactus_get_tts_type_c(handle: cactus_context_handle_t) -> c_int;
    pub fn cactus_get_formatted_audio_completion_c(
        handle: cactus_context_handle_t,
        speaker_json: *const c_char,
        text_to_speak: *const c_char,
    ) -> *mut c_char;
    pub fn cactus_get_audio_guide_tokens_c(handle: cactus_context_handle_t, text_to_speak: *const c_char) -> cactus_token_array_c_t;
    pub fn cactus_decode_audio_tokens_c(handle: cactus_context_handle_t, tokens: *const i32, count: c_int) -> cactus_float_array_c_t;
    pub fn cactus_set_guide_tokens_c(handle: cactus_context_handle_t, tokens: *const i32, count: c_int);
    pub fn cactus_release_vocoder_c(handle: cactus_context_handle_t);

    // LoRA adapters
    pub fn cactus_apply_lora_adapters_c(
        handle: cactus_context_handle_t,
        adapters: *const cactus_lora_adapter_c_t,
        count: c_int,
    ) -> c_int;
    pub fn cactus_remove_lora_adapters_c(handle: cactus_context_handle_t);
    pub fn cactus_get_loaded_lora_adapters_c(handle: cactus_context_handle_t) -> cactus_lora_adapters_c_t;

    // Chat formatting
    pub fn cactus_validate_chat_template_c(handle: cactus_context_handle_t, use_jinja: c_bool, name: *const c_char) -> c_bool;
    pub fn cactus_get_formatted_chat_c(
        handle: cactus_context_handle_t,
        messages_json: *const c_char,
        chat_template: *const c_char,
    ) -> *mut c_char;
    pub fn cactus_get_formatted_chat_with_jinja_c(
        handle: cactus_context_handle_t,
        messages_json: *const c_char,
        chat_template: *const c_char,
        json_schema: *const c_char,
        tools: *const c_char,
        parallel_tool_calls: c_bool,
        tool_choice: *const c_char,
    ) -> cactus_chat_result_c_t;

    // Stepwise completion
    pub fn cactus_set_completion_params_c(
        handle: cactus_context_handle_t,
        params: *const cactus_completion_params_c_t,
    ) -> c_int;
    pub fn cactus_rewind_c(handle: cactus_context_handle_t);
    pub fn cactus_init_sampling_c(handle: cactus_context_handle_t) -> c_bool;
    pub fn cactus_begin_completion_c(handle: cactus_context_handle_t);
    pub fn cactus_end_completion_c(handle: cactus_context_handle_t);
    pub fn cactus_load_prompt_c(handle: cactus_context_handle_t);
    pub fn cactus_load_prompt_with_media_c(
        handle: cactus_context_handle_t,
        media_paths: *const *const c_char,
        media_count: c_int,
    );
    pub fn cactus_do_completion_step_c(handle: cactus_context_handle_t, token_text: *mut *mut c_char) -> c_int;
    pub fn cactus_find_stopping_strings_c(
        handle: cactus_context_handle_t,
        text: *const c_char,
        last_token_size: usize,
        stop_type: c_int,
    ) -> usize;

    // Introspection
    pub fn cactus_get_n_ctx_c(handle: cactus_context_handle_t) -> c_int;
    pub fn cactus_get_n_embd_c(handle: cactus_context_handle_t) -> c_int;
    pub fn cactus_get_model_desc_c(handle: cactus_context_handle_t) -> *mut c_char;
    pub fn cactus_get_model_size_c(handle: cactus_context_handle_t) -> i64;
    pub fn cactus_get_model_params_c(handle: cactus_context_handle_t) -> i64;
    pub fn cactus_bench_c(handle: cactus_context_handle_t, pp: c_int, tg: c_int, pl: c_int, nr: c_int) -> cactus_bench_result_c_t;
}

/// Declarative description of every ABI record
///
/// Bindings for other languages are generated from the same table; the C
/// layout computed from it must agree with the `#[repr(C)]` records above.
pub mod schema {
    use std::mem::{align_of, size_of};

    /// C type of a record field
    #[derive(Debug, Clone, Copy)]
    pub enum FieldKind {
        Ptr,
        FnPtr,
        I32,
        I64,
        Usize,
        F32,
        F64,
        Bool,
        Record(&'static RecordSchema),
    }

    impl FieldKind {
        pub fn size(&self) -> usize {
            match self {
                FieldKind::Ptr | FieldKind::FnPtr | FieldKind::Usize => size_of::<usize>(),
                FieldKind::I32 | FieldKind::F32 => 4,
                FieldKind::I64 => size_of::<i64>(),
                FieldKind::F64 => size_of::<f64>(),
                FieldKind::Bool => 1,
                FieldKind::Record(record) => record.size(),
            }
        }

        pub fn align(&self) -> usize {
            match self {
                FieldKind::Ptr | FieldKind::FnPtr | FieldKind::Usize => align_of::<usize>(),
                FieldKind::I32 | FieldKind::F32 => 4,
                FieldKind::I64 => align_of::<i64>(),
                FieldKind::F64 => align_of::<f64>(),
                FieldKind::Bool => 1,
                FieldKind::Record(record) => record.align(),
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct FieldSchema {
        pub name: &'static str,
        pub kind: FieldKind,
    }

    #[derive(Debug)]
    pub struct RecordSchema {
        pub name: &'static str,
        pub fields: &'static [FieldSchema],
    }

    fn align_up(value: usize, align: usize) -> usize {
        (value + align - 1) / align * align
    }

    impl RecordSchema {
        /// Byte offset of each field under C layout rules
        pub fn offsets(&self) -> Vec<usize> {
            let mut offsets = Vec::with_capacity(self.fields.len());
            let mut cursor = 0;
            for field in self.fields {
                cursor = align_up(cursor, field.kind.align());
                offsets.push(cursor);
                cursor += field.kind.size();
            }
            offsets
        }

        pub fn offset_of(&self, name: &str) -> Option<usize> {
            self.fields
                .iter()
                .position(|f| f.name == name)
                .map(|index| self.offsets()[index])
        }

        pub fn align(&self) -> usize {
            self.fields.iter().map(|f| f.kind.align()).max().unwrap_or(1)
        }

        pub fn size(&self) -> usize {
            let end = match (self.fields.last(), self.offsets().last()) {
                (Some(field), Some(offset)) => offset + field.kind.size(),
                _ => 0,
            };
            align_up(end, self.align())
        }
    }

    const fn field(name: &'static str, kind: FieldKind) -> FieldSchema {
        FieldSchema { name, kind }
    }

    use FieldKind::*;

    pub static INIT_PARAMS: RecordSchema = RecordSchema {
        name: "cactus_init_params_c_t",
        fields: &[
            field("model_path", Ptr),
            field("chat_template", Ptr),
            field("n_ctx", I32),
            field("n_batch", I32),
            field("n_ubatch", I32),
            field("n_gpu_layers", I32),
            field("n_threads", I32),
            field("use_mmap", Bool),
            field("use_mlock", Bool),
            field("embedding", Bool),
            field("pooling_type", I32),
            field("embd_normalize", I32),
            field("flash_attn", Bool),
            field("cache_type_k", Ptr),
            field("cache_type_v", Ptr),
            field("progress_callback", FnPtr),
        ],
    };

    pub static COMPLETION_PARAMS: RecordSchema = RecordSchema {
        name: "cactus_completion_params_c_t",
        fields: &[
            field("prompt", Ptr),
            field("n_predict", I32),
            field("n_threads", I32),
            field("seed", I32),
            field("temperature", F64),
            field("top_k", I32),
            field("top_p", F64),
            field("min_p", F64),
            field("typical_p", F64),
            field("penalty_last_n", I32),
            field("penalty_repeat", F64),
            field("penalty_freq", F64),
            field("penalty_present", F64),
            field("mirostat", I32),
            field("mirostat_tau", F64),
            field("mirostat_eta", F64),
            field("ignore_eos", Bool),
            field("n_probs", I32),
            field("stop_sequences", Ptr),
            field("stop_sequence_count", I32),
            field("grammar", Ptr),
            field("token_callback", FnPtr),
        ],
    };

    pub static COMPLETION_RESULT: RecordSchema = RecordSchema {
        name: "cactus_completion_result_c_t",
        fields: &[
            field("text", Ptr),
            field("tokens_predicted", I32),
            field("tokens_evaluated", I32),
            field("truncated", Bool),
            field("stopped_eos", Bool),
            field("stopped_word", Bool),
            field("stopped_limit", Bool),
            field("stopping_word", Ptr),
        ],
    };

    pub static TOKEN_ARRAY: RecordSchema = RecordSchema {
        name: "cactus_token_array_c_t",
        fields: &[field("tokens", Ptr), field("count", I32)],
    };

    pub static FLOAT_ARRAY: RecordSchema = RecordSchema {
        name: "cactus_float_array_c_t",
        fields: &[field("values", Ptr), field("count", I32)],
    };

    pub static TOKENIZE_RESULT: RecordSchema = RecordSchema {
        name: "cactus_tokenize_result_c_t",
        fields: &[
            field("tokens", Record(&TOKEN_ARRAY)),
            field("has_media", Bool),
            field("bitmap_hashes", Ptr),
            field("bitmap_hash_count", I32),
            field("chunk_positions", Ptr),
            field("chunk_position_count", I32),
            field("chunk_positions_media", Ptr),
            field("chunk_position_media_count", I32),
        ],
    };

    pub static LORA_ADAPTER: RecordSchema = RecordSchema {
        name: "cactus_lora_adapter_c_t",
        fields: &[field("path", Ptr), field("scale", F32)],
    };

    pub static LORA_ADAPTERS: RecordSchema = RecordSchema {
        name: "cactus_lora_adapters_c_t",
        fields: &[field("adapters", Ptr), field("count", I32)],
    };

    pub static CHAT_RESULT: RecordSchema = RecordSchema {
        name: "cactus_chat_result_c_t",
        fields: &[
            field("prompt", Ptr),
            field("json_schema", Ptr),
            field("tools", Ptr),
            field("tool_choice", Ptr),
            field("parallel_tool_calls", Bool),
        ],
    };

    pub static BENCH_RESULT: RecordSchema = RecordSchema {
        name: "cactus_bench_result_c_t",
        fields: &[
            field("model_name", Ptr),
            field("model_size", I64),
            field("model_params", I64),
            field("pp_avg", F64),
            field("pp_std", F64),
            field("tg_avg", F64),
            field("tg_std", F64),
        ],
    };

    /// Every record crossing the boundary
    pub static ALL: [&RecordSchema; 10] = [
        &INIT_PARAMS,
        &COMPLETION_PARAMS,
        &COMPLETION_RESULT,
        &TOKEN_ARRAY,
        &FLOAT_ARRAY,
        &TOKENIZE_RESULT,
        &LORA_ADAPTER,
        &LORA_ADAPTERS,
        &CHAT_RESULT,
        &BENCH_RESULT,
    ];
}
