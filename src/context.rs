use crate::demarshal::{
    NativeBenchResult, NativeCompletionResult, NativeFloatArray, NativeString, NativeTokenArray,
    NativeTokenizeResult,
};
use crate::engine::{Capability, Engine};
use crate::error::{CactusError, Result};
use crate::lora::LoraAdapter;
use crate::marshal::{self, CStringArray, CompletionParamsRecord, InitParamsRecord};
use crate::params::{CompletionParams, InitParams};
use crate::result::{BenchResult, CompletionResult, ModelInfo, StopCause, TokenizeResult};
use crate::sys;
use crate::token::TokenId;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Opaque reference to a native context: the pointer address as an integer.
///
/// `0` always means "no context".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextHandle(u64);

impl ContextHandle {
    pub const NULL: ContextHandle = ContextHandle(0);

    pub fn from_raw(value: u64) -> Self {
        ContextHandle(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_ptr(ptr: sys::cactus_context_handle_t) -> Self {
        ContextHandle(ptr as usize as u64)
    }

    pub(crate) fn as_ptr(&self) -> sys::cactus_context_handle_t {
        self.0 as usize as sys::cactus_context_handle_t
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// State shared with [`StopHandle`]s.
///
/// Freeing and stopping both go through `handle`, so a stop request can never
/// reach a context that has already been freed.
pub(crate) struct Shared {
    handle: Mutex<ContextHandle>,
    stop_requested: AtomicBool,
}

impl Shared {
    fn new(handle: ContextHandle) -> Self {
        Self {
            handle: Mutex::new(handle),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextHandle> {
        // The guarded value is a plain integer, a poisoned lock still holds a valid one.
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Vision projector attached to a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultimodalState {
    pub mmproj_path: PathBuf,
    pub use_gpu: bool,
}

/// Vocoder model attached to a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocoderState {
    pub model_path: PathBuf,
}

/// Extensions the bridge has attached to a live context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionState {
    pub multimodal: Option<MultimodalState>,
    pub vocoder: Option<VocoderState>,
    pub lora_adapters: Vec<LoraAdapter>,
}

/// A loaded inference context
///
/// Owns exactly one native context and frees it on drop. The native engine is
/// not thread-safe per context, so `Context` is `Send` but not `Sync`; use a
/// [`StopHandle`] to cancel generation from another thread.
pub struct Context<E: Engine> {
    pub(crate) engine: Arc<E>,
    pub(crate) handle: ContextHandle,
    pub(crate) shared: Arc<Shared>,
    pub(crate) extensions: ExtensionState,
    _not_sync: PhantomData<Cell<()>>,
}

impl<E: Engine> Context<E> {
    // ==================== Lifecycle ====================

    /// Load a model and create a context for it
    pub fn new(engine: Arc<E>, params: &InitParams) -> Result<Self> {
        let record = InitParamsRecord::new(params)?;

        if !params.model_path.exists() {
            return Err(CactusError::InitFailure(format!(
                "Model file not found: {}",
                params.model_path.display()
            )));
        }

        info!(
            model = %params.model_path.display(),
            n_ctx = params.n_ctx,
            n_gpu_layers = params.n_gpu_layers,
            "initializing context"
        );

        let ptr = unsafe { engine.init_context(record.as_ptr()) };
        if ptr.is_null() {
            warn!(model = %params.model_path.display(), "engine rejected init params");
            return Err(CactusError::InitFailure(format!(
                "Engine rejected model: {}",
                params.model_path.display()
            )));
        }

        let handle = ContextHandle::from_ptr(ptr);
        debug!(%handle, "context live");
        Ok(Self::from_parts(engine, handle))
    }

    pub fn with_engine(engine: E, params: &InitParams) -> Result<Self> {
        Self::new(Arc::new(engine), params)
    }

    fn from_parts(engine: Arc<E>, handle: ContextHandle) -> Self {
        Self {
            engine,
            handle,
            shared: Arc::new(Shared::new(handle)),
            extensions: ExtensionState::default(),
            _not_sync: PhantomData,
        }
    }

    /// Take ownership of a handle released by [`Context::into_raw`].
    ///
    /// # Safety
    /// `handle` must be live, come from `engine`, and not be owned elsewhere.
    /// Extension state attached before `into_raw` is not restored.
    pub unsafe fn from_raw(engine: Arc<E>, handle: ContextHandle) -> Result<Self> {
        if handle.is_null() {
            return Err(CactusError::NullHandleMisuse("from_raw"));
        }
        Ok(Self::from_parts(engine, handle))
    }

    /// Give up ownership of the native context without freeing it.
    ///
    /// Outstanding stop handles become no-ops.
    pub fn into_raw(mut self) -> ContextHandle {
        let handle = self.handle;
        *self.shared.lock() = ContextHandle::NULL;
        self.handle = ContextHandle::NULL;
        handle
    }

    /// Free the native context and everything attached to it.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn free(&mut self) {
        let mut guard = self.shared.lock();
        if guard.is_null() {
            return;
        }
        let handle = *guard;
        unsafe { self.engine.free_context(handle.as_ptr()) };
        *guard = ContextHandle::NULL;
        drop(guard);

        self.handle = ContextHandle::NULL;
        self.extensions = ExtensionState::default();
        info!(%handle, "context freed");
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn is_live(&self) -> bool {
        !self.handle.is_null()
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn extensions(&self) -> &ExtensionState {
        &self.extensions
    }

    pub(crate) fn live_ptr(&self, call: &'static str) -> Result<sys::cactus_context_handle_t> {
        if self.handle.is_null() {
            return Err(CactusError::NullHandleMisuse(call));
        }
        Ok(self.handle.as_ptr())
    }

    pub(crate) fn require(&self, capability: Capability, call: &'static str) -> Result<sys::cactus_context_handle_t> {
        let ptr = self.live_ptr(call)?;
        if !self.engine.supports(capability) {
            return Err(CactusError::Unsupported(call));
        }
        Ok(ptr)
    }

    // ==================== Completion ====================

    /// Run a whole completion inside the engine
    pub fn completion(&mut self, params: &CompletionParams) -> Result<CompletionResult> {
        let handle = self.require(Capability::Completion, "completion")?;
        let record = CompletionParamsRecord::new(params)?;
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        if params.n_predict == 0 {
            let tokens_evaluated = self.tokenize(&params.prompt)?.len() as i32;
            debug!(tokens_evaluated, "zero budget, completion skipped");
            return Ok(CompletionResult::from_stop_cause(
                String::new(),
                0,
                tokens_evaluated,
                Some(&StopCause::Limit),
            ));
        }

        let mut out = NativeCompletionResult::new(&*self.engine);
        let status = unsafe { self.engine.completion(handle, record.as_ptr(), out.as_mut_ptr()) };
        if status != sys::CACTUS_OK {
            warn!(status, "completion failed");
            return Err(CactusError::NativeCallFailure { call: "cactus_completion_c", code: status });
        }

        let result = out.to_result();
        debug!(
            tokens_predicted = result.tokens_predicted,
            tokens_evaluated = result.tokens_evaluated,
            stop = ?result.stop_cause(),
            "completion finished"
        );
        Ok(result)
    }

    /// Run a whole completion conditioned on media files (images, audio)
    pub fn multimodal_completion<P: AsRef<Path>>(
        &mut self,
        params: &CompletionParams,
        media_paths: &[P],
    ) -> Result<CompletionResult> {
        let handle = self.require(Capability::Multimodal, "multimodal_completion")?;
        let record = CompletionParamsRecord::new(params)?;
        let media = CStringArray::from_paths(media_paths, "media path")?;
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        let mut out = NativeCompletionResult::new(&*self.engine);
        let status = unsafe {
            self.engine
                .multimodal_completion(handle, record.as_ptr(), media.as_ptr(), media.len(), out.as_mut_ptr())
        };
        if status != sys::CACTUS_OK {
            warn!(status, media = media.len(), "multimodal completion failed");
            return Err(CactusError::NativeCallFailure {
                call: "cactus_multimodal_completion_c",
                code: status,
            });
        }
        Ok(out.to_result())
    }

    /// Ask a running completion to stop
    pub fn stop_completion(&self) -> Result<()> {
        if !self.stop_handle().stop() {
            return Err(CactusError::NullHandleMisuse("stop_completion"));
        }
        Ok(())
    }

    /// A cloneable handle that can stop generation from any thread
    pub fn stop_handle(&self) -> StopHandle<E> {
        StopHandle {
            engine: Arc::clone(&self.engine),
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_stop(&self) {
        self.shared.stop_requested.store(false, Ordering::SeqCst);
    }

    // ==================== Tokenization ====================

    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        let handle = self.require(Capability::Tokenization, "tokenize")?;
        let c_text = marshal::c_string(text, "text")?;
        let tokens = unsafe { NativeTokenArray::new(&*self.engine, self.engine.tokenize(handle, c_text.as_ptr())) };
        Ok(tokens.to_vec())
    }

    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        let handle = self.require(Capability::Tokenization, "detokenize")?;
        let count = marshal::count(tokens.len(), "tokens")?;
        let text = unsafe { NativeString::new(&*self.engine, self.engine.detokenize(handle, tokens.as_ptr(), count)) };
        Ok(text.to_string_lossy())
    }

    /// Tokenize a prompt whose media markers refer to `media_paths`
    pub fn tokenize_with_media<P: AsRef<Path>>(&self, text: &str, media_paths: &[P]) -> Result<TokenizeResult> {
        let handle = self.require(Capability::Multimodal, "tokenize_with_media")?;
        let c_text = marshal::c_string(text, "text")?;
        let media = CStringArray::from_paths(media_paths, "media path")?;
        let result = unsafe {
            NativeTokenizeResult::new(
                &*self.engine,
                self.engine
                    .tokenize_with_media(handle, c_text.as_ptr(), media.as_ptr(), media.len()),
            )
        };
        Ok(result.to_result())
    }

    // ==================== Embeddings ====================

    pub fn embedding(&self, text: &str) -> Result<Vec<f32>> {
        let handle = self.require(Capability::Embedding, "embedding")?;
        let c_text = marshal::c_string(text, "text")?;
        let values = unsafe { NativeFloatArray::new(&*self.engine, self.engine.embedding(handle, c_text.as_ptr())) };
        Ok(values.to_vec())
    }

    // ==================== Model info ====================

    pub fn n_ctx(&self) -> Result<i32> {
        let handle = self.live_ptr("n_ctx")?;
        Ok(unsafe { self.engine.get_n_ctx(handle) })
    }

    pub fn n_embd(&self) -> Result<i32> {
        let handle = self.live_ptr("n_embd")?;
        Ok(unsafe { self.engine.get_n_embd(handle) })
    }

    pub fn model_desc(&self) -> Result<String> {
        let handle = self.live_ptr("model_desc")?;
        let desc = unsafe { NativeString::new(&*self.engine, self.engine.get_model_desc(handle)) };
        Ok(desc.to_string_lossy())
    }

    pub fn model_size(&self) -> Result<i64> {
        let handle = self.live_ptr("model_size")?;
        Ok(unsafe { self.engine.get_model_size(handle) })
    }

    pub fn model_params(&self) -> Result<i64> {
        let handle = self.live_ptr("model_params")?;
        Ok(unsafe { self.engine.get_model_params(handle) })
    }

    pub fn model_info(&self) -> Result<ModelInfo> {
        Ok(ModelInfo {
            description: self.model_desc()?,
            size: self.model_size()?,
            params: self.model_params()?,
            n_ctx: self.n_ctx()?,
            n_embd: self.n_embd()?,
        })
    }

    /// Measure prompt-processing (`pp`) and generation (`tg`) speed
    ///
    /// `pl` is the number of parallel sequences and `nr` the repetitions.
    pub fn bench(&mut self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<BenchResult> {
        let handle = self.require(Capability::Bench, "bench")?;
        if pp <= 0 || tg <= 0 || pl <= 0 || nr <= 0 {
            return Err(CactusError::marshal(format!(
                "bench sizes must be positive, got pp={} tg={} pl={} nr={}",
                pp, tg, pl, nr
            )));
        }
        let result = unsafe { NativeBenchResult::new(&*self.engine, self.engine.bench(handle, pp, tg, pl, nr)) };
        Ok(result.to_result())
    }
}

impl<E: Engine> Drop for Context<E> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<E: Engine> fmt::Debug for Context<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .field("extensions", &self.extensions)
            .finish()
    }
}

#[cfg(feature = "native")]
impl Context<crate::engine::NativeEngine> {
    /// Load a model with the linked native engine
    pub fn load(params: &InitParams) -> Result<Self> {
        Self::with_engine(crate::engine::NativeEngine, params)
    }
}

/// Thread-safe cancellation for a [`Context`]
pub struct StopHandle<E: Engine> {
    engine: Arc<E>,
    shared: Arc<Shared>,
}

impl<E: Engine> StopHandle<E> {
    /// Request that the current completion stops after the in-flight step.
    ///
    /// Returns `false` if the context has already been freed.
    pub fn stop(&self) -> bool {
        let guard = self.shared.lock();
        if guard.is_null() {
            return false;
        }
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        unsafe { self.engine.stop_completion(guard.as_ptr()) };
        debug!(handle = %*guard, "stop requested");
        true
    }

    pub fn is_live(&self) -> bool {
        !self.shared.lock().is_null()
    }
}

impl<E: Engine> Clone for StopHandle<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Engine> fmt::Debug for StopHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle").field("live", &self.is_live()).finish()
    }
}
