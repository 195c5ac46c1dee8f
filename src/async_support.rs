//! Async/await support for non-blocking operations
//!
//! Every engine call blocks its thread, so [`AsyncContext`] runs them on
//! tokio's blocking pool. The context sits behind a mutex, which keeps calls
//! on one handle serialized no matter how many tasks share it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cactus::async_support::AsyncContext;
//! use futures::StreamExt;
//!
//! let ctx = AsyncContext::new(engine, InitParams::new("model.gguf")).await?;
//! let mut stream = ctx.stream(CompletionParams::new("Hello").with_n_predict(64), 32);
//! while let Some(piece) = stream.next().await {
//!     print!("{}", piece.text);
//! }
//! let result = stream.finish().await?;
//! ```

use crate::engine::Engine;
use crate::error::{CactusError, Result};
use crate::params::{CompletionParams, InitParams};
use crate::result::CompletionResult;
use crate::token::{TokenId, TokenPiece};
use crate::{Context, StopHandle};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context as TaskContext, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::debug;

fn lock<E: Engine>(inner: &Mutex<Context<E>>) -> Result<MutexGuard<'_, Context<E>>> {
    inner
        .lock()
        .map_err(|_| CactusError::TaskFailed("context mutex poisoned".to_string()))
}

/// Async wrapper for [`Context`]
pub struct AsyncContext<E: Engine> {
    inner: Arc<Mutex<Context<E>>>,
    stop: StopHandle<E>,
}

impl<E: Engine> Clone for AsyncContext<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            stop: self.stop.clone(),
        }
    }
}

impl<E: Engine> AsyncContext<E> {
    /// Load a model without blocking the runtime
    pub async fn new(engine: Arc<E>, params: InitParams) -> Result<Self> {
        let ctx = task::spawn_blocking(move || Context::new(engine, &params))
            .await
            .map_err(|e| CactusError::TaskFailed(e.to_string()))??;
        Ok(Self::from_context(ctx))
    }

    pub fn from_context(ctx: Context<E>) -> Self {
        let stop = ctx.stop_handle();
        Self {
            inner: Arc::new(Mutex::new(ctx)),
            stop,
        }
    }

    /// Run `f` with exclusive access to the context on the blocking pool
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Context<E>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || {
            let mut ctx = lock(&inner)?;
            f(&mut *ctx)
        })
        .await
        .map_err(|e| CactusError::TaskFailed(e.to_string()))?
    }

    pub async fn completion(&self, params: CompletionParams) -> Result<CompletionResult> {
        self.run(move |ctx| ctx.completion(&params)).await
    }

    pub async fn tokenize(&self, text: impl Into<String>) -> Result<Vec<TokenId>> {
        let text = text.into();
        self.run(move |ctx| ctx.tokenize(&text)).await
    }

    pub async fn detokenize(&self, tokens: Vec<TokenId>) -> Result<String> {
        self.run(move |ctx| ctx.detokenize(&tokens)).await
    }

    pub async fn embedding(&self, text: impl Into<String>) -> Result<Vec<f32>> {
        let text = text.into();
        self.run(move |ctx| ctx.embedding(&text)).await
    }

    /// Stop whatever generation is running; never waits for the context lock
    pub fn stop_completion(&self) -> bool {
        self.stop.stop()
    }

    pub fn stop_handle(&self) -> StopHandle<E> {
        self.stop.clone()
    }

    /// Stream tokens as they are generated
    ///
    /// At most `buffer` tokens are queued ahead of the consumer. Dropping the
    /// stream stops generation, even if it has not started yet.
    pub fn stream(&self, params: CompletionParams, buffer: usize) -> TokenStream<E> {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let cancel = Arc::new(Cancel::default());
        let task_cancel = Arc::clone(&cancel);

        let handle = task::spawn_blocking(move || {
            let result = (|| {
                let mut ctx = lock(&inner)?;
                let mut stream = ctx.stream(&params)?;
                task_cancel.running.store(true, Ordering::SeqCst);
                loop {
                    if task_cancel.requested.load(Ordering::SeqCst) {
                        debug!("stream cancelled");
                        stream.interrupt();
                        break;
                    }
                    let Some(piece) = stream.next() else { break };
                    let Ok(piece) = piece else { break };
                    if sender.blocking_send(piece).is_err() {
                        debug!("token receiver dropped");
                        break;
                    }
                }
                task_cancel.running.store(false, Ordering::SeqCst);
                stream.finish()
            })();
            let _ = done_tx.send(result);
        });

        TokenStream {
            receiver,
            result: Some(done_rx),
            stop: self.stop.clone(),
            cancel,
            _handle: handle,
        }
    }
}

/// Cancellation owned by one [`TokenStream`]
///
/// The context-wide stop flag is cleared when a generation begins, so a stop
/// issued while the task still waits for the context would be lost; this flag
/// is not.
#[derive(Default)]
struct Cancel {
    requested: AtomicBool,
    running: AtomicBool,
}

/// Tokens from a running generation
///
/// Errors are reported by [`TokenStream::finish`].
pub struct TokenStream<E: Engine> {
    receiver: mpsc::Receiver<TokenPiece>,
    result: Option<oneshot::Receiver<Result<CompletionResult>>>,
    stop: StopHandle<E>,
    cancel: Arc<Cancel>,
    _handle: task::JoinHandle<()>,
}

impl<E: Engine> TokenStream<E> {
    /// Ask generation to stop after the current step
    pub fn stop(&self) {
        self.cancel.requested.store(true, Ordering::SeqCst);
        // Only reach into the engine once this stream owns the context.
        if self.cancel.running.load(Ordering::SeqCst) {
            self.stop.stop();
        }
    }

    /// Wait for generation to end and return its result.
    ///
    /// Tokens not yet consumed are discarded but still counted in the result.
    pub async fn finish(mut self) -> Result<CompletionResult> {
        while self.receiver.recv().await.is_some() {}
        let result = self
            .result
            .take()
            .ok_or_else(|| CactusError::TaskFailed("result already taken".to_string()))?;
        result
            .await
            .map_err(|_| CactusError::TaskFailed("generation task ended without a result".to_string()))?
    }
}

impl<E: Engine> Stream for TokenStream<E> {
    type Item = TokenPiece;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl<E: Engine> Drop for TokenStream<E> {
    fn drop(&mut self) {
        if self.result.is_some() {
            self.stop();
        }
    }
}
