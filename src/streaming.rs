//! Token-by-token completion
//!
//! [`CompletionStream`] drives the engine's stepwise protocol:
//!
//! ```text
//! set params -> begin -> init sampling -> load prompt -> step* -> end
//! ```
//!
//! It is a lazy, finite iterator of [`TokenPiece`]s that ends on the
//! end-of-generation token, a stop sequence, the token budget, a stop request
//! or a full context window. `end` runs exactly once, either in
//! [`CompletionStream::finish`] or when the stream is dropped.
//!
//! The engine hands out raw byte pieces, and a multi-byte character can be
//! split across steps. Incomplete trailing bytes are held until the next step
//! completes them, so every yielded piece is whole UTF-8.

use crate::demarshal::NativeString;
use crate::engine::{Capability, Engine};
use crate::error::{CactusError, Result};
use crate::marshal::{self, CStringArray, CompletionParamsRecord};
use crate::params::CompletionParams;
use crate::result::{CompletionResult, StopCause};
use crate::sys;
use crate::token::TokenPiece;
use crate::Context;
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use tracing::{debug, trace, warn};

pub struct CompletionStream<'a, E: Engine> {
    ctx: &'a mut Context<E>,
    handle: sys::cactus_context_handle_t,
    _params: CompletionParamsRecord,
    _media: Option<CStringArray>,
    stop_sequences: Vec<String>,
    budget: Option<i32>,
    text: String,
    pending: Vec<u8>,
    last_piece_len: usize,
    tokens_predicted: i32,
    tokens_evaluated: i32,
    cause: Option<StopCause>,
    failure: Option<i32>,
    done: bool,
    ended: bool,
}

impl<'a, E: Engine> CompletionStream<'a, E> {
    fn begin(ctx: &'a mut Context<E>, params: &CompletionParams, media: Option<CStringArray>) -> Result<Self> {
        let handle = ctx.require(Capability::Streaming, "stream")?;
        let record = CompletionParamsRecord::new(params)?;

        let tokens_evaluated = match &media {
            Some(media) if !media.is_empty() => {
                let c_prompt = marshal::c_string(&params.prompt, "prompt")?;
                let result = unsafe {
                    crate::demarshal::NativeTokenizeResult::new(
                        &*ctx.engine,
                        ctx.engine
                            .tokenize_with_media(handle, c_prompt.as_ptr(), media.as_ptr(), media.len()),
                    )
                };
                result.to_result().tokens.len()
            }
            _ => ctx.tokenize(&params.prompt)?.len(),
        };

        let status = unsafe { ctx.engine.set_completion_params(handle, record.as_ptr()) };
        if status != sys::CACTUS_OK {
            return Err(CactusError::NativeCallFailure {
                call: "cactus_set_completion_params_c",
                code: status,
            });
        }

        ctx.reset_stop();
        unsafe { ctx.engine.begin_completion(handle) };
        if !unsafe { ctx.engine.init_sampling(handle) } {
            unsafe { ctx.engine.end_completion(handle) };
            warn!("sampler initialization failed");
            return Err(CactusError::NativeCallFailure {
                call: "cactus_init_sampling_c",
                code: -1,
            });
        }

        match &media {
            Some(media) if !media.is_empty() => unsafe {
                ctx.engine.load_prompt_with_media(handle, media.as_ptr(), media.len())
            },
            _ => unsafe { ctx.engine.load_prompt(handle) },
        }

        let budget = if params.n_predict < 0 { None } else { Some(params.n_predict) };
        let mut stream = Self {
            ctx,
            handle,
            _params: record,
            _media: media,
            stop_sequences: params.stop_sequences.clone(),
            budget,
            text: String::new(),
            pending: Vec::new(),
            last_piece_len: 0,
            tokens_predicted: 0,
            tokens_evaluated: tokens_evaluated as i32,
            cause: None,
            failure: None,
            done: false,
            ended: false,
        };

        if budget == Some(0) {
            stream.stop(StopCause::Limit);
        }
        debug!(tokens_evaluated, budget = ?stream.budget, "stream started");
        Ok(stream)
    }

    fn stop(&mut self, cause: StopCause) {
        trace!(?cause, "stream stopped");
        self.cause = Some(cause);
        self.done = true;
    }

    /// End the stream as if `stop_completion` had been observed
    pub(crate) fn interrupt(&mut self) {
        if !self.done {
            self.stop(StopCause::Interrupted);
        }
    }

    /// Text generated so far.
    ///
    /// While the stream is running, a trailing prefix of a stop sequence is
    /// held back so callers never display text that may still be cut.
    pub fn text(&self) -> &str {
        if self.done || self.stop_sequences.is_empty() {
            return &self.text;
        }
        match self.find_stop(sys::CACTUS_STOP_PARTIAL) {
            Some(pos) => &self.text[..pos],
            None => &self.text,
        }
    }

    pub fn tokens_predicted(&self) -> i32 {
        self.tokens_predicted
    }

    pub fn stop_cause(&self) -> Option<&StopCause> {
        self.cause.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn find_stop(&self, stop_type: i32) -> Option<usize> {
        let c_text = marshal::c_string(&self.text, "generated text").ok()?;
        let pos = unsafe {
            self.ctx
                .engine
                .find_stopping_strings(self.handle, c_text.as_ptr(), self.last_piece_len, stop_type)
        };
        if pos == sys::CACTUS_NPOS || pos > self.text.len() || !self.text.is_char_boundary(pos) {
            return None;
        }
        Some(pos)
    }

    fn end(&mut self) {
        if !self.ended {
            unsafe { self.ctx.engine.end_completion(self.handle) };
            self.ended = true;
        }
    }

    /// End generation and collect the result.
    ///
    /// Finishing before the stream is exhausted records no stop flag.
    pub fn finish(mut self) -> Result<CompletionResult> {
        self.end();
        if let Some(code) = self.failure {
            return Err(CactusError::NativeCallFailure {
                call: "cactus_do_completion_step_c",
                code,
            });
        }
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.text.push_str(&tail);
            self.pending.clear();
        }
        let result = CompletionResult::from_stop_cause(
            std::mem::take(&mut self.text),
            self.tokens_predicted,
            self.tokens_evaluated,
            self.cause.as_ref(),
        );
        debug!(
            tokens_predicted = result.tokens_predicted,
            stop = ?self.cause,
            "stream finished"
        );
        Ok(result)
    }
}

impl<E: Engine> Iterator for CompletionStream<'_, E> {
    type Item = Result<TokenPiece>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.ctx.stop_requested() {
            self.stop(StopCause::Interrupted);
            return None;
        }

        let mut piece_ptr: *mut c_char = ptr::null_mut();
        let code = unsafe { self.ctx.engine.do_completion_step(self.handle, &mut piece_ptr) };
        let bytes = unsafe { NativeString::new(&*self.ctx.engine, piece_ptr) }.to_bytes();

        match code {
            sys::CACTUS_STEP_EOS => {
                self.stop(StopCause::Eos);
                None
            }
            sys::CACTUS_STEP_INTERRUPTED => {
                self.stop(StopCause::Interrupted);
                None
            }
            sys::CACTUS_STEP_CONTEXT_FULL => {
                self.stop(StopCause::ContextFull);
                None
            }
            code if code < 0 => {
                warn!(code, "completion step failed");
                self.failure = Some(code);
                self.done = true;
                Some(Err(CactusError::NativeCallFailure {
                    call: "cactus_do_completion_step_c",
                    code,
                }))
            }
            id => {
                self.tokens_predicted += 1;
                self.pending.extend_from_slice(&bytes);
                let mut piece = take_complete_utf8(&mut self.pending);
                let start = self.text.len();
                self.last_piece_len = piece.len();
                self.text.push_str(&piece);
                trace!(id, piece = %piece, pending = self.pending.len(), "step");

                if !self.stop_sequences.is_empty() && !piece.is_empty() {
                    if let Some(pos) = self.find_stop(sys::CACTUS_STOP_FULL) {
                        let word = self
                            .stop_sequences
                            .iter()
                            .find(|s| self.text[pos..].starts_with(s.as_str()))
                            .cloned()
                            .unwrap_or_default();
                        self.text.truncate(pos);
                        self.pending.clear();
                        piece.truncate(pos.saturating_sub(start));
                        self.stop(StopCause::Word(word));
                    }
                }
                if !self.done && self.budget.is_some_and(|b| self.tokens_predicted >= b) {
                    self.stop(StopCause::Limit);
                }

                Some(Ok(TokenPiece { id, text: piece }))
            }
        }
    }
}

/// Drain the longest valid UTF-8 prefix of `pending`.
///
/// An incomplete trailing sequence stays in `pending`; invalid bytes become
/// U+FFFD.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending.as_slice()) {
            Ok(valid) => {
                out.push_str(valid);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + len);
                    }
                }
            }
        }
    }
}

impl<E: Engine> Drop for CompletionStream<'_, E> {
    fn drop(&mut self) {
        self.end();
    }
}

impl<E: Engine> Context<E> {
    /// Start a token-by-token completion
    ///
    /// # Example
    /// ```rust,ignore
    /// let mut stream = ctx.stream(&CompletionParams::new("Once upon a time").with_n_predict(32))?;
    /// for piece in &mut stream {
    ///     print!("{}", piece?.text);
    /// }
    /// let result = stream.finish()?;
    /// ```
    pub fn stream(&mut self, params: &CompletionParams) -> Result<CompletionStream<'_, E>> {
        CompletionStream::begin(self, params, None)
    }

    /// Start a token-by-token completion conditioned on media files
    pub fn stream_with_media<P: AsRef<Path>>(
        &mut self,
        params: &CompletionParams,
        media_paths: &[P],
    ) -> Result<CompletionStream<'_, E>> {
        self.require(Capability::Multimodal, "stream_with_media")?;
        let media = CStringArray::from_paths(media_paths, "media path")?;
        CompletionStream::begin(self, params, Some(media))
    }

    /// Run a stepwise completion, handing every token to `on_token`.
    ///
    /// Returning `false` from the callback stops generation.
    pub fn completion_with_callback<F>(&mut self, params: &CompletionParams, mut on_token: F) -> Result<CompletionResult>
    where
        F: FnMut(&TokenPiece) -> bool,
    {
        let mut stream = self.stream(params)?;
        while let Some(piece) = stream.next() {
            let piece = piece?;
            if !on_token(&piece) {
                stream.stop(StopCause::Interrupted);
                break;
            }
        }
        stream.finish()
    }

    /// Clear the KV cache so the next completion starts from scratch
    pub fn rewind(&mut self) -> Result<()> {
        let handle = self.require(Capability::Streaming, "rewind")?;
        unsafe { self.engine.rewind(handle) };
        Ok(())
    }
}
