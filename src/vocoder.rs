//! Vocoder (text-to-speech) extension
//!
//! With a vocoder attached, a TTS-capable model generates audio codes instead
//! of text: format a prompt with [`Context::formatted_audio_completion`],
//! constrain generation with [`Context::set_guide_tokens`], then turn the
//! generated tokens into PCM samples with [`Context::decode_audio_tokens`].

use crate::demarshal::{NativeFloatArray, NativeString, NativeTokenArray};
use crate::engine::{Capability, Engine};
use crate::error::{CactusError, Result};
use crate::marshal;
use crate::token::TokenId;
use crate::{Context, VocoderState};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Speech synthesis family reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtsType {
    Unknown,
    OuteTtsV0_2,
    OuteTtsV0_3,
    Other(i32),
}

impl From<i32> for TtsType {
    fn from(raw: i32) -> Self {
        match raw {
            -1 => TtsType::Unknown,
            1 => TtsType::OuteTtsV0_2,
            2 => TtsType::OuteTtsV0_3,
            other => TtsType::Other(other),
        }
    }
}

impl<E: Engine> Context<E> {
    /// Attach a vocoder model
    pub fn init_vocoder<P: AsRef<Path>>(&mut self, vocoder_model_path: P) -> Result<()> {
        let handle = self.require(Capability::Vocoder, "init_vocoder")?;
        let path = vocoder_model_path.as_ref();
        let c_path = marshal::path_c_string(path, "vocoder model path")?;

        if !path.exists() {
            return Err(CactusError::MarshallingError(format!(
                "Vocoder model not found: {}",
                path.display()
            )));
        }

        let status = unsafe { self.engine.init_vocoder(handle, c_path.as_ptr()) };
        if status != crate::sys::CACTUS_OK {
            warn!(status, vocoder = %path.display(), "vocoder init failed");
            return Err(CactusError::NativeCallFailure {
                call: "cactus_init_vocoder_c",
                code: status,
            });
        }

        self.extensions.vocoder = Some(VocoderState {
            model_path: path.to_path_buf(),
        });
        debug!(vocoder = %path.display(), "vocoder attached");
        Ok(())
    }

    pub fn is_vocoder_enabled(&self) -> Result<bool> {
        let handle = self.live_ptr("is_vocoder_enabled")?;
        if !self.engine.supports(Capability::Vocoder) {
            return Ok(false);
        }
        Ok(unsafe { self.engine.is_vocoder_enabled(handle) })
    }

    pub fn tts_type(&self) -> Result<TtsType> {
        let handle = self.require(Capability::Vocoder, "tts_type")?;
        Ok(TtsType::from(unsafe { self.engine.get_tts_type(handle) }))
    }

    /// Build the prompt that makes the model speak `text_to_speak`
    ///
    /// `speaker_json` is an optional speaker profile; it must be valid JSON.
    pub fn formatted_audio_completion(&self, speaker_json: Option<&str>, text_to_speak: &str) -> Result<String> {
        let handle = self.require(Capability::Vocoder, "formatted_audio_completion")?;
        if let Some(speaker) = speaker_json {
            serde_json::from_str::<serde_json::Value>(speaker)
                .map_err(|e| CactusError::marshal(format!("speaker profile is not valid JSON: {}", e)))?;
        }
        let c_speaker = marshal::c_string_opt(speaker_json, "speaker profile")?;
        let c_text = marshal::c_string(text_to_speak, "text to speak")?;

        let prompt = unsafe {
            NativeString::new(
                &*self.engine,
                self.engine
                    .get_formatted_audio_completion(handle, marshal::opt_ptr(&c_speaker), c_text.as_ptr()),
            )
        };
        Ok(prompt.to_string_lossy())
    }

    /// Tokens that guide audio-code generation for `text_to_speak`
    pub fn audio_guide_tokens(&self, text_to_speak: &str) -> Result<Vec<TokenId>> {
        let handle = self.require(Capability::Vocoder, "audio_guide_tokens")?;
        let c_text = marshal::c_string(text_to_speak, "text to speak")?;
        let tokens = unsafe {
            NativeTokenArray::new(&*self.engine, self.engine.get_audio_guide_tokens(handle, c_text.as_ptr()))
        };
        Ok(tokens.to_vec())
    }

    /// Constrain the next generation with guide tokens
    pub fn set_guide_tokens(&mut self, tokens: &[TokenId]) -> Result<()> {
        let handle = self.require(Capability::Vocoder, "set_guide_tokens")?;
        let count = marshal::count(tokens.len(), "guide tokens")?;
        unsafe { self.engine.set_guide_tokens(handle, tokens.as_ptr(), count) };
        Ok(())
    }

    /// Decode generated audio codes into PCM samples
    pub fn decode_audio_tokens(&self, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let handle = self.require(Capability::Vocoder, "decode_audio_tokens")?;
        let count = marshal::count(tokens.len(), "audio tokens")?;
        let samples = unsafe {
            NativeFloatArray::new(&*self.engine, self.engine.decode_audio_tokens(handle, tokens.as_ptr(), count))
        };
        Ok(samples.to_vec())
    }

    pub fn release_vocoder(&mut self) -> Result<()> {
        let handle = self.require(Capability::Vocoder, "release_vocoder")?;
        unsafe { self.engine.release_vocoder(handle) };
        if self.extensions.vocoder.take().is_some() {
            debug!("vocoder released");
        }
        Ok(())
    }
}
