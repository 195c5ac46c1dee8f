//! LoRA (Low-Rank Adaptation) adapters for a live context
//!
//! Adapters are applied as a set: each call to
//! [`Context::apply_lora_adapters`] replaces whatever was applied before, and
//! [`Context::remove_lora_adapters`] detaches all of them without touching the
//! base model.

use crate::demarshal::NativeLoraAdapters;
use crate::engine::{Capability, Engine};
use crate::error::{CactusError, Result};
use crate::marshal::LoraAdaptersRecord;
use crate::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A LoRA adapter file and the scale it is applied with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraAdapter {
    pub path: PathBuf,
    /// Scale factor, typically 0.1 to 1.0
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl LoraAdapter {
    pub fn new<P: AsRef<Path>>(path: P, scale: f32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            scale,
        }
    }
}

impl<E: Engine> Context<E> {
    /// Apply a set of adapters, replacing any applied before
    ///
    /// # Example
    /// ```rust,ignore
    /// use cactus::lora::LoraAdapter;
    ///
    /// ctx.apply_lora_adapters(&[LoraAdapter::new("style.gguf", 0.8)])?;
    /// ```
    pub fn apply_lora_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<()> {
        let handle = self.require(Capability::Lora, "apply_lora_adapters")?;
        let record = LoraAdaptersRecord::new(adapters)?;

        if let Some(missing) = adapters.iter().find(|a| !a.path.exists()) {
            return Err(CactusError::MarshallingError(format!(
                "LoRA adapter file not found: {}",
                missing.path.display()
            )));
        }

        let status = unsafe { self.engine.apply_lora_adapters(handle, record.as_ptr(), record.len()) };
        if status != crate::sys::CACTUS_OK {
            warn!(status, count = adapters.len(), "applying LoRA adapters failed");
            return Err(CactusError::NativeCallFailure {
                call: "cactus_apply_lora_adapters_c",
                code: status,
            });
        }

        self.extensions.lora_adapters = adapters.to_vec();
        debug!(count = adapters.len(), "LoRA adapters applied");
        Ok(())
    }

    /// Detach every applied adapter
    pub fn remove_lora_adapters(&mut self) -> Result<()> {
        let handle = self.require(Capability::Lora, "remove_lora_adapters")?;
        unsafe { self.engine.remove_lora_adapters(handle) };
        self.extensions.lora_adapters.clear();
        debug!("LoRA adapters removed");
        Ok(())
    }

    /// Adapters the engine reports as currently applied
    pub fn loaded_lora_adapters(&self) -> Result<Vec<LoraAdapter>> {
        let handle = self.require(Capability::Lora, "loaded_lora_adapters")?;
        let loaded = unsafe { NativeLoraAdapters::new(&*self.engine, self.engine.get_loaded_lora_adapters(handle)) };
        Ok(loaded.to_vec())
    }
}
