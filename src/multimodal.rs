//! Vision/audio projector attached to a live context

use crate::engine::{Capability, Engine};
use crate::error::{CactusError, Result};
use crate::marshal;
use crate::{Context, MultimodalState};
use std::path::Path;
use tracing::{debug, warn};

impl<E: Engine> Context<E> {
    /// Attach a multimodal projector (`mmproj`) so prompts can reference media
    ///
    /// A non-zero engine status is returned unchanged and leaves the context
    /// as it was.
    pub fn init_multimodal<P: AsRef<Path>>(&mut self, mmproj_path: P, use_gpu: bool) -> Result<()> {
        let handle = self.require(Capability::Multimodal, "init_multimodal")?;
        let path = mmproj_path.as_ref();
        let c_path = marshal::path_c_string(path, "mmproj path")?;

        if !path.exists() {
            return Err(CactusError::MarshallingError(format!(
                "Multimodal projector not found: {}",
                path.display()
            )));
        }

        let status = unsafe { self.engine.init_multimodal(handle, c_path.as_ptr(), use_gpu) };
        if status != crate::sys::CACTUS_OK {
            warn!(status, mmproj = %path.display(), "multimodal init failed");
            return Err(CactusError::NativeCallFailure {
                call: "cactus_init_multimodal_c",
                code: status,
            });
        }

        self.extensions.multimodal = Some(MultimodalState {
            mmproj_path: path.to_path_buf(),
            use_gpu,
        });
        debug!(mmproj = %path.display(), use_gpu, "multimodal attached");
        Ok(())
    }

    pub fn is_multimodal_enabled(&self) -> Result<bool> {
        self.multimodal_query("is_multimodal_enabled", |engine, handle| unsafe {
            engine.is_multimodal_enabled(handle)
        })
    }

    pub fn supports_vision(&self) -> Result<bool> {
        self.multimodal_query("supports_vision", |engine, handle| unsafe { engine.supports_vision(handle) })
    }

    pub fn supports_audio(&self) -> Result<bool> {
        self.multimodal_query("supports_audio", |engine, handle| unsafe { engine.supports_audio(handle) })
    }

    /// Detach the projector; a no-op when none is attached
    pub fn release_multimodal(&mut self) -> Result<()> {
        let handle = self.require(Capability::Multimodal, "release_multimodal")?;
        unsafe { self.engine.release_multimodal(handle) };
        if self.extensions.multimodal.take().is_some() {
            debug!("multimodal released");
        }
        Ok(())
    }

    // Capability queries never fail on a live handle: engines without
    // multimodal support simply report false.
    fn multimodal_query(
        &self,
        call: &'static str,
        query: impl FnOnce(&E, crate::sys::cactus_context_handle_t) -> bool,
    ) -> Result<bool> {
        let handle = self.live_ptr(call)?;
        if !self.engine.supports(Capability::Multimodal) {
            return Ok(false);
        }
        Ok(query(&*self.engine, handle))
    }
}
