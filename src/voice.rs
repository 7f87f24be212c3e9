//! Voice masking collaborator.
//!
//! The DSP itself (pitch shift, formant presets) is an external collaborator
//! behind [`VoiceMasker`]; the core only requires that the returned bytes
//! are a valid voice payload. The fan-out uploads the masked payload once
//! and reuses the platform file-id for every later recipient of the same
//! broadcast.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice processing failed: {0}")]
    Processing(String),
}

/// `mask_voice(ogg_bytes) -> (ogg_bytes, duration_seconds)`.
#[async_trait]
pub trait VoiceMasker: Send + Sync {
    async fn mask_voice(&self, ogg: &[u8]) -> Result<(Vec<u8>, u32), VoiceError>;
}

/// Passthrough masker: returns the payload unchanged. Stands in wherever no
/// DSP collaborator is wired up; the caching and fan-out paths are identical.
pub struct PassthroughVoice;

#[async_trait]
impl VoiceMasker for PassthroughVoice {
    async fn mask_voice(&self, ogg: &[u8]) -> Result<(Vec<u8>, u32), VoiceError> {
        Ok((ogg.to_vec(), 0))
    }
}
