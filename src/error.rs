//! Error types shared by every renderer component.

/// Result alias used throughout the crate.
pub type RenderResult<T> = Result<T, RenderError>;

/// Everything that can go wrong while rendering.
///
/// Resource and source errors are usually recovered inside the renderer
/// (placeholder textures, stale caches) and only logged; they are returned
/// from the operations that cannot recover on their own. Misuse errors are
/// always returned immediately.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// A texture, framebuffer or buffer could not be allocated.
    #[error("GPU resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A shader stage failed to compile.
    #[error("shader compile error: {0}")]
    ShaderCompile(String),

    /// A program failed to link.
    #[error("program link error: {0}")]
    ShaderLink(String),

    /// A pixel source exists but its data cannot be used.
    #[error("pixel source {id} is unreadable: {reason}")]
    UnreadableSource {
        /// Identity of the offending [`ImageSource`](crate::ImageSource).
        id: u64,
        /// Human readable cause.
        reason: String,
    },

    /// A cache operation was requested for a node without a cache defined
    /// on this renderer.
    #[error("no cache is defined for this node; call create_cache first")]
    CacheNotDefined,

    /// A texture slot index outside the hardware range was requested.
    #[error("texture slot {index} is outside the acceptable range 0..{limit}")]
    SlotOutOfRange {
        /// Requested slot.
        index: usize,
        /// Number of combined texture units.
        limit: usize,
    },

    /// Every batch slot is protected so no texture can be bound.
    #[error("no unprotected texture slot is available for batching")]
    NoFreeSlot,

    /// The GL context was lost; the renderer cannot continue.
    #[error("GPU context lost")]
    ContextLost,

    /// Image bytes could not be decoded.
    #[error(transparent)]
    Decode(#[from] image::ImageError),
}

impl RenderError {
    /// Shorthand for [`RenderError::ResourceExhausted`].
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Whether the renderer recovers from this error on its own when it
    /// occurs mid-frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted(_) | Self::UnreadableSource { .. } | Self::Decode(_)
        )
    }

    /// Whether this error reports an API contract violation by the caller.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::CacheNotDefined | Self::SlotOutOfRange { .. } | Self::NoFreeSlot
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(RenderError::exhausted("fbo")
            .to_string()
            .contains("GPU resource exhausted:"));
        assert!(RenderError::ShaderCompile("x".into())
            .to_string()
            .contains("shader compile error:"));
        let slot = RenderError::SlotOutOfRange { index: 40, limit: 32 };
        assert_eq!(
            slot.to_string(),
            "texture slot 40 is outside the acceptable range 0..32"
        );
    }

    #[test]
    fn classification() {
        assert!(RenderError::exhausted("x").is_recoverable());
        assert!(!RenderError::exhausted("x").is_misuse());
        assert!(RenderError::CacheNotDefined.is_misuse());
        assert!(!RenderError::ContextLost.is_recoverable());
        assert!(!RenderError::ShaderLink("x".into()).is_recoverable());
    }
}
