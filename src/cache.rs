//! Cache descriptors, layouts and render targets.
//!
//! A cache renders a subtree once into an off-screen surface that is then
//! drawn as a single card. Each cache owns up to two render targets so
//! filter passes can ping-pong between them without ever sampling the
//! texture being written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::GpuBackend;
use crate::filters::{total_padding, ShaderFilter};
use crate::geom::{Matrix2D, QuadBounds, Rect};

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a cache created by [`Renderer::create_cache`](crate::Renderer::create_cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(pub(crate) u64);

impl CacheId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The cached region of a node, in the node's local space.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheDescriptor {
    id: CacheId,
    bounds: Rect,
    scale: f32,
}

impl CacheDescriptor {
    pub(crate) fn new(id: CacheId, bounds: Rect, scale: f32) -> Self {
        Self {
            id,
            bounds,
            scale: sanitize_scale(scale),
        }
    }

    /// Cache identity.
    pub fn id(&self) -> CacheId {
        self.id
    }

    /// Cached region in local coordinates.
    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Surface pixels per local unit.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Changes the cached region; takes effect on the next cache pass.
    pub fn set_bounds(&mut self, bounds: Rect) {
        self.bounds = bounds;
    }

    /// Changes the resolution; takes effect on the next cache pass.
    pub fn set_scale(&mut self, scale: f32) {
        self.scale = sanitize_scale(scale);
    }

    /// Surface geometry for this descriptor with `filters` applied.
    ///
    /// Filter padding is in surface pixels and is added after scaling.
    pub fn layout(&self, filters: &[Arc<dyn ShaderFilter>]) -> CacheLayout {
        let pad = total_padding(filters);
        let scale = self.scale;
        // Sizes are clamped to at least one pixel and are far below u32::MAX.
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let size = |length: f32, pad: f32| ((length * scale).ceil() + pad).max(1.0) as u32;
        CacheLayout {
            offset_x: self.bounds.x * scale + pad.x,
            offset_y: self.bounds.y * scale + pad.y,
            width: size(self.bounds.width, pad.width),
            height: size(self.bounds.height, pad.height),
            scale,
        }
    }
}

fn sanitize_scale(scale: f32) -> f32 {
    if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    }
}

/// Where and how large a cache surface is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheLayout {
    /// Surface x of the local origin, negated.
    pub offset_x: f32,
    /// Surface y of the local origin, negated.
    pub offset_y: f32,
    /// Surface width in pixels.
    pub width: u32,
    /// Surface height in pixels.
    pub height: u32,
    /// Surface pixels per local unit.
    pub scale: f32,
}

impl CacheLayout {
    /// Matrix mapping the node's local space onto the surface.
    pub fn surface_matrix(&self) -> Matrix2D {
        Matrix2D::scale_translate(self.scale, -self.offset_x, -self.offset_y)
    }

    /// Local-space quad the surface covers when drawn as a card.
    pub fn quad(&self) -> QuadBounds {
        #[expect(clippy::cast_precision_loss)]
        let (width, height) = (self.width as f32, self.height as f32);
        let left = self.offset_x / self.scale;
        let top = self.offset_y / self.scale;
        QuadBounds {
            left,
            top,
            right: left + width / self.scale,
            bottom: top + height / self.scale,
        }
    }

    /// Whether `other` needs differently sized targets.
    pub fn size_differs(&self, other: &Self) -> bool {
        self.width != other.width || self.height != other.height
    }
}

/// A texture plus the framebuffer rendering into it.
pub struct RenderTarget<B: GpuBackend> {
    /// Color attachment.
    pub texture: B::Texture,
    /// Framebuffer with `texture` attached.
    pub framebuffer: B::Framebuffer,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl<B: GpuBackend> RenderTarget<B> {
    /// Deletes the framebuffer and its texture.
    pub fn destroy(self, backend: &mut B) {
        backend.delete_framebuffer(self.framebuffer);
        backend.delete_texture(self.texture);
    }
}

/// Renderer-side state of one cache.
pub struct CacheRecord<B: GpuBackend> {
    /// The two ping-pong targets, created on demand.
    pub targets: [Option<RenderTarget<B>>; 2],
    /// Target written by the last no-filter pass; the next pass writes the
    /// other one.
    pub last_target: usize,
    /// Target holding the finished surface, if any.
    pub surface: Option<usize>,
    /// Layout the targets were sized for.
    pub layout: Option<CacheLayout>,
}

impl<B: GpuBackend> Default for CacheRecord<B> {
    fn default() -> Self {
        Self {
            targets: [None, None],
            last_target: 1,
            surface: None,
            layout: None,
        }
    }
}

impl<B: GpuBackend> CacheRecord<B> {
    /// Texture of the finished surface.
    pub fn surface_texture(&self) -> Option<B::Texture> {
        let index = self.surface?;
        self.targets.get(index)?.as_ref().map(|t| t.texture)
    }

    /// Deletes both targets.
    pub fn destroy(&mut self, backend: &mut B) {
        for target in &mut self.targets {
            if let Some(target) = target.take() {
                target.destroy(backend);
            }
        }
        self.surface = None;
        self.layout = None;
    }
}
