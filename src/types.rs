//! Pixel sources consumed by the renderer.
//!
//! An [`ImageSource`] is a cheaply clonable handle to RGBA pixel data that
//! may not have arrived yet. The renderer never stores anything on it; GPU
//! state lives in the [`TextureRegistry`](crate::registry::TextureRegistry)
//! and is matched back to the source by identity and generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::RenderResult;
use crate::geom::{Rect, UvRect};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity under which a source is registered for upload.
///
/// Sources created with [`ImageSource::with_key`] and the same key share
/// one GPU texture (e.g. several handles to the same file).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    /// Shared by every source carrying the same name.
    Named(Arc<str>),
    /// Unique to one source.
    Anonymous(u64),
}

/// A decoded (or pending) RGBA8 image.
#[derive(Clone)]
pub struct ImageSource {
    data: Arc<ImageData>,
}

struct ImageData {
    id: u64,
    key: Option<Arc<str>>,
    state: RwLock<PixelState>,
}

struct PixelState {
    width: u32,
    height: u32,
    /// `None` until the pixels have arrived.
    pixels: Option<Arc<Vec<u8>>>,
    /// Bumped whenever the pixels change; compared against the uploaded
    /// generation to detect stale textures.
    generation: u64,
}

/// Immutable view of a source's pixels taken for upload.
#[derive(Debug, Clone)]
pub struct PixelSnapshot {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Tightly packed RGBA8 rows, top row first.
    pub pixels: Arc<Vec<u8>>,
    /// Generation the pixels belong to.
    pub generation: u64,
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (width, height) = self.size();
        f.debug_struct("ImageSource")
            .field("id", &self.data.id)
            .field("key", &self.data.key)
            .field("size", &(width, height))
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ImageSource {
    fn build(width: u32, height: u32, pixels: Option<Vec<u8>>, key: Option<Arc<str>>) -> Self {
        Self {
            data: Arc::new(ImageData {
                id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
                key,
                state: RwLock::new(PixelState {
                    width,
                    height,
                    pixels: pixels.map(Arc::new),
                    generation: 0,
                }),
            }),
        }
    }

    /// Wraps ready RGBA8 pixel data.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self::build(width, height, Some(pixels), None)
    }

    /// A source whose pixels have not been decoded yet. The renderer skips
    /// it until [`set_pixels`](Self::set_pixels) is called.
    pub fn pending(width: u32, height: u32) -> Self {
        Self::build(width, height, None, None)
    }

    /// Wraps an already decoded `image` buffer.
    pub fn from_image(image: image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self::from_rgba(width, height, image.into_raw())
    }

    /// Decodes PNG or JPEG bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Decode`](crate::RenderError::Decode) when the
    /// bytes are not a supported image.
    pub fn decode(bytes: &[u8]) -> RenderResult<Self> {
        Ok(Self::from_image(image::load_from_memory(bytes)?.to_rgba8()))
    }

    /// Same as this source but registered under a shared name, so every
    /// source with that name maps to one GPU texture.
    #[must_use]
    pub fn with_key(self, key: impl Into<Arc<str>>) -> Self {
        let state = self.read();
        Self::build(
            state.width,
            state.height,
            state.pixels.as_ref().map(|p| p.as_ref().clone()),
            Some(key.into()),
        )
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PixelState> {
        self.data.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PixelState> {
        self.data.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-unique identity of this source.
    pub fn id(&self) -> u64 {
        self.data.id
    }

    /// Registry key for this source.
    pub fn key(&self) -> SourceKey {
        match &self.data.key {
            Some(name) => SourceKey::Named(Arc::clone(name)),
            None => SourceKey::Anonymous(self.data.id),
        }
    }

    /// Declared size in pixels.
    pub fn size(&self) -> (u32, u32) {
        let state = self.read();
        (state.width, state.height)
    }

    /// Whether the pixels are available for upload.
    pub fn is_ready(&self) -> bool {
        self.read().pixels.is_some()
    }

    /// Current generation; changes whenever the pixels are replaced or
    /// invalidated.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Replaces the pixels (and size) and marks the source ready and
    /// invalidated.
    pub fn set_pixels(&self, width: u32, height: u32, pixels: Vec<u8>) {
        let mut state = self.write();
        state.width = width;
        state.height = height;
        state.pixels = Some(Arc::new(pixels));
        state.generation += 1;
    }

    /// Marks the pixels as modified so the next draw re-uploads them.
    pub fn invalidate(&self) {
        self.write().generation += 1;
    }

    /// Snapshot of the pixels for upload, or `None` while pending.
    pub fn snapshot(&self) -> Option<PixelSnapshot> {
        let state = self.read();
        state.pixels.as_ref().map(|pixels| PixelSnapshot {
            width: state.width,
            height: state.height,
            pixels: Arc::clone(pixels),
            generation: state.generation,
        })
    }
}

impl PixelSnapshot {
    /// Checks that the buffer holds exactly `width × height` RGBA pixels.
    pub fn validate(&self) -> Result<(), String> {
        let expected = self.width as usize * self.height as usize * 4;
        if self.width == 0 || self.height == 0 {
            Err(format!("empty image {}x{}", self.width, self.height))
        } else if self.pixels.len() == expected {
            Ok(())
        } else {
            Err(format!(
                "expected {expected} bytes for {}x{}, found {}",
                self.width,
                self.height,
                self.pixels.len()
            ))
        }
    }

    /// Whether both dimensions are powers of two.
    pub fn is_power_of_two(&self) -> bool {
        self.width.is_power_of_two() && self.height.is_power_of_two()
    }
}

/// Returns a premultiplied copy of straight-alpha RGBA8 pixels.
pub fn premultiply_rgba(pixels: &[u8]) -> Vec<u8> {
    let mut out = pixels.to_vec();
    for px in out.chunks_exact_mut(4) {
        let alpha = u16::from(px[3]);
        for channel in &mut px[..3] {
            // Rounded (c * a) / 255; always fits a byte.
            #[expect(clippy::cast_possible_truncation)]
            let scaled = ((u16::from(*channel) * alpha + 127) / 255) as u8;
            *channel = scaled;
        }
    }
    out
}

/// One packed frame of a [`SpriteSheet`].
#[derive(Debug)]
pub struct SpriteFrame {
    /// Image the frame is packed into.
    pub image: ImageSource,
    /// Pixel rectangle inside `image`.
    pub rect: Rect,
    /// Registration point, relative to the frame's top-left.
    pub reg_x: f32,
    /// Registration point, relative to the frame's top-left.
    pub reg_y: f32,
    uv: OnceLock<UvRect>,
}

impl SpriteFrame {
    /// Creates a frame.
    pub fn new(image: ImageSource, rect: Rect, reg_x: f32, reg_y: f32) -> Self {
        Self {
            image,
            rect,
            reg_x,
            reg_y,
            uv: OnceLock::new(),
        }
    }

    /// The frame's normalized rectangle, computed once and then cached.
    ///
    /// While the image has no size yet the full rectangle is returned and
    /// nothing is cached.
    pub fn uv_rect(&self) -> UvRect {
        if let Some(uv) = self.uv.get() {
            return *uv;
        }
        let (width, height) = self.image.size();
        if width == 0 || height == 0 {
            return UvRect::FULL;
        }
        #[expect(clippy::cast_precision_loss)]
        let uv = UvRect::from_pixels(&self.rect, width as f32, height as f32);
        *self.uv.get_or_init(|| uv)
    }

    /// Whether the UV rectangle has already been computed.
    pub fn has_cached_uv(&self) -> bool {
        self.uv.get().is_some()
    }
}

/// A set of frames packed into one or more images.
#[derive(Debug, Default)]
pub struct SpriteSheet {
    /// Frames in playback order.
    pub frames: Vec<SpriteFrame>,
}

impl SpriteSheet {
    /// Creates a sheet from its frames.
    pub fn new(frames: Vec<SpriteFrame>) -> Self {
        Self { frames }
    }

    /// Frame by index.
    pub fn frame(&self, index: usize) -> Option<&SpriteFrame> {
        self.frames.get(index)
    }

    /// Every distinct image referenced by the sheet.
    pub fn images(&self) -> Vec<ImageSource> {
        let mut out: Vec<ImageSource> = Vec::new();
        for frame in &self.frames {
            if !out.iter().any(|i| i.id() == frame.image.id()) {
                out.push(frame.image.clone());
            }
        }
        out
    }

    /// Pre-computes UV rectangles.
    ///
    /// With `target` set and `only_target` true, only that frame is
    /// computed. Returns the UV of `target` (or of the first frame), or the
    /// full rectangle when the sheet is empty.
    pub fn build_uv_rects(&self, target: Option<usize>, only_target: bool) -> UvRect {
        match (target, only_target) {
            (Some(index), true) => {
                if let Some(frame) = self.frames.get(index) {
                    frame.uv_rect();
                }
            }
            _ => {
                for frame in &self.frames {
                    frame.uv_rect();
                }
            }
        }
        self.frames
            .get(target.unwrap_or(0))
            .map_or(UvRect::FULL, SpriteFrame::uv_rect)
    }
}
