//! Renderer configuration and clear-color parsing.

use std::str::FromStr;

/// Default maximum number of cards per draw call.
pub const DEFAULT_MAX_CARDS_PER_BATCH: usize = 10_000;

/// Default number of draws a texture may go unused before
/// [`Renderer::purge_unused`](crate::Renderer::purge_unused) drops it.
pub const DEFAULT_PURGE_THRESHOLD: u64 = 100;

/// Options fixed when a [`Renderer`](crate::Renderer) is created.
///
/// Most of these can be tuned later through the renderer's setters.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Treat texture colors as premultiplied: pixels are premultiplied at
    /// upload and the fragment epilogue divides by alpha again.
    pub premultiplied_alpha: bool,
    /// Use linear filtering for power-of-two textures.
    pub antialias: bool,
    /// Clear the primary output at the start of every frame.
    pub auto_clear: bool,
    /// Cards per draw call before a forced flush.
    pub max_cards_per_batch: usize,
    /// Upper bound on texture units used for batching. `None` uses
    /// whatever the backend reports.
    pub texture_units_hint: Option<usize>,
    /// The renderer is dedicated to producing one cache: cache passes write
    /// to the primary output instead of render textures.
    pub cache_controlled: bool,
    /// Color the output is cleared to.
    pub clear_color: Color,
    /// Default threshold for [`Renderer::purge_unused`](crate::Renderer::purge_unused).
    pub purge_threshold: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            premultiplied_alpha: false,
            antialias: false,
            auto_clear: true,
            max_cards_per_batch: DEFAULT_MAX_CARDS_PER_BATCH,
            texture_units_hint: None,
            cache_controlled: false,
            clear_color: Color::TRANSPARENT,
            purge_threshold: DEFAULT_PURGE_THRESHOLD,
        }
    }
}

/// A straight-alpha RGBA color with components in `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    /// Red.
    pub r: f32,
    /// Green.
    pub g: f32,
    /// Blue.
    pub b: f32,
    /// Alpha.
    pub a: f32,
}

impl Color {
    /// Fully transparent black.
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    /// Creates a color from its components.
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Components as an array.
    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// `0xRRGGBBAA`.
impl From<u32> for Color {
    fn from(value: u32) -> Self {
        let [r, g, b, a] = value.to_be_bytes();
        Self::new(
            f32::from(r) / 255.0,
            f32::from(g) / 255.0,
            f32::from(b) / 255.0,
            f32::from(a) / 255.0,
        )
    }
}

/// Error returned when a color string cannot be parsed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized color {0:?}; expected #rgb, #rrggbb, #rrggbbaa or rgba(r,g,b,a)")]
pub struct ParseColorError(String);

impl FromStr for Color {
    type Err = ParseColorError;

    /// Accepts `#rgb`, `#rrggbb`, `#rrggbbaa` and `rgba(r, g, b, a)` where
    /// `r, g, b` are `0..=255` and `a` is `0..=1`. Hex colors without an
    /// alpha pair are transparent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseColorError(s.to_owned());
        let s = s.trim();

        if let Some(hex) = s.strip_prefix('#') {
            let expanded: String = if hex.len() == 3 {
                hex.chars().flat_map(|c| [c, c]).collect()
            } else {
                hex.to_owned()
            };
            if !matches!(expanded.len(), 6 | 8) || !expanded.is_ascii() {
                return Err(err());
            }
            let channel = |i: usize| -> Result<f32, ParseColorError> {
                expanded
                    .get(i..i + 2)
                    .map_or(Ok(0), |pair| u8::from_str_radix(pair, 16).map_err(|_| err()))
                    .map(|v| f32::from(v) / 255.0)
            };
            return Ok(Self::new(channel(0)?, channel(2)?, channel(4)?, channel(6)?));
        }

        if let Some(body) = s.strip_prefix("rgba(").and_then(|b| b.strip_suffix(')')) {
            let parts: Vec<f32> = body
                .split(',')
                .map(|p| p.trim().parse::<f32>().map_err(|_| err()))
                .collect::<Result<_, _>>()?;
            let [r, g, b, a] = parts[..] else {
                return Err(err());
            };
            return Ok(Self::new(r / 255.0, g / 255.0, b / 255.0, a));
        }

        Err(err())
    }
}
