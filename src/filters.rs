//! Shader filters applied by cache passes.
//!
//! A filter contributes a fragment body (and optionally a vertex body) that
//! is appended to the cover headers from [`shaders`](crate::shaders). The
//! body reads the previous pass from `u_sampler` at `v_texcoord` and writes
//! `frag_color`. Filters may sample extra images through
//! [`inputs`](ShaderFilter::inputs) and run further passes through
//! [`next_pass`](ShaderFilter::next_pass).

use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;

use crate::backend::UniformValue;
use crate::geom::Rect;
use crate::types::ImageSource;

/// Longest chain of passes one filter may expand into.
pub const MAX_CHAINED_PASSES: usize = 8;

/// Size of the render target a filter pass reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterContext {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// An image a filter samples besides the previous pass. It is stretched
/// over the whole surface.
#[derive(Debug, Clone)]
pub struct FilterInput {
    /// `sampler2D` uniform declared by the fragment body.
    pub sampler: &'static str,
    /// Pixels to sample; uploaded through the texture registry.
    pub image: ImageSource,
}

/// A GPU filter.
pub trait ShaderFilter: Debug {
    /// Identifies the generated source; filters producing different
    /// sources must return different keys.
    fn shader_key(&self) -> Cow<'static, str>;

    /// Fragment body appended to the cover fragment header.
    fn fragment_body(&self) -> Cow<'static, str>;

    /// Vertex body replacing the default cover body.
    fn vertex_body(&self) -> Option<Cow<'static, str>> {
        None
    }

    /// Uniforms whose locations should be resolved at compile time.
    fn uniform_names(&self) -> &'static [&'static str] {
        &[]
    }

    /// Uniform values for one pass.
    fn uniforms(&self, _context: &FilterContext) -> Vec<(&'static str, UniformValue)> {
        Vec::new()
    }

    /// How far the filter draws outside the source: `x`/`y` extend the
    /// top-left (usually negative), `width`/`height` grow the size.
    fn padding(&self) -> Rect {
        Rect::default()
    }

    /// Extra images bound on texture units `1..` for this pass.
    fn inputs(&self) -> Vec<FilterInput> {
        Vec::new()
    }

    /// Pass to run right after this one, reading its output.
    fn next_pass(&self) -> Option<Arc<dyn ShaderFilter>> {
        None
    }
}

/// `filters` with every chained [`next_pass`](ShaderFilter::next_pass)
/// spliced in after its filter.
pub fn expand_passes(filters: &[Arc<dyn ShaderFilter>]) -> Vec<Arc<dyn ShaderFilter>> {
    let mut passes = Vec::with_capacity(filters.len());
    for filter in filters {
        passes.push(Arc::clone(filter));
        let mut next = filter.next_pass();
        let mut chained = 0;
        while let Some(pass) = next {
            if chained == MAX_CHAINED_PASSES {
                log::warn!("Filter {} chains too many passes, truncating", filter.shader_key());
                break;
            }
            next = pass.next_pass();
            passes.push(pass);
            chained += 1;
        }
    }
    passes
}

/// Sum of the paddings of `filters`.
pub fn total_padding(filters: &[Arc<dyn ShaderFilter>]) -> Rect {
    filters.iter().fold(Rect::default(), |acc, f| {
        let pad = f.padding();
        Rect::new(
            acc.x + pad.x,
            acc.y + pad.y,
            acc.width + pad.width,
            acc.height + pad.height,
        )
    })
}

const COLOR_FRAGMENT_BODY: &str = r"
uniform vec4 u_color_multiplier;
uniform vec4 u_color_offset;

void main() {
    vec4 color = texture(u_sampler, v_texcoord);
    frag_color = (color * u_color_multiplier) + u_color_offset;
}
";

/// Per-channel multiply and offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorFilter {
    /// Red multiplier.
    pub red_multiplier: f32,
    /// Green multiplier.
    pub green_multiplier: f32,
    /// Blue multiplier.
    pub blue_multiplier: f32,
    /// Alpha multiplier.
    pub alpha_multiplier: f32,
    /// Red offset, `-255..=255`.
    pub red_offset: f32,
    /// Green offset, `-255..=255`.
    pub green_offset: f32,
    /// Blue offset, `-255..=255`.
    pub blue_offset: f32,
    /// Alpha offset, `-255..=255`.
    pub alpha_offset: f32,
}

impl Default for ColorFilter {
    fn default() -> Self {
        Self {
            red_multiplier: 1.0,
            green_multiplier: 1.0,
            blue_multiplier: 1.0,
            alpha_multiplier: 1.0,
            red_offset: 0.0,
            green_offset: 0.0,
            blue_offset: 0.0,
            alpha_offset: 0.0,
        }
    }
}

impl ColorFilter {
    /// Multipliers only.
    pub fn multiply(red: f32, green: f32, blue: f32, alpha: f32) -> Self {
        Self {
            red_multiplier: red,
            green_multiplier: green,
            blue_multiplier: blue,
            alpha_multiplier: alpha,
            ..Self::default()
        }
    }

    /// Same filter with the given offsets.
    #[must_use]
    pub fn with_offsets(self, red: f32, green: f32, blue: f32, alpha: f32) -> Self {
        Self {
            red_offset: red,
            green_offset: green,
            blue_offset: blue,
            alpha_offset: alpha,
            ..self
        }
    }
}

impl ShaderFilter for ColorFilter {
    fn shader_key(&self) -> Cow<'static, str> {
        Cow::Borrowed("color")
    }

    fn fragment_body(&self) -> Cow<'static, str> {
        Cow::Borrowed(COLOR_FRAGMENT_BODY)
    }

    fn uniform_names(&self) -> &'static [&'static str] {
        &["u_color_multiplier", "u_color_offset"]
    }

    fn uniforms(&self, _context: &FilterContext) -> Vec<(&'static str, UniformValue)> {
        vec![
            (
                "u_color_multiplier",
                UniformValue::Vec4([
                    self.red_multiplier,
                    self.green_multiplier,
                    self.blue_multiplier,
                    self.alpha_multiplier,
                ]),
            ),
            (
                "u_color_offset",
                UniformValue::Vec4([
                    self.red_offset / 255.0,
                    self.green_offset / 255.0,
                    self.blue_offset / 255.0,
                    self.alpha_offset / 255.0,
                ]),
            ),
        ]
    }
}

const COLOR_MATRIX_FRAGMENT_BODY: &str = r"
uniform mat4 u_color_matrix;
uniform vec4 u_color_matrix_offset;

void main() {
    vec4 color = texture(u_sampler, v_texcoord);
    frag_color = clamp(u_color_matrix * color + u_color_matrix_offset, 0.0, 1.0);
}
";

/// A 4×5 color matrix: each output channel is a weighted sum of the input
/// channels plus an offset in `0..=255` units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrixFilter {
    /// Row-major `r, g, b, a` rows of `[r, g, b, a, offset]`.
    pub matrix: [f32; 20],
}

impl Default for ColorMatrixFilter {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ColorMatrixFilter {
    /// Leaves colors unchanged.
    pub const IDENTITY: Self = Self {
        matrix: [
            1.0, 0.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0, 0.0,
        ],
    };

    /// Creates a filter from a row-major 4×5 matrix.
    pub const fn new(matrix: [f32; 20]) -> Self {
        Self { matrix }
    }

    /// The linear part as a column-major `mat4`.
    pub fn mat4(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for row in 0..4 {
            for col in 0..4 {
                out[col * 4 + row] = self.matrix[row * 5 + col];
            }
        }
        out
    }

    /// The offset column, normalized to `0..=1`.
    pub fn offset(&self) -> [f32; 4] {
        [0, 1, 2, 3].map(|row| self.matrix[row * 5 + 4] / 255.0)
    }
}

impl ShaderFilter for ColorMatrixFilter {
    fn shader_key(&self) -> Cow<'static, str> {
        Cow::Borrowed("color_matrix")
    }

    fn fragment_body(&self) -> Cow<'static, str> {
        Cow::Borrowed(COLOR_MATRIX_FRAGMENT_BODY)
    }

    fn uniform_names(&self) -> &'static [&'static str] {
        &["u_color_matrix", "u_color_matrix_offset"]
    }

    fn uniforms(&self, _context: &FilterContext) -> Vec<(&'static str, UniformValue)> {
        vec![
            ("u_color_matrix", UniformValue::Mat4(self.mat4())),
            ("u_color_matrix_offset", UniformValue::Vec4(self.offset())),
        ]
    }
}

/// Largest spread (in taps per side) a blur table may have.
const MAX_BLUR_SPREAD: f32 = 32.0;

/// Gaussian falloff at the outermost tap.
const BLUR_EDGE: f32 = 4.2;

const BLUR_FRAGMENT_TEMPLATE: &str = r"
uniform float u_x_weight[{{x_taps}}];
uniform float u_y_weight[{{y_taps}}];
uniform vec2 u_texel;

void main() {
    vec4 color = vec4(0.0);
    float x_adj = (float({{x_taps}}) - 1.0) / 2.0;
    float y_adj = (float({{y_taps}}) - 1.0) / 2.0;

    for (int i = 0; i < {{x_taps}}; i++) {
        for (int j = 0; j < {{y_taps}}; j++) {
            vec2 offset = u_texel * vec2(float(i) - x_adj, float(j) - y_adj);
            color += texture(u_sampler, v_texcoord + offset) * (u_x_weight[i] * u_y_weight[j]);
        }
    }

    frag_color = color;
}
";

/// Separable gaussian blur evaluated in a single pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurFilter {
    /// Horizontal radius in pixels.
    pub blur_x: f32,
    /// Vertical radius in pixels.
    pub blur_y: f32,
    /// Sampling density; more taps per pixel for higher values.
    pub quality: u32,
}

impl BlurFilter {
    /// Creates a blur. Negative radii are treated as zero and quality is
    /// at least one.
    pub fn new(blur_x: f32, blur_y: f32, quality: u32) -> Self {
        Self {
            blur_x: blur_x.max(0.0),
            blur_y: blur_y.max(0.0),
            quality: quality.max(1),
        }
    }

    /// Normalized gaussian weights for one axis; always odd in length.
    pub fn weights(spread: f32) -> Vec<f32> {
        let spread = spread.min(MAX_BLUR_SPREAD);
        if spread <= 1.0 {
            return vec![1.0];
        }
        // Bounded by MAX_BLUR_SPREAD.
        #[expect(clippy::cast_possible_truncation)]
        let mut count = (spread * 2.0).ceil() as i32;
        if count % 2 == 0 {
            count += 1;
        }
        let adjust = count / 2;
        #[expect(clippy::cast_precision_loss)]
        let raw: Vec<f32> = (-adjust..=adjust)
            .map(|i| {
                let x = (i as f32 / adjust as f32) * BLUR_EDGE;
                (-(x * x) / 4.0).exp() / (2.0 * std::f32::consts::PI).sqrt()
            })
            .collect();
        let total: f32 = raw.iter().sum();
        raw.into_iter().map(|w| w / total).collect()
    }

    #[expect(clippy::cast_precision_loss)]
    fn tables(&self) -> (Vec<f32>, Vec<f32>) {
        let q = self.quality as f32;
        (Self::weights(self.blur_x * q), Self::weights(self.blur_y * q))
    }
}

impl ShaderFilter for BlurFilter {
    fn shader_key(&self) -> Cow<'static, str> {
        let (x, y) = self.tables();
        Cow::Owned(format!("blur:{}x{}", x.len(), y.len()))
    }

    fn fragment_body(&self) -> Cow<'static, str> {
        let (x, y) = self.tables();
        Cow::Owned(
            BLUR_FRAGMENT_TEMPLATE
                .replace("{{x_taps}}", &x.len().to_string())
                .replace("{{y_taps}}", &y.len().to_string()),
        )
    }

    fn uniform_names(&self) -> &'static [&'static str] {
        &["u_x_weight", "u_y_weight", "u_texel"]
    }

    #[expect(clippy::cast_precision_loss)]
    fn uniforms(&self, context: &FilterContext) -> Vec<(&'static str, UniformValue)> {
        let (x, y) = self.tables();
        let q = self.quality as f32;
        let texel = [
            1.0 / (context.width.max(1) as f32 * q),
            1.0 / (context.height.max(1) as f32 * q),
        ];
        vec![
            ("u_x_weight", UniformValue::Floats(x)),
            ("u_y_weight", UniformValue::Floats(y)),
            ("u_texel", UniformValue::Vec2(texel)),
        ]
    }

    #[expect(clippy::cast_precision_loss)]
    fn padding(&self) -> Rect {
        if self.blur_x <= 0.0 && self.blur_y <= 0.0 {
            return Rect::default();
        }
        let q = (self.quality as f32).powf(0.2);
        let px = self.blur_x * q + 1.0;
        let py = self.blur_y * q + 1.0;
        Rect::new(-px, -py, 2.0 * px, 2.0 * py)
    }
}

const ALPHA_MAP_FRAGMENT_BODY: &str = r"
uniform sampler2D u_alpha_sampler;

void main() {
    vec4 color = texture(u_sampler, v_texcoord);
    vec4 alpha_map = texture(u_alpha_sampler, v_texcoord);
    // Fully transparent map texels count as black whatever their color.
    float alpha = alpha_map.r * ceil(alpha_map.a);
    frag_color = vec4(clamp(color.rgb / color.a, 0.0, 1.0) * alpha, alpha);
}
";

/// Replaces the alpha channel with the red channel of a greyscale map.
#[derive(Debug, Clone)]
pub struct AlphaMapFilter {
    /// Greyscale map; white keeps a pixel, black hides it.
    pub alpha_map: ImageSource,
}

impl AlphaMapFilter {
    /// Creates the filter.
    pub fn new(alpha_map: ImageSource) -> Self {
        Self { alpha_map }
    }
}

impl ShaderFilter for AlphaMapFilter {
    fn shader_key(&self) -> Cow<'static, str> {
        Cow::Borrowed("alpha_map")
    }

    fn fragment_body(&self) -> Cow<'static, str> {
        Cow::Borrowed(ALPHA_MAP_FRAGMENT_BODY)
    }

    fn inputs(&self) -> Vec<FilterInput> {
        vec![FilterInput {
            sampler: "u_alpha_sampler",
            image: self.alpha_map.clone(),
        }]
    }
}

const DISPLACEMENT_FRAGMENT_BODY: &str = r"
uniform sampler2D u_dudv_sampler;
uniform float u_power;
uniform vec2 u_pixel_adjustment;

void main() {
    vec4 dudv = texture(u_dudv_sampler, v_texcoord);
    vec2 offset = mix(vec2(0.0), dudv.rg - 0.5, dudv.a) * (u_power * u_pixel_adjustment);
    frag_color = texture(u_sampler, v_texcoord + offset);
}
";

/// Shifts every pixel by the red (x) and green (y) channels of a map.
///
/// A channel value of 128 leaves the pixel in place; 0 and 255 move it by
/// `distance` pixels in either direction. The map's alpha scales the shift.
#[derive(Debug, Clone)]
pub struct DisplacementFilter {
    /// Offset map.
    pub map: ImageSource,
    /// Largest shift in pixels.
    pub distance: f32,
}

impl DisplacementFilter {
    /// Default largest shift.
    pub const DEFAULT_DISTANCE: f32 = 128.0;

    /// Creates the filter; a non-finite `distance` falls back to
    /// [`DEFAULT_DISTANCE`](Self::DEFAULT_DISTANCE).
    pub fn new(map: ImageSource, distance: f32) -> Self {
        Self {
            map,
            distance: if distance.is_finite() {
                distance
            } else {
                Self::DEFAULT_DISTANCE
            },
        }
    }
}

impl ShaderFilter for DisplacementFilter {
    fn shader_key(&self) -> Cow<'static, str> {
        Cow::Borrowed("displacement")
    }

    fn fragment_body(&self) -> Cow<'static, str> {
        Cow::Borrowed(DISPLACEMENT_FRAGMENT_BODY)
    }

    fn uniform_names(&self) -> &'static [&'static str] {
        &["u_power", "u_pixel_adjustment"]
    }

    #[expect(clippy::cast_precision_loss)]
    fn uniforms(&self, context: &FilterContext) -> Vec<(&'static str, UniformValue)> {
        // Channels span -0.5..0.5, so one unit of offset is two pixels.
        let adjustment = [
            2.0 / context.width.max(1) as f32,
            2.0 / context.height.max(1) as f32,
        ];
        vec![
            ("u_power", UniformValue::Float(self.distance)),
            ("u_pixel_adjustment", UniformValue::Vec2(adjustment)),
        ]
    }

    fn inputs(&self) -> Vec<FilterInput> {
        vec![FilterInput {
            sampler: "u_dudv_sampler",
            image: self.map.clone(),
        }]
    }
}

const ABERRATION_FRAGMENT_TEMPLATE: &str = r"
uniform vec2 u_color_direction;
uniform vec3 u_channel_multiplier;
uniform float u_original_mix;

void main() {
    vec4 base = texture(u_sampler, v_texcoord);
    vec4 r = texture(u_sampler, v_texcoord + u_color_direction * u_channel_multiplier.r);
    vec4 g = texture(u_sampler, v_texcoord + u_color_direction * u_channel_multiplier.g);
    vec4 b = texture(u_sampler, v_texcoord + u_color_direction * u_channel_multiplier.b);
    float alpha = {{alpha}};
    vec4 result = vec4(
        min(1.0, r.r / (r.a + 0.00001)) * alpha,
        min(1.0, g.g / (g.a + 0.00001)) * alpha,
        min(1.0, b.b / (b.a + 0.00001)) * alpha,
        alpha
    );
    frag_color = mix(result, base, u_original_mix * base.a);
}
";

/// Shifts the red, green and blue channels separately along one direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AberrationFilter {
    /// Horizontal shift in pixels per unit of multiplier.
    pub x_dir: f32,
    /// Vertical shift in pixels per unit of multiplier.
    pub y_dir: f32,
    /// Red shift multiplier.
    pub red_multiplier: f32,
    /// Green shift multiplier.
    pub green_multiplier: f32,
    /// Blue shift multiplier.
    pub blue_multiplier: f32,
    /// How much of the unshifted image shows through, `0..=1`.
    pub original_mix: f32,
    /// Take the largest channel alpha instead of the mean.
    pub alpha_max: bool,
}

impl Default for AberrationFilter {
    fn default() -> Self {
        Self {
            x_dir: 0.0,
            y_dir: 0.0,
            red_multiplier: 0.0,
            green_multiplier: 0.0,
            blue_multiplier: 0.0,
            original_mix: 0.0,
            alpha_max: false,
        }
    }
}

impl AberrationFilter {
    /// Shift along (`x_dir`, `y_dir`) scaled per channel.
    pub fn new(x_dir: f32, y_dir: f32, red: f32, green: f32, blue: f32) -> Self {
        Self {
            x_dir,
            y_dir,
            red_multiplier: red,
            green_multiplier: green,
            blue_multiplier: blue,
            ..Self::default()
        }
    }

    /// Same filter mixing back `amount` of the original, clamped to `0..=1`.
    #[must_use]
    pub fn with_original_mix(self, amount: f32) -> Self {
        Self {
            original_mix: if amount.is_nan() { 0.0 } else { amount.clamp(0.0, 1.0) },
            ..self
        }
    }
}

impl ShaderFilter for AberrationFilter {
    fn shader_key(&self) -> Cow<'static, str> {
        Cow::Borrowed(if self.alpha_max {
            "aberration:max"
        } else {
            "aberration:mean"
        })
    }

    fn fragment_body(&self) -> Cow<'static, str> {
        let alpha = if self.alpha_max {
            "max(r.a, max(g.a, max(b.a, base.a)))"
        } else {
            "(r.a + g.a + b.a) / 3.0"
        };
        Cow::Owned(ABERRATION_FRAGMENT_TEMPLATE.replace("{{alpha}}", alpha))
    }

    fn uniform_names(&self) -> &'static [&'static str] {
        &["u_color_direction", "u_channel_multiplier", "u_original_mix"]
    }

    #[expect(clippy::cast_precision_loss)]
    fn uniforms(&self, context: &FilterContext) -> Vec<(&'static str, UniformValue)> {
        let direction = [
            self.x_dir / context.width.max(1) as f32,
            self.y_dir / context.height.max(1) as f32,
        ];
        vec![
            ("u_color_direction", UniformValue::Vec2(direction)),
            (
                "u_channel_multiplier",
                UniformValue::Vec3([
                    -self.red_multiplier,
                    -self.green_multiplier,
                    -self.blue_multiplier,
                ]),
            ),
            ("u_original_mix", UniformValue::Float(self.original_mix)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTEXT: FilterContext = FilterContext {
        width: 100,
        height: 50,
    };

    #[test]
    fn color_offsets_are_normalized() {
        let filter = ColorFilter::multiply(0.5, 1.0, 1.0, 1.0).with_offsets(255.0, 0.0, 0.0, 0.0);
        let uniforms = filter.uniforms(&CONTEXT);
        assert_eq!(
            uniforms[0],
            ("u_color_multiplier", UniformValue::Vec4([0.5, 1.0, 1.0, 1.0]))
        );
        assert_eq!(
            uniforms[1],
            ("u_color_offset", UniformValue::Vec4([1.0, 0.0, 0.0, 0.0]))
        );
    }

    #[test]
    fn color_matrix_is_column_major() {
        let mut matrix = ColorMatrixFilter::IDENTITY.matrix;
        matrix[1] = 0.25; // red from green
        matrix[4] = 51.0; // red offset
        let filter = ColorMatrixFilter::new(matrix);
        let m = filter.mat4();
        // Column 1 (green input), row 0 (red output).
        assert!((m[4] - 0.25).abs() < f32::EPSILON);
        assert!((m[1]).abs() < f32::EPSILON);
        assert!((filter.offset()[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn blur_weights_are_normalized_and_odd() {
        for spread in [0.5, 2.0, 3.3, 10.0, 500.0] {
            let weights = BlurFilter::weights(spread);
            assert_eq!(weights.len() % 2, 1, "spread {spread}");
            let total: f32 = weights.iter().sum();
            assert!((total - 1.0).abs() < 1e-4, "spread {spread}: {total}");
        }
        assert_eq!(BlurFilter::weights(1.0), vec![1.0]);
        assert_eq!(BlurFilter::weights(500.0).len(), 65);
    }

    #[test]
    fn blur_key_tracks_table_sizes() {
        let small = BlurFilter::new(2.0, 2.0, 1);
        let large = BlurFilter::new(8.0, 2.0, 1);
        assert_ne!(small.shader_key(), large.shader_key());
        assert!(large.fragment_body().contains("u_x_weight[17]"));
    }

    #[test]
    fn paddings_add_up() {
        let filters: Vec<Arc<dyn ShaderFilter>> = vec![
            Arc::new(BlurFilter::new(4.0, 2.0, 1)),
            Arc::new(ColorFilter::default()),
            Arc::new(BlurFilter::new(1.0, 0.0, 1)),
        ];
        let pad = total_padding(&filters);
        assert_eq!(pad, Rect::new(-7.0, -4.0, 14.0, 8.0));
        assert_eq!(BlurFilter::new(0.0, 0.0, 3).padding(), Rect::default());
    }

    #[test]
    fn map_filters_declare_their_sampler() {
        let map = ImageSource::from_rgba(1, 1, vec![128, 128, 0, 255]);
        let alpha = AlphaMapFilter::new(map.clone());
        let inputs = alpha.inputs();
        assert_eq!(inputs.len(), 1);
        assert!(alpha.fragment_body().contains(inputs[0].sampler));

        let displacement = DisplacementFilter::new(map, f32::NAN);
        assert!((displacement.distance - DisplacementFilter::DEFAULT_DISTANCE).abs() < f32::EPSILON);
        assert!(displacement
            .fragment_body()
            .contains(displacement.inputs()[0].sampler));
        assert_eq!(
            displacement.uniforms(&CONTEXT)[1],
            ("u_pixel_adjustment", UniformValue::Vec2([0.02, 0.04]))
        );
    }

    #[test]
    fn aberration_variants_have_distinct_sources() {
        let mean = AberrationFilter::new(4.0, 0.0, 1.0, 0.0, -1.0);
        let max = AberrationFilter {
            alpha_max: true,
            ..mean
        };
        assert_ne!(mean.shader_key(), max.shader_key());
        assert!(max.fragment_body().contains("max(r.a"));
        assert!(!mean.fragment_body().contains("{{"));
        assert_eq!(
            mean.uniforms(&CONTEXT)[1],
            ("u_channel_multiplier", UniformValue::Vec3([-1.0, -0.0, 1.0]))
        );
        assert!((mean.with_original_mix(3.0).original_mix - 1.0).abs() < f32::EPSILON);
    }

    #[derive(Debug)]
    struct Chained(usize);

    impl ShaderFilter for Chained {
        fn shader_key(&self) -> Cow<'static, str> {
            Cow::Owned(format!("chained:{}", self.0))
        }

        fn fragment_body(&self) -> Cow<'static, str> {
            Cow::Borrowed("void main() { frag_color = texture(u_sampler, v_texcoord); }")
        }

        fn next_pass(&self) -> Option<Arc<dyn ShaderFilter>> {
            (self.0 > 0).then(|| Arc::new(Chained(self.0 - 1)) as Arc<dyn ShaderFilter>)
        }
    }

    #[test]
    fn chained_passes_follow_their_filter() {
        let filters: Vec<Arc<dyn ShaderFilter>> =
            vec![Arc::new(Chained(2)), Arc::new(ColorFilter::default())];
        let keys: Vec<_> = expand_passes(&filters).iter().map(|f| f.shader_key()).collect();
        assert_eq!(keys, ["chained:2", "chained:1", "chained:0", "color"]);

        let endless: Vec<Arc<dyn ShaderFilter>> = vec![Arc::new(Chained(usize::MAX))];
        assert_eq!(expand_passes(&endless).len(), MAX_CHAINED_PASSES + 1);
    }
}
