//! GLSL shader sources, template expansion and the program cache.
//!
//! All shaders target GLSL 1.40 (OpenGL 3.1), which is widely supported on
//! desktop platforms.
//!
//! The regular program samples one of `N` textures per fragment, picked by
//! the per-vertex texture index through an `if / else if` chain; `N` is the
//! number of batch slots. Cover programs draw one full-viewport quad from a
//! single sampler and are the base of every filter program.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::backend::{GpuBackend, UniformValue, VertexAttribute};
use crate::error::RenderResult;
use crate::filters::ShaderFilter;

/// Vertex shader for batched cards.
///
/// # Uniforms
///
/// | Name           | Type    | Description                                  |
/// |----------------|---------|----------------------------------------------|
/// | `u_resolution` | `vec2`  | Target size in pixels                        |
/// | `u_y_sign`     | `float` | `-1` for the primary output, `1` for targets |
pub const REGULAR_VERTEX_SRC: &str = r"#version 140

in vec2 a_position;
in vec2 a_uv;
in float a_texture_index;
in float a_alpha;

uniform vec2 u_resolution;
uniform float u_y_sign;

out vec2 v_texcoord;
out float v_texture_index;
out float v_alpha;

void main() {
    // Convert from [0, resolution] to [-1, 1]; render targets keep the
    // first row at the bottom so they sample like uploaded images.
    vec2 ndc = (a_position / u_resolution) * 2.0 - 1.0;
    ndc.y *= u_y_sign;

    gl_Position = vec4(ndc, 0.0, 1.0);
    v_texcoord = a_uv;
    v_texture_index = a_texture_index;
    v_alpha = a_alpha;
}
";

/// Fragment template for batched cards.
///
/// `{{count}}` is the sampler array length, `{{alternates}}` the
/// `else if` branches for slots `1..count` and `{{epilogue}}` the final
/// color write.
pub const REGULAR_FRAGMENT_TEMPLATE: &str = r"#version 140

in vec2 v_texcoord;
in float v_texture_index;
in float v_alpha;

uniform sampler2D u_samplers[{{count}}];

out vec4 frag_color;

void main() {
    int src = int(v_texture_index + 0.5);
    vec4 color = vec4(1.0, 0.0, 0.0, 1.0);

    if (src == 0) {
        color = texture(u_samplers[0], v_texcoord);
    }{{alternates}}

    {{epilogue}}
}
";

/// Epilogue for premultiplied textures: undo the premultiplication, then
/// apply the card alpha.
pub const PREMULTIPLIED_EPILOGUE: &str = "frag_color = vec4(color.a > 0.0 ? clamp(color.rgb / color.a, 0.0, 1.0) : vec3(0.0), color.a * v_alpha);";

/// Epilogue for straight-alpha textures.
pub const STRAIGHT_EPILOGUE: &str = "frag_color = vec4(color.rgb, color.a * v_alpha);";

/// Vertex header shared by cover and filter programs.
///
/// # Uniforms
///
/// | Name       | Type   | Description                                 |
/// |------------|--------|---------------------------------------------|
/// | `u_flip_y` | `bool` | Flip V when blitting onto the primary output |
pub const COVER_VERTEX_HEADER: &str = r"#version 140

in vec2 a_position;
in vec2 a_uv;

uniform bool u_flip_y;

out vec2 v_texcoord;
";

/// Default cover vertex body.
pub const COVER_VERTEX_BODY: &str = r"
void main() {
    gl_Position = vec4(a_position, 0.0, 1.0);
    v_texcoord = u_flip_y ? vec2(a_uv.x, 1.0 - a_uv.y) : a_uv;
}
";

/// Fragment header shared by cover and filter programs. The source texture
/// is always bound to unit 0.
pub const COVER_FRAGMENT_HEADER: &str = r"#version 140

in vec2 v_texcoord;

uniform sampler2D u_sampler;

out vec4 frag_color;
";

/// Default cover fragment body: a straight copy.
pub const COVER_FRAGMENT_BODY: &str = r"
void main() {
    frag_color = texture(u_sampler, v_texcoord);
}
";

/// Full-viewport quad in NDC, as two triangles (TL, TR, BL, TR, BR, BL).
pub const COVER_POSITIONS: [f32; 12] = [
    -1.0, 1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0,
];

/// UVs for [`COVER_POSITIONS`]: each vertex samples the texel under it.
pub const COVER_UVS: [f32; 12] = [
    0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0,
];

/// Which program to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderVariant {
    /// Batched cards with a sampler array.
    Regular,
    /// Single-sampler full-viewport copy.
    Cover,
    /// Cover header plus a filter's bodies.
    Filter {
        /// Cache key; equal keys must mean equal sources.
        key: String,
        /// Replaces [`COVER_VERTEX_BODY`] when set.
        vertex_body: Option<String>,
        /// Replaces [`COVER_FRAGMENT_BODY`].
        fragment_body: String,
    },
}

/// Expanded vertex and fragment sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderSource {
    /// Vertex stage.
    pub vertex: String,
    /// Fragment stage.
    pub fragment: String,
}

/// `else if` branches sampling slots `1..count`.
fn alternates(count: usize) -> String {
    let mut out = String::new();
    for i in 1..count {
        // Writing to a String cannot fail.
        let _ = write!(
            out,
            " else if (src == {i}) {{\n        color = texture(u_samplers[{i}], v_texcoord);\n    }}"
        );
    }
    out
}

/// Builds the sources for `variant`.
///
/// `unit_count` (at least 1) and `premultiplied` only affect the regular
/// variant.
pub fn build_source(variant: &ShaderVariant, unit_count: usize, premultiplied: bool) -> ShaderSource {
    match variant {
        ShaderVariant::Regular => {
            let count = unit_count.max(1);
            let epilogue = if premultiplied {
                PREMULTIPLIED_EPILOGUE
            } else {
                STRAIGHT_EPILOGUE
            };
            ShaderSource {
                vertex: REGULAR_VERTEX_SRC.to_owned(),
                fragment: REGULAR_FRAGMENT_TEMPLATE
                    .replace("{{count}}", &count.to_string())
                    .replace("{{alternates}}", &alternates(count))
                    .replace("{{epilogue}}", epilogue),
            }
        }
        ShaderVariant::Cover => ShaderSource {
            vertex: format!("{COVER_VERTEX_HEADER}{COVER_VERTEX_BODY}"),
            fragment: format!("{COVER_FRAGMENT_HEADER}{COVER_FRAGMENT_BODY}"),
        },
        ShaderVariant::Filter {
            vertex_body,
            fragment_body,
            ..
        } => ShaderSource {
            vertex: format!(
                "{COVER_VERTEX_HEADER}{}",
                vertex_body.as_deref().unwrap_or(COVER_VERTEX_BODY)
            ),
            fragment: format!("{COVER_FRAGMENT_HEADER}{fragment_body}"),
        },
    }
}

/// Identity of a compiled program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    /// `None` for regular and cover programs, the filter key otherwise.
    pub filter: Option<String>,
    /// Sampler array length; 0 for cover and filter programs.
    pub units: usize,
    /// Premultiplied epilogue (regular programs only).
    pub premultiplied: bool,
}

impl ProgramKey {
    /// Key of a regular program.
    pub fn regular(units: usize, premultiplied: bool) -> Self {
        Self {
            filter: None,
            units: units.max(1),
            premultiplied,
        }
    }

    /// Key of the cover program.
    pub fn cover() -> Self {
        Self {
            filter: None,
            units: 0,
            premultiplied: false,
        }
    }

    /// Key of a filter program.
    pub fn filter(key: impl Into<String>) -> Self {
        Self {
            filter: Some(key.into()),
            units: 0,
            premultiplied: false,
        }
    }

    /// Whether this is a full-viewport (cover or filter) program.
    pub fn is_cover(&self) -> bool {
        self.units == 0
    }
}

/// A linked program and its resolved locations.
pub struct ShaderProgram<B: GpuBackend> {
    /// Program handle.
    pub program: B::Program,
    /// Cache key.
    pub key: ProgramKey,
    /// Attribute locations, in [`VertexAttribute::ALL`] order.
    pub attributes: [Option<u32>; 4],
    /// `u_resolution`.
    pub resolution: Option<B::UniformLocation>,
    /// `u_y_sign`.
    pub y_sign: Option<B::UniformLocation>,
    /// `u_flip_y`.
    pub flip_y: Option<B::UniformLocation>,
    /// Filter-specific uniforms by name.
    pub extra: HashMap<&'static str, B::UniformLocation>,
}

impl<B: GpuBackend> ShaderProgram<B> {
    /// Location of `attribute`, if the program reads it.
    pub fn attribute(&self, attribute: VertexAttribute) -> Option<u32> {
        self.attributes[attribute.index()]
    }
}

/// Compiled programs by [`ProgramKey`].
pub struct ShaderCache<B: GpuBackend> {
    programs: HashMap<ProgramKey, ShaderProgram<B>>,
}

impl<B: GpuBackend> Default for ShaderCache<B> {
    fn default() -> Self {
        Self {
            programs: HashMap::new(),
        }
    }
}

impl<B: GpuBackend> ShaderCache<B> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached programs.
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Cached program by key.
    pub fn get(&self, key: &ProgramKey) -> Option<&ShaderProgram<B>> {
        self.programs.get(key)
    }

    /// The regular program for `units` slots.
    ///
    /// When compilation fails the unit count is lowered by four (never
    /// below one) and compilation retried; check the returned program's
    /// `key.units` for the count actually used.
    ///
    /// # Errors
    ///
    /// Returns the compile or link error once a single unit fails too.
    pub fn regular(
        &mut self,
        backend: &mut B,
        units: usize,
        premultiplied: bool,
    ) -> RenderResult<&ShaderProgram<B>> {
        let mut units = units.max(1);
        loop {
            let key = ProgramKey::regular(units, premultiplied);
            if self.programs.contains_key(&key) {
                return Ok(&self.programs[&key]);
            }
            match Self::compile(backend, &ShaderVariant::Regular, key.clone(), &[]) {
                Ok(program) => {
                    self.programs.insert(key.clone(), program);
                    return Ok(&self.programs[&key]);
                }
                Err(e) if units > 1 => {
                    let reduced = units.saturating_sub(4).max(1);
                    log::debug!("regular shader failed with {units} units, retrying with {reduced}: {e}");
                    units = reduced;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The cover (blit) program.
    ///
    /// # Errors
    ///
    /// Returns the compile or link error.
    pub fn cover(&mut self, backend: &mut B) -> RenderResult<&ShaderProgram<B>> {
        let key = ProgramKey::cover();
        if !self.programs.contains_key(&key) {
            let program = Self::compile(backend, &ShaderVariant::Cover, key.clone(), &[])?;
            self.programs.insert(key.clone(), program);
        }
        Ok(&self.programs[&key])
    }

    /// The program for `filter`, compiled on first use.
    ///
    /// # Errors
    ///
    /// Returns the compile or link error.
    pub fn filter(
        &mut self,
        backend: &mut B,
        filter: &dyn ShaderFilter,
    ) -> RenderResult<&ShaderProgram<B>> {
        let key = ProgramKey::filter(filter.shader_key());
        if !self.programs.contains_key(&key) {
            let variant = ShaderVariant::Filter {
                key: filter.shader_key().into_owned(),
                vertex_body: filter.vertex_body().map(std::borrow::Cow::into_owned),
                fragment_body: filter.fragment_body().into_owned(),
            };
            let names: Vec<&'static str> = filter
                .uniform_names()
                .iter()
                .copied()
                .chain(filter.inputs().iter().map(|input| input.sampler))
                .collect();
            let program = Self::compile(backend, &variant, key.clone(), &names)?;
            self.programs.insert(key.clone(), program);
        }
        Ok(&self.programs[&key])
    }

    fn compile(
        backend: &mut B,
        variant: &ShaderVariant,
        key: ProgramKey,
        uniform_names: &[&'static str],
    ) -> RenderResult<ShaderProgram<B>> {
        let source = build_source(variant, key.units, key.premultiplied);
        let program = backend.compile_program(&source)?;

        let attributes =
            VertexAttribute::ALL.map(|a| backend.attribute_location(program, a.name()));
        let extra = uniform_names
            .iter()
            .filter_map(|&name| backend.uniform_location(program, name).map(|loc| (name, loc)))
            .collect();

        // Sampler bindings never change, so they are set once here.
        backend.use_program(Some(program));
        if key.is_cover() {
            if let Some(sampler) = backend.uniform_location(program, "u_sampler") {
                backend.set_uniform(&sampler, &UniformValue::Int(0));
            }
        } else if let Some(samplers) = backend.uniform_location(program, "u_samplers") {
            let units = (0..key.units)
                .map(|i| i32::try_from(i).unwrap_or(i32::MAX))
                .collect();
            backend.set_uniform(&samplers, &UniformValue::Ints(units));
        }

        Ok(ShaderProgram {
            program,
            resolution: backend.uniform_location(program, "u_resolution"),
            y_sign: backend.uniform_location(program, "u_y_sign"),
            flip_y: backend.uniform_location(program, "u_flip_y"),
            attributes,
            extra,
            key,
        })
    }

    /// Deletes every program.
    pub fn destroy(&mut self, backend: &mut B) {
        for (_, program) in self.programs.drain() {
            backend.delete_program(program.program);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::filters::ColorFilter;

    #[test]
    fn regular_source_expands_placeholders() {
        let source = build_source(&ShaderVariant::Regular, 3, false);
        assert!(source.fragment.contains("uniform sampler2D u_samplers[3];"));
        assert!(source.fragment.contains("src == 1"));
        assert!(source.fragment.contains("texture(u_samplers[2], v_texcoord)"));
        assert!(!source.fragment.contains("src == 3"));
        assert!(source.fragment.contains(STRAIGHT_EPILOGUE));
        assert!(!source.fragment.contains("{{"));
    }

    #[test]
    fn premultiplied_epilogue_divides_by_alpha() {
        let source = build_source(&ShaderVariant::Regular, 1, true);
        assert!(source.fragment.contains("color.rgb / color.a"));
        assert!(!source.fragment.contains("else if"));
    }

    #[test]
    fn build_source_is_deterministic() {
        assert_eq!(
            build_source(&ShaderVariant::Regular, 16, true),
            build_source(&ShaderVariant::Regular, 16, true)
        );
    }

    #[test]
    fn filter_source_uses_cover_header() {
        let variant = ShaderVariant::Filter {
            key: "x".into(),
            vertex_body: None,
            fragment_body: "void main() { frag_color = vec4(1.0); }".into(),
        };
        let source = build_source(&variant, 8, false);
        assert!(source.vertex.contains("u_flip_y"));
        assert!(source.vertex.contains(COVER_VERTEX_BODY));
        assert!(source.fragment.starts_with(COVER_FRAGMENT_HEADER));
        assert!(!source.fragment.contains("u_samplers"));
    }

    #[test]
    fn regular_retries_with_fewer_units() {
        let mut backend = HeadlessBackend::new(16, 16).with_max_sampler_array(8);
        let mut cache = ShaderCache::new();
        let program = cache.regular(&mut backend, 16, false).unwrap();
        assert_eq!(program.key.units, 8);
        assert_eq!(backend.compile_attempts(), vec![Some(16), Some(12), Some(8)]);
    }

    #[test]
    fn regular_fails_when_one_unit_fails() {
        let mut backend = HeadlessBackend::new(4, 4).with_max_sampler_array(0);
        let mut cache = ShaderCache::new();
        assert!(cache.regular(&mut backend, 4, false).is_err());
        assert_eq!(backend.compile_attempts(), vec![Some(4), Some(1)]);
    }

    #[test]
    fn programs_are_cached_by_key() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut cache = ShaderCache::new();
        cache.regular(&mut backend, 4, false).unwrap();
        cache.regular(&mut backend, 4, false).unwrap();
        cache.cover(&mut backend).unwrap();
        cache.filter(&mut backend, &ColorFilter::default()).unwrap();
        cache.filter(&mut backend, &ColorFilter::default()).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(backend.live_programs(), 3);

        let cover = cache.get(&ProgramKey::cover()).unwrap();
        assert!(cover.flip_y.is_some());
        assert!(cover.attribute(VertexAttribute::TextureIndex).is_none());

        cache.destroy(&mut backend);
        assert_eq!(backend.live_programs(), 0);
    }
}
