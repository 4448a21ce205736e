//! The GPU seam.
//!
//! [`GpuBackend`] is the narrow set of operations the renderer needs from a
//! graphics API, with associated handle types in the manner of
//! [`glow::HasContext`](https://docs.rs/glow). [`GlowBackend`] drives a real
//! OpenGL context; [`HeadlessBackend`] records everything for tests.

#[cfg(feature = "glow")]
mod gl;
mod headless;

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::RenderResult;
use crate::shaders::ShaderSource;

#[cfg(feature = "glow")]
pub use gl::GlowBackend;
pub use headless::{
    Command, DrawCall, HeadlessBackend, HeadlessFramebuffer, HeadlessProgram, HeadlessTexture,
    HeadlessUniform,
};

/// Texture unit counts reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUnitLimits {
    /// Units a fragment shader may sample (`MAX_TEXTURE_IMAGE_UNITS`).
    pub batch: usize,
    /// Units across all stages (`MAX_COMBINED_TEXTURE_IMAGE_UNITS`).
    pub combined: usize,
}

/// Texture sampling filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFiltering {
    /// Bilinear.
    Linear,
    /// Nearest neighbour.
    Nearest,
}

/// One of the four per-vertex attribute streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexAttribute {
    /// `a_position`, two floats.
    Position,
    /// `a_uv`, two floats.
    Uv,
    /// `a_texture_index`, one float.
    TextureIndex,
    /// `a_alpha`, one float.
    Alpha,
}

impl VertexAttribute {
    /// All streams, in buffer order.
    pub const ALL: [Self; 4] = [Self::Position, Self::Uv, Self::TextureIndex, Self::Alpha];

    /// Floats per vertex.
    pub fn components(self) -> usize {
        match self {
            Self::Position | Self::Uv => 2,
            Self::TextureIndex | Self::Alpha => 1,
        }
    }

    /// Attribute name in the shader sources.
    pub fn name(self) -> &'static str {
        match self {
            Self::Position => "a_position",
            Self::Uv => "a_uv",
            Self::TextureIndex => "a_texture_index",
            Self::Alpha => "a_alpha",
        }
    }

    /// Position in [`ALL`](Self::ALL).
    pub fn index(self) -> usize {
        match self {
            Self::Position => 0,
            Self::Uv => 1,
            Self::TextureIndex => 2,
            Self::Alpha => 3,
        }
    }
}

/// A value for a shader uniform.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    /// `int` / `sampler2D`.
    Int(i32),
    /// `int[]` / `sampler2D[]`.
    Ints(Vec<i32>),
    /// `float`.
    Float(f32),
    /// `float[]`.
    Floats(Vec<f32>),
    /// `vec2`.
    Vec2([f32; 2]),
    /// `vec3`.
    Vec3([f32; 3]),
    /// `vec4`.
    Vec4([f32; 4]),
    /// `mat4`, column-major.
    Mat4([f32; 16]),
    /// `bool`.
    Bool(bool),
}

/// Operations the renderer issues against a graphics device.
///
/// Handles are plain copyable ids; the backend owns the objects behind them
/// until the matching `delete_*` call.
pub trait GpuBackend {
    /// Texture handle.
    type Texture: Copy + Eq + Hash + Debug;
    /// Framebuffer handle.
    type Framebuffer: Copy + Eq + Debug;
    /// Linked program handle.
    type Program: Copy + Eq + Debug;
    /// Resolved uniform location.
    type UniformLocation: Clone + Debug;

    /// Texture unit counts.
    fn texture_unit_limits(&self) -> TextureUnitLimits;

    /// Whether the context has been lost.
    fn is_context_lost(&mut self) -> bool {
        false
    }

    /// Creates an empty texture object.
    ///
    /// # Errors
    ///
    /// [`RenderError::ResourceExhausted`](crate::RenderError::ResourceExhausted)
    /// when the device refuses.
    fn create_texture(&mut self) -> RenderResult<Self::Texture>;

    /// Deletes a texture.
    fn delete_texture(&mut self, texture: Self::Texture);

    /// Gives `texture` uninitialized RGBA8 storage of the given size, binding
    /// it to `unit`.
    ///
    /// # Errors
    ///
    /// [`RenderError::ResourceExhausted`](crate::RenderError::ResourceExhausted)
    /// when the storage cannot be allocated.
    fn allocate_texture(
        &mut self,
        unit: usize,
        texture: Self::Texture,
        width: u32,
        height: u32,
        filtering: TextureFiltering,
    ) -> RenderResult<()>;

    /// Uploads tightly packed RGBA8 pixels into `texture`, binding it to
    /// `unit`.
    ///
    /// # Errors
    ///
    /// [`RenderError::ResourceExhausted`](crate::RenderError::ResourceExhausted)
    /// when the upload fails.
    fn upload_texture(
        &mut self,
        unit: usize,
        texture: Self::Texture,
        width: u32,
        height: u32,
        pixels: &[u8],
        filtering: TextureFiltering,
    ) -> RenderResult<()>;

    /// Binds `texture` (or nothing) to `unit`.
    fn bind_texture(&mut self, unit: usize, texture: Option<Self::Texture>);

    /// Creates a framebuffer with `texture` as its color attachment.
    ///
    /// # Errors
    ///
    /// [`RenderError::ResourceExhausted`](crate::RenderError::ResourceExhausted)
    /// when the framebuffer is incomplete.
    fn create_framebuffer(&mut self, texture: Self::Texture) -> RenderResult<Self::Framebuffer>;

    /// Deletes a framebuffer (not its texture).
    fn delete_framebuffer(&mut self, framebuffer: Self::Framebuffer);

    /// Makes `framebuffer` the draw target; `None` is the primary output.
    fn bind_framebuffer(&mut self, framebuffer: Option<Self::Framebuffer>);

    /// Sets the viewport to `0, 0, width, height`.
    fn set_viewport(&mut self, width: u32, height: u32);

    /// Sets the color used by [`clear`](Self::clear).
    fn set_clear_color(&mut self, color: [f32; 4]);

    /// Clears the bound target.
    fn clear(&mut self);

    /// Enables or disables alpha blending.
    fn set_blending(&mut self, enabled: bool);

    /// Compiles and links a program.
    ///
    /// # Errors
    ///
    /// [`RenderError::ShaderCompile`](crate::RenderError::ShaderCompile) or
    /// [`RenderError::ShaderLink`](crate::RenderError::ShaderLink) with the
    /// driver log.
    fn compile_program(&mut self, source: &ShaderSource) -> RenderResult<Self::Program>;

    /// Deletes a program.
    fn delete_program(&mut self, program: Self::Program);

    /// Makes `program` current.
    fn use_program(&mut self, program: Option<Self::Program>);

    /// Location of a vertex attribute, if the program uses it.
    fn attribute_location(&self, program: Self::Program, name: &str) -> Option<u32>;

    /// Location of a uniform, if the program uses it.
    fn uniform_location(&self, program: Self::Program, name: &str)
        -> Option<Self::UniformLocation>;

    /// Sets a uniform on the current program.
    fn set_uniform(&mut self, location: &Self::UniformLocation, value: &UniformValue);

    /// Sizes the attribute buffers for `vertex_count` vertices.
    ///
    /// # Errors
    ///
    /// [`RenderError::ResourceExhausted`](crate::RenderError::ResourceExhausted)
    /// when the buffers cannot be allocated.
    fn reserve_attributes(&mut self, vertex_count: usize) -> RenderResult<()>;

    /// Streams `data` into `attribute`'s buffer and points `location` at it.
    fn write_attribute(&mut self, attribute: VertexAttribute, location: u32, data: &[f32]);

    /// Draws `vertex_count` vertices as triangles.
    fn draw_triangles(&mut self, vertex_count: usize);

    /// Releases objects the backend created for itself.
    fn destroy(&mut self) {}
}
