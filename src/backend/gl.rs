//! [`GpuBackend`] over an OpenGL 3.1+ context via [`glow`].

use glow::{HasContext, PixelUnpackData};
use std::sync::Arc;

use super::{GpuBackend, TextureFiltering, TextureUnitLimits, UniformValue, VertexAttribute};
use crate::error::{RenderError, RenderResult};
use crate::shaders::ShaderSource;

/// GL internal format for RGBA8 textures, pre-cast to the `i32` that
/// `tex_image_2d` expects.
#[expect(clippy::cast_possible_wrap)]
const RGBA8_INTERNAL_FORMAT: i32 = glow::RGBA8 as i32;

/// Convert a `u32` to `i32` for GL API calls, saturating.
fn gl_size(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Convert a `usize` count to `i32` for GL API calls, saturating.
fn gl_count(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// `TEXTURE0 + unit`.
fn gl_unit(unit: usize) -> u32 {
    glow::TEXTURE0 + u32::try_from(unit).unwrap_or(0)
}

/// Maps the GL error flag to a [`RenderError`] after an allocation.
fn check_gl_error(gl: &glow::Context, what: &str) -> RenderResult<()> {
    match unsafe { gl.get_error() } {
        glow::NO_ERROR => Ok(()),
        glow::CONTEXT_LOST => Err(RenderError::ContextLost),
        code => Err(RenderError::exhausted(format!("{what}: GL error 0x{code:04X}"))),
    }
}

/// A [`GpuBackend`] that issues real OpenGL calls.
///
/// Owns one vertex array object and four streaming vertex buffers, one per
/// [`VertexAttribute`]. Every trait method assumes the context passed to
/// [`new`](Self::new) is current on the calling thread.
pub struct GlowBackend {
    /// The OpenGL context, shared via [`Arc`] so the application can keep
    /// issuing its own calls.
    gl: Arc<glow::Context>,
    /// Vertex array holding the four attribute bindings.
    vao: glow::VertexArray,
    /// One buffer per [`VertexAttribute`], in [`VertexAttribute::ALL`] order.
    buffers: [glow::Buffer; 4],
    /// Vertex capacity the buffers were last sized for.
    reserved_vertices: usize,
    /// Unit counts queried at creation.
    limits: TextureUnitLimits,
}

impl GlowBackend {
    /// Create a backend for `gl`.
    ///
    /// Sets up the vertex array, the attribute buffers and the blend
    /// function (`SRC_ALPHA, ONE_MINUS_SRC_ALPHA` for color and
    /// `ONE, ONE_MINUS_SRC_ALPHA` for alpha).
    ///
    /// # Safety
    ///
    /// The `gl` context must be current and valid for as long as the
    /// backend is used. The caller must ensure that
    /// [`GpuBackend::destroy`] is called before the context is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::ResourceExhausted`] if the vertex array or
    /// buffers cannot be created.
    pub unsafe fn new(gl: Arc<glow::Context>) -> RenderResult<Self> {
        let (vao, buffers) = unsafe {
            let vao = gl.create_vertex_array().map_err(RenderError::exhausted)?;
            let mut buffers = Vec::with_capacity(4);
            for _ in VertexAttribute::ALL {
                buffers.push(gl.create_buffer().map_err(RenderError::exhausted)?);
            }
            gl.bind_vertex_array(Some(vao));
            gl.enable(glow::BLEND);
            gl.blend_func_separate(
                glow::SRC_ALPHA,
                glow::ONE_MINUS_SRC_ALPHA,
                glow::ONE,
                glow::ONE_MINUS_SRC_ALPHA,
            );
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            (vao, [buffers[0], buffers[1], buffers[2], buffers[3]])
        };

        let limits = unsafe {
            let batch = gl.get_parameter_i32(glow::MAX_TEXTURE_IMAGE_UNITS);
            let combined = gl.get_parameter_i32(glow::MAX_COMBINED_TEXTURE_IMAGE_UNITS);
            TextureUnitLimits {
                batch: usize::try_from(batch).unwrap_or(1).max(1),
                combined: usize::try_from(combined).unwrap_or(1).max(1),
            }
        };
        log::debug!(
            "GL texture units: {} per stage, {} combined",
            limits.batch,
            limits.combined
        );

        Ok(Self {
            gl,
            vao,
            buffers,
            reserved_vertices: 0,
            limits,
        })
    }

    /// The wrapped context.
    pub fn context(&self) -> &Arc<glow::Context> {
        &self.gl
    }

    /// Set filtering and clamp-to-edge wrapping on the texture bound to
    /// `TEXTURE_2D`.
    // GL constant values are small enough that the cast is always safe.
    #[expect(clippy::cast_possible_wrap)]
    unsafe fn set_tex_params(&self, filtering: TextureFiltering) {
        let filter = match filtering {
            TextureFiltering::Linear => glow::LINEAR,
            TextureFiltering::Nearest => glow::NEAREST,
        };
        unsafe {
            let gl = &self.gl;
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter as i32);
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_S,
                glow::CLAMP_TO_EDGE as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_T,
                glow::CLAMP_TO_EDGE as i32,
            );
        }
    }

    /// Compile a single shader stage from source.
    unsafe fn compile_shader(&self, shader_type: u32, source: &str) -> RenderResult<glow::Shader> {
        let gl = &self.gl;
        unsafe {
            let shader = gl
                .create_shader(shader_type)
                .map_err(RenderError::ShaderCompile)?;
            gl.shader_source(shader, source);
            gl.compile_shader(shader);

            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                return Err(RenderError::ShaderCompile(log));
            }

            Ok(shader)
        }
    }
}

impl GpuBackend for GlowBackend {
    type Texture = glow::Texture;
    type Framebuffer = glow::Framebuffer;
    type Program = glow::Program;
    type UniformLocation = glow::UniformLocation;

    fn texture_unit_limits(&self) -> TextureUnitLimits {
        self.limits
    }

    fn is_context_lost(&mut self) -> bool {
        unsafe { self.gl.get_error() == glow::CONTEXT_LOST }
    }

    fn create_texture(&mut self) -> RenderResult<glow::Texture> {
        unsafe { self.gl.create_texture() }.map_err(RenderError::exhausted)
    }

    fn delete_texture(&mut self, texture: glow::Texture) {
        unsafe { self.gl.delete_texture(texture) };
    }

    fn allocate_texture(
        &mut self,
        unit: usize,
        texture: glow::Texture,
        width: u32,
        height: u32,
        filtering: TextureFiltering,
    ) -> RenderResult<()> {
        unsafe {
            let gl = &self.gl;
            gl.active_texture(gl_unit(unit));
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                RGBA8_INTERNAL_FORMAT,
                gl_size(width),
                gl_size(height),
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                PixelUnpackData::Slice(None),
            );
            self.set_tex_params(filtering);
            check_gl_error(gl, "render texture storage")
        }
    }

    fn upload_texture(
        &mut self,
        unit: usize,
        texture: glow::Texture,
        width: u32,
        height: u32,
        pixels: &[u8],
        filtering: TextureFiltering,
    ) -> RenderResult<()> {
        unsafe {
            let gl = &self.gl;
            gl.active_texture(gl_unit(unit));
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                RGBA8_INTERNAL_FORMAT,
                gl_size(width),
                gl_size(height),
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                PixelUnpackData::Slice(Some(pixels)),
            );
            self.set_tex_params(filtering);
            check_gl_error(gl, "texture upload")
        }
    }

    fn bind_texture(&mut self, unit: usize, texture: Option<glow::Texture>) {
        unsafe {
            self.gl.active_texture(gl_unit(unit));
            self.gl.bind_texture(glow::TEXTURE_2D, texture);
        }
    }

    fn create_framebuffer(&mut self, texture: glow::Texture) -> RenderResult<glow::Framebuffer> {
        let gl = &self.gl;
        unsafe {
            let framebuffer = gl.create_framebuffer().map_err(RenderError::exhausted)?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            if status != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(framebuffer);
                return Err(RenderError::exhausted(format!(
                    "framebuffer incomplete: 0x{status:04X}"
                )));
            }
            Ok(framebuffer)
        }
    }

    fn delete_framebuffer(&mut self, framebuffer: glow::Framebuffer) {
        unsafe { self.gl.delete_framebuffer(framebuffer) };
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<glow::Framebuffer>) {
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, framebuffer) };
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        unsafe { self.gl.viewport(0, 0, gl_size(width), gl_size(height)) };
    }

    fn set_clear_color(&mut self, [r, g, b, a]: [f32; 4]) {
        unsafe { self.gl.clear_color(r, g, b, a) };
    }

    fn clear(&mut self) {
        unsafe { self.gl.clear(glow::COLOR_BUFFER_BIT) };
    }

    fn set_blending(&mut self, enabled: bool) {
        unsafe {
            if enabled {
                self.gl.enable(glow::BLEND);
            } else {
                self.gl.disable(glow::BLEND);
            }
        }
    }

    /// The compiled shader objects are detached and deleted after linking,
    /// so only the program handle needs to be cleaned up by the caller.
    fn compile_program(&mut self, source: &ShaderSource) -> RenderResult<glow::Program> {
        let vs = unsafe { self.compile_shader(glow::VERTEX_SHADER, &source.vertex) }?;
        let fs = match unsafe { self.compile_shader(glow::FRAGMENT_SHADER, &source.fragment) } {
            Ok(fs) => fs,
            Err(e) => {
                unsafe { self.gl.delete_shader(vs) };
                return Err(e);
            }
        };

        let gl = &self.gl;
        unsafe {
            let program = gl.create_program().map_err(RenderError::ShaderLink)?;
            gl.attach_shader(program, vs);
            gl.attach_shader(program, fs);
            gl.link_program(program);

            gl.detach_shader(program, vs);
            gl.detach_shader(program, fs);
            gl.delete_shader(vs);
            gl.delete_shader(fs);

            if !gl.get_program_link_status(program) {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(RenderError::ShaderLink(log));
            }

            Ok(program)
        }
    }

    fn delete_program(&mut self, program: glow::Program) {
        unsafe { self.gl.delete_program(program) };
    }

    fn use_program(&mut self, program: Option<glow::Program>) {
        unsafe { self.gl.use_program(program) };
    }

    fn attribute_location(&self, program: glow::Program, name: &str) -> Option<u32> {
        unsafe { self.gl.get_attrib_location(program, name) }
    }

    fn uniform_location(&self, program: glow::Program, name: &str) -> Option<glow::UniformLocation> {
        unsafe { self.gl.get_uniform_location(program, name) }
    }

    fn set_uniform(&mut self, location: &glow::UniformLocation, value: &UniformValue) {
        let gl = &self.gl;
        let location = Some(location);
        unsafe {
            match value {
                UniformValue::Int(v) => gl.uniform_1_i32(location, *v),
                UniformValue::Ints(v) => gl.uniform_1_i32_slice(location, v),
                UniformValue::Float(v) => gl.uniform_1_f32(location, *v),
                UniformValue::Floats(v) => gl.uniform_1_f32_slice(location, v),
                UniformValue::Vec2([x, y]) => gl.uniform_2_f32(location, *x, *y),
                UniformValue::Vec3([x, y, z]) => gl.uniform_3_f32(location, *x, *y, *z),
                UniformValue::Vec4([x, y, z, w]) => gl.uniform_4_f32(location, *x, *y, *z, *w),
                UniformValue::Mat4(m) => gl.uniform_matrix_4_f32_slice(location, false, m),
                UniformValue::Bool(v) => gl.uniform_1_i32(location, i32::from(*v)),
            }
        }
    }

    fn reserve_attributes(&mut self, vertex_count: usize) -> RenderResult<()> {
        if vertex_count <= self.reserved_vertices {
            return Ok(());
        }
        let gl = &self.gl;
        unsafe {
            gl.bind_vertex_array(Some(self.vao));
            for attribute in VertexAttribute::ALL {
                let bytes = vertex_count * attribute.components() * std::mem::size_of::<f32>();
                gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.buffers[attribute.index()]));
                gl.buffer_data_size(glow::ARRAY_BUFFER, gl_count(bytes), glow::DYNAMIC_DRAW);
            }
            gl.bind_buffer(glow::ARRAY_BUFFER, None);
            check_gl_error(gl, "vertex buffers")?;
        }
        self.reserved_vertices = vertex_count;
        Ok(())
    }

    fn write_attribute(&mut self, attribute: VertexAttribute, location: u32, data: &[f32]) {
        let gl = &self.gl;
        unsafe {
            gl.bind_vertex_array(Some(self.vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.buffers[attribute.index()]));
            gl.buffer_sub_data_u8_slice(glow::ARRAY_BUFFER, 0, bytemuck::cast_slice(data));
            gl.enable_vertex_attrib_array(location);
            gl.vertex_attrib_pointer_f32(
                location,
                gl_count(attribute.components()),
                glow::FLOAT,
                false,
                0,
                0,
            );
        }
    }

    fn draw_triangles(&mut self, vertex_count: usize) {
        unsafe {
            self.gl.bind_vertex_array(Some(self.vao));
            self.gl.draw_arrays(glow::TRIANGLES, 0, gl_count(vertex_count));
        }
    }

    /// Deletes the vertex array and attribute buffers.
    fn destroy(&mut self) {
        let gl = &self.gl;
        unsafe {
            gl.bind_vertex_array(None);
            gl.delete_vertex_array(self.vao);
            for buffer in self.buffers {
                gl.delete_buffer(buffer);
            }
        }
        self.reserved_vertices = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_saturate_instead_of_wrapping() {
        assert_eq!(gl_size(640), 640);
        assert_eq!(gl_size(u32::MAX), i32::MAX);
        assert_eq!(gl_count(usize::MAX), i32::MAX);
    }

    #[test]
    fn units_offset_from_texture0() {
        assert_eq!(gl_unit(0), glow::TEXTURE0);
        assert_eq!(gl_unit(7), glow::TEXTURE7);
    }
}
