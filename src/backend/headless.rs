//! A [`GpuBackend`] without a GPU.
//!
//! Records every call, keeps the last written attribute streams, and models
//! texture contents as 64-bit digests: an upload hashes the pixels, a clear
//! hashes the color, and a draw folds the previous content together with
//! the vertex data, uniforms and the digests of every sampled texture. Two
//! renders producing the same digest issued the same pixels.

use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use super::{GpuBackend, TextureFiltering, TextureUnitLimits, UniformValue, VertexAttribute};
use crate::error::{RenderError, RenderResult};
use crate::shaders::ShaderSource;

/// Texture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadlessTexture(u32);

/// Framebuffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadlessFramebuffer(u32);

/// Program handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadlessProgram(u32);

/// Uniform location: the program plus the uniform name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeadlessUniform {
    program: HeadlessProgram,
    name: Arc<str>,
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `create_texture`.
    CreateTexture(HeadlessTexture),
    /// `delete_texture`.
    DeleteTexture(HeadlessTexture),
    /// `allocate_texture`.
    AllocateTexture {
        /// Texture.
        texture: HeadlessTexture,
        /// Width.
        width: u32,
        /// Height.
        height: u32,
    },
    /// `upload_texture`.
    UploadTexture {
        /// Texture.
        texture: HeadlessTexture,
        /// Width.
        width: u32,
        /// Height.
        height: u32,
        /// Filtering requested.
        filtering: TextureFiltering,
    },
    /// `bind_texture`. Uploads and allocations bind implicitly and are not
    /// recorded as binds.
    BindTexture {
        /// Texture unit.
        unit: usize,
        /// Texture, or `None` to unbind.
        texture: Option<HeadlessTexture>,
    },
    /// `create_framebuffer`.
    CreateFramebuffer(HeadlessFramebuffer),
    /// `delete_framebuffer`.
    DeleteFramebuffer(HeadlessFramebuffer),
    /// `bind_framebuffer`.
    BindFramebuffer(Option<HeadlessFramebuffer>),
    /// `set_viewport`.
    Viewport(u32, u32),
    /// `clear` on the given target.
    Clear(Option<HeadlessFramebuffer>),
    /// `compile_program`; `program` is `None` when compilation failed.
    CompileProgram {
        /// Resulting program.
        program: Option<HeadlessProgram>,
        /// Length of the `u_samplers` array, if declared.
        sampler_count: Option<usize>,
    },
    /// `draw_triangles`; indexes [`HeadlessBackend::draws`].
    Draw(usize),
}

/// Snapshot of one draw call.
#[derive(Debug, Clone)]
pub struct DrawCall {
    /// Program in use.
    pub program: HeadlessProgram,
    /// Target framebuffer; `None` is the primary output.
    pub target: Option<HeadlessFramebuffer>,
    /// Vertices drawn.
    pub vertex_count: usize,
    /// `a_position` stream.
    pub positions: Vec<f32>,
    /// `a_uv` stream.
    pub uvs: Vec<f32>,
    /// `a_texture_index` stream; empty for cover passes.
    pub texture_indices: Vec<f32>,
    /// `a_alpha` stream; empty for cover passes.
    pub alphas: Vec<f32>,
    /// Texture bound to every unit at draw time.
    pub units: Vec<Option<HeadlessTexture>>,
    /// Textures actually read by the draw.
    pub sampled: Vec<HeadlessTexture>,
    /// Whether the program is a full-viewport cover pass.
    pub cover: bool,
    /// Whether blending was enabled.
    pub blending: bool,
    /// Uniforms set on the program, by name.
    pub uniforms: BTreeMap<String, UniformValue>,
}

impl DrawCall {
    /// Number of cards (quads) drawn.
    pub fn cards(&self) -> usize {
        self.vertex_count / 6
    }

    /// Texture sampled by card `card`, from its slot index.
    pub fn card_texture(&self, card: usize) -> Option<HeadlessTexture> {
        let index = *self.texture_indices.get(card * 6)?;
        // Slot indices are small non-negative integers.
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let unit = index.round() as usize;
        self.units.get(unit).copied().flatten()
    }
}

#[derive(Debug)]
struct TextureState {
    width: u32,
    height: u32,
    digest: u64,
}

#[derive(Debug)]
struct ProgramState {
    source: ShaderSource,
    cover: bool,
}

/// Recording [`GpuBackend`] used by tests and tools.
#[derive(Debug)]
pub struct HeadlessBackend {
    limits: TextureUnitLimits,
    next_id: u32,
    textures: HashMap<HeadlessTexture, TextureState>,
    framebuffers: HashMap<HeadlessFramebuffer, HeadlessTexture>,
    programs: HashMap<HeadlessProgram, ProgramState>,
    uniforms: HashMap<HeadlessProgram, BTreeMap<String, UniformValue>>,
    units: Vec<Option<HeadlessTexture>>,
    bound_framebuffer: Option<HeadlessFramebuffer>,
    current_program: Option<HeadlessProgram>,
    attributes: [Vec<f32>; 4],
    reserved_vertices: usize,
    clear_color: [f32; 4],
    viewport: (u32, u32),
    blending: bool,
    screen_digest: u64,
    feedback_loops: usize,
    commands: Vec<Command>,
    draws: Vec<DrawCall>,
    texture_budget: Option<usize>,
    max_sampler_array: Option<usize>,
    failing_shaders: Vec<String>,
    fail_uploads: bool,
    context_lost: bool,
}

fn hash_floats(hasher: &mut DefaultHasher, data: &[f32]) {
    data.len().hash(hasher);
    for value in data {
        value.to_bits().hash(hasher);
    }
}

/// Length of the `u_samplers[N]` declaration in a fragment source.
fn sampler_array_len(fragment: &str) -> Option<usize> {
    let start = fragment.find("u_samplers[")? + "u_samplers[".len();
    let rest = &fragment[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

impl HeadlessBackend {
    /// Creates a backend reporting the given texture unit counts.
    pub fn new(batch_units: usize, combined_units: usize) -> Self {
        let combined = combined_units.max(batch_units).max(1);
        Self {
            limits: TextureUnitLimits {
                batch: batch_units.max(1),
                combined,
            },
            next_id: 1,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            uniforms: HashMap::new(),
            units: vec![None; combined],
            bound_framebuffer: None,
            current_program: None,
            attributes: Default::default(),
            reserved_vertices: 0,
            clear_color: [0.0; 4],
            viewport: (0, 0),
            blending: true,
            screen_digest: 0,
            feedback_loops: 0,
            commands: Vec::new(),
            draws: Vec::new(),
            texture_budget: None,
            max_sampler_array: None,
            failing_shaders: Vec::new(),
            fail_uploads: false,
            context_lost: false,
        }
    }

    /// Fails `create_texture` once `budget` textures are alive.
    #[must_use]
    pub fn with_texture_budget(mut self, budget: usize) -> Self {
        self.texture_budget = Some(budget);
        self
    }

    /// Fails compilation of programs declaring more than `max` samplers.
    #[must_use]
    pub fn with_max_sampler_array(mut self, max: usize) -> Self {
        self.max_sampler_array = Some(max);
        self
    }

    /// Changes the texture budget.
    pub fn set_texture_budget(&mut self, budget: Option<usize>) {
        self.texture_budget = budget;
    }

    /// Makes every upload fail (or succeed again).
    pub fn set_fail_uploads(&mut self, fail: bool) {
        self.fail_uploads = fail;
    }

    /// Fails compilation of any program whose fragment source contains
    /// `pattern`.
    pub fn fail_shaders_containing(&mut self, pattern: impl Into<String>) {
        self.failing_shaders.push(pattern.into());
    }

    /// Simulates a lost context.
    pub fn lose_context(&mut self) {
        self.context_lost = true;
    }

    fn next_handle(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Recorded calls, oldest first.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Recorded draw calls, oldest first.
    pub fn draws(&self) -> &[DrawCall] {
        &self.draws
    }

    /// Forgets recorded commands and draws; GPU state is kept.
    pub fn clear_log(&mut self) {
        self.commands.clear();
        self.draws.clear();
    }

    /// Content digest of the primary output.
    pub fn screen_digest(&self) -> u64 {
        self.screen_digest
    }

    /// Content digest of a texture.
    pub fn texture_digest(&self, texture: HeadlessTexture) -> Option<u64> {
        self.textures.get(&texture).map(|t| t.digest)
    }

    /// Size of a texture's storage.
    pub fn texture_size(&self, texture: HeadlessTexture) -> Option<(u32, u32)> {
        self.textures.get(&texture).map(|t| (t.width, t.height))
    }

    /// Color attachment of a framebuffer.
    pub fn framebuffer_texture(&self, framebuffer: HeadlessFramebuffer) -> Option<HeadlessTexture> {
        self.framebuffers.get(&framebuffer).copied()
    }

    /// Live textures.
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Live framebuffers.
    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    /// Live programs.
    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// Draws that sampled the texture they were writing to.
    pub fn feedback_loops(&self) -> usize {
        self.feedback_loops
    }

    /// Number of pixel uploads recorded.
    pub fn upload_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::UploadTexture { .. }))
            .count()
    }

    /// Number of explicit texture binds recorded.
    pub fn bind_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::BindTexture { .. }))
            .count()
    }

    /// Texture currently bound to `unit`.
    pub fn bound_texture(&self, unit: usize) -> Option<HeadlessTexture> {
        self.units.get(unit).copied().flatten()
    }

    fn set_unit(&mut self, unit: usize, texture: Option<HeadlessTexture>) {
        if let Some(slot) = self.units.get_mut(unit) {
            *slot = texture;
        }
    }

    /// Sampler array lengths of every compile attempt, in order.
    pub fn compile_attempts(&self) -> Vec<Option<usize>> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::CompileProgram { sampler_count, .. } => Some(*sampler_count),
                _ => None,
            })
            .collect()
    }

    /// Current viewport size.
    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    /// Currently bound framebuffer.
    pub fn bound_framebuffer(&self) -> Option<HeadlessFramebuffer> {
        self.bound_framebuffer
    }

    fn target_texture(&self) -> Option<HeadlessTexture> {
        self.bound_framebuffer
            .and_then(|fb| self.framebuffers.get(&fb).copied())
    }

    fn write_target_digest(&mut self, digest: u64) {
        match self.target_texture() {
            Some(texture) => {
                if let Some(state) = self.textures.get_mut(&texture) {
                    state.digest = digest;
                }
            }
            None => self.screen_digest = digest,
        }
    }

    fn target_digest(&self) -> u64 {
        self.target_texture()
            .and_then(|t| self.texture_digest(t))
            .unwrap_or(self.screen_digest)
    }
}

impl GpuBackend for HeadlessBackend {
    type Texture = HeadlessTexture;
    type Framebuffer = HeadlessFramebuffer;
    type Program = HeadlessProgram;
    type UniformLocation = HeadlessUniform;

    fn texture_unit_limits(&self) -> TextureUnitLimits {
        self.limits
    }

    fn is_context_lost(&mut self) -> bool {
        self.context_lost
    }

    fn create_texture(&mut self) -> RenderResult<HeadlessTexture> {
        if self
            .texture_budget
            .is_some_and(|budget| self.textures.len() >= budget)
        {
            return Err(RenderError::exhausted("texture budget exceeded"));
        }
        let texture = HeadlessTexture(self.next_handle());
        self.textures.insert(
            texture,
            TextureState {
                width: 0,
                height: 0,
                digest: 0,
            },
        );
        self.commands.push(Command::CreateTexture(texture));
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: HeadlessTexture) {
        self.textures.remove(&texture);
        for unit in &mut self.units {
            if *unit == Some(texture) {
                *unit = None;
            }
        }
        self.commands.push(Command::DeleteTexture(texture));
    }

    fn allocate_texture(
        &mut self,
        unit: usize,
        texture: HeadlessTexture,
        width: u32,
        height: u32,
        _filtering: TextureFiltering,
    ) -> RenderResult<()> {
        let state = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| RenderError::exhausted("allocate on a deleted texture"))?;
        let mut hasher = DefaultHasher::new();
        ("storage", width, height).hash(&mut hasher);
        state.width = width;
        state.height = height;
        state.digest = hasher.finish();
        self.set_unit(unit, Some(texture));
        self.commands.push(Command::AllocateTexture {
            texture,
            width,
            height,
        });
        Ok(())
    }

    fn upload_texture(
        &mut self,
        unit: usize,
        texture: HeadlessTexture,
        width: u32,
        height: u32,
        pixels: &[u8],
        filtering: TextureFiltering,
    ) -> RenderResult<()> {
        if self.fail_uploads {
            return Err(RenderError::exhausted("upload rejected"));
        }
        let state = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| RenderError::exhausted("upload to a deleted texture"))?;
        let mut hasher = DefaultHasher::new();
        (width, height, pixels).hash(&mut hasher);
        state.width = width;
        state.height = height;
        state.digest = hasher.finish();
        self.set_unit(unit, Some(texture));
        self.commands.push(Command::UploadTexture {
            texture,
            width,
            height,
            filtering,
        });
        Ok(())
    }

    fn bind_texture(&mut self, unit: usize, texture: Option<HeadlessTexture>) {
        self.set_unit(unit, texture);
        self.commands.push(Command::BindTexture { unit, texture });
    }

    fn create_framebuffer(&mut self, texture: HeadlessTexture) -> RenderResult<HeadlessFramebuffer> {
        if !self.textures.contains_key(&texture) {
            return Err(RenderError::exhausted("framebuffer on a deleted texture"));
        }
        let framebuffer = HeadlessFramebuffer(self.next_handle());
        self.framebuffers.insert(framebuffer, texture);
        self.commands.push(Command::CreateFramebuffer(framebuffer));
        Ok(framebuffer)
    }

    fn delete_framebuffer(&mut self, framebuffer: HeadlessFramebuffer) {
        self.framebuffers.remove(&framebuffer);
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
        }
        self.commands.push(Command::DeleteFramebuffer(framebuffer));
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<HeadlessFramebuffer>) {
        self.bound_framebuffer = framebuffer;
        self.commands.push(Command::BindFramebuffer(framebuffer));
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        self.commands.push(Command::Viewport(width, height));
    }

    fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    fn clear(&mut self) {
        let mut hasher = DefaultHasher::new();
        "clear".hash(&mut hasher);
        hash_floats(&mut hasher, &self.clear_color);
        self.viewport.hash(&mut hasher);
        self.write_target_digest(hasher.finish());
        self.commands.push(Command::Clear(self.bound_framebuffer));
    }

    fn set_blending(&mut self, enabled: bool) {
        self.blending = enabled;
    }

    fn compile_program(&mut self, source: &ShaderSource) -> RenderResult<HeadlessProgram> {
        let sampler_count = sampler_array_len(&source.fragment);
        let too_many = matches!(
            (self.max_sampler_array, sampler_count),
            (Some(max), Some(count)) if count > max
        );
        let rejected = self
            .failing_shaders
            .iter()
            .any(|pattern| source.fragment.contains(pattern.as_str()));

        if too_many || rejected {
            self.commands.push(Command::CompileProgram {
                program: None,
                sampler_count,
            });
            return Err(RenderError::ShaderCompile(format!(
                "fragment shader rejected (samplers: {sampler_count:?})"
            )));
        }

        let program = HeadlessProgram(self.next_handle());
        self.programs.insert(
            program,
            ProgramState {
                source: source.clone(),
                cover: !source.vertex.contains(VertexAttribute::TextureIndex.name()),
            },
        );
        self.commands.push(Command::CompileProgram {
            program: Some(program),
            sampler_count,
        });
        Ok(program)
    }

    fn delete_program(&mut self, program: HeadlessProgram) {
        self.programs.remove(&program);
        self.uniforms.remove(&program);
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    fn use_program(&mut self, program: Option<HeadlessProgram>) {
        self.current_program = program;
    }

    fn attribute_location(&self, program: HeadlessProgram, name: &str) -> Option<u32> {
        let state = self.programs.get(&program)?;
        VertexAttribute::ALL
            .into_iter()
            .find(|a| a.name() == name && state.source.vertex.contains(name))
            .and_then(|a| u32::try_from(a.index()).ok())
    }

    fn uniform_location(&self, program: HeadlessProgram, name: &str) -> Option<HeadlessUniform> {
        let state = self.programs.get(&program)?;
        (state.source.vertex.contains(name) || state.source.fragment.contains(name)).then(|| {
            HeadlessUniform {
                program,
                name: name.into(),
            }
        })
    }

    fn set_uniform(&mut self, location: &HeadlessUniform, value: &UniformValue) {
        self.uniforms
            .entry(location.program)
            .or_default()
            .insert(location.name.to_string(), value.clone());
    }

    fn reserve_attributes(&mut self, vertex_count: usize) -> RenderResult<()> {
        self.reserved_vertices = self.reserved_vertices.max(vertex_count);
        Ok(())
    }

    fn write_attribute(&mut self, attribute: VertexAttribute, _location: u32, data: &[f32]) {
        self.attributes[attribute.index()] = data.to_vec();
    }

    fn draw_triangles(&mut self, vertex_count: usize) {
        let Some(program) = self.current_program else {
            log::error!("draw without a program");
            return;
        };
        let cover = self.programs.get(&program).is_some_and(|p| p.cover);

        let stream = |attribute: VertexAttribute| -> Vec<f32> {
            let data = &self.attributes[attribute.index()];
            let len = (vertex_count * attribute.components()).min(data.len());
            data[..len].to_vec()
        };
        let positions = stream(VertexAttribute::Position);
        let uvs = stream(VertexAttribute::Uv);
        let (texture_indices, alphas) = if cover {
            (Vec::new(), Vec::new())
        } else {
            (
                stream(VertexAttribute::TextureIndex),
                stream(VertexAttribute::Alpha),
            )
        };

        let uniforms = self.uniforms.get(&program).cloned().unwrap_or_default();

        // Slot indices are small non-negative integers.
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let mut sampled_units: Vec<usize> = if cover {
            uniforms
                .iter()
                .filter(|(name, _)| name.contains("sampler"))
                .filter_map(|(_, value)| match value {
                    UniformValue::Int(unit) => usize::try_from(*unit).ok(),
                    _ => None,
                })
                .chain([0])
                .collect()
        } else {
            texture_indices.iter().map(|i| i.round() as usize).collect()
        };
        sampled_units.sort_unstable();
        sampled_units.dedup();
        let sampled: Vec<HeadlessTexture> = sampled_units
            .iter()
            .filter_map(|&u| self.units.get(u).copied().flatten())
            .collect();

        if let Some(target) = self.target_texture() {
            if sampled.contains(&target) {
                self.feedback_loops += 1;
            }
        }

        let mut hasher = DefaultHasher::new();
        self.target_digest().hash(&mut hasher);
        if let Some(state) = self.programs.get(&program) {
            state.source.hash(&mut hasher);
        }
        hash_floats(&mut hasher, &positions);
        hash_floats(&mut hasher, &uvs);
        hash_floats(&mut hasher, &texture_indices);
        hash_floats(&mut hasher, &alphas);
        for texture in &sampled {
            self.texture_digest(*texture).hash(&mut hasher);
        }
        for (name, value) in &uniforms {
            name.hash(&mut hasher);
            format!("{value:?}").hash(&mut hasher);
        }
        self.blending.hash(&mut hasher);
        self.write_target_digest(hasher.finish());

        self.draws.push(DrawCall {
            program,
            target: self.bound_framebuffer,
            vertex_count,
            positions,
            uvs,
            texture_indices,
            alphas,
            units: self.units.clone(),
            sampled,
            cover,
            blending: self.blending,
            uniforms,
        });
        self.commands.push(Command::Draw(self.draws.len() - 1));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn source(fragment: &str) -> ShaderSource {
        ShaderSource {
            vertex: "in vec2 a_position; in float a_texture_index;".into(),
            fragment: fragment.into(),
        }
    }

    #[test]
    fn parses_sampler_array_length() {
        assert_eq!(
            sampler_array_len("uniform sampler2D u_samplers[16];"),
            Some(16)
        );
        assert_eq!(sampler_array_len("uniform sampler2D u_sampler;"), None);
    }

    #[test]
    fn sampler_limit_rejects_large_arrays() {
        let mut backend = HeadlessBackend::new(8, 8).with_max_sampler_array(4);
        assert!(backend
            .compile_program(&source("uniform sampler2D u_samplers[8];"))
            .is_err());
        assert!(backend
            .compile_program(&source("uniform sampler2D u_samplers[4];"))
            .is_ok());
        assert_eq!(backend.compile_attempts(), vec![Some(8), Some(4)]);
    }

    #[test]
    fn texture_budget_limits_creation() {
        let mut backend = HeadlessBackend::new(2, 2).with_texture_budget(1);
        let first = backend.create_texture().unwrap();
        assert!(backend.create_texture().is_err());
        backend.delete_texture(first);
        assert!(backend.create_texture().is_ok());
    }

    #[test]
    fn upload_digest_depends_on_pixels() {
        let mut backend = HeadlessBackend::new(2, 2);
        let a = backend.create_texture().unwrap();
        let b = backend.create_texture().unwrap();
        let filtering = TextureFiltering::Nearest;
        backend.upload_texture(0, a, 1, 1, &[1, 2, 3, 4], filtering).unwrap();
        backend.upload_texture(1, b, 1, 1, &[1, 2, 3, 4], filtering).unwrap();
        assert_eq!(backend.texture_digest(a), backend.texture_digest(b));
        backend.upload_texture(1, b, 1, 1, &[4, 3, 2, 1], filtering).unwrap();
        assert_ne!(backend.texture_digest(a), backend.texture_digest(b));
    }

    #[test]
    fn draw_detects_feedback_loop() {
        let mut backend = HeadlessBackend::new(2, 2);
        let texture = backend.create_texture().unwrap();
        let framebuffer = backend.create_framebuffer(texture).unwrap();
        let program = backend
            .compile_program(&ShaderSource {
                vertex: "in vec2 a_position;".into(),
                fragment: "uniform sampler2D u_sampler;".into(),
            })
            .unwrap();
        backend.use_program(Some(program));
        backend.bind_texture(0, Some(texture));
        backend.bind_framebuffer(Some(framebuffer));
        backend.draw_triangles(6);
        assert_eq!(backend.feedback_loops(), 1);
        assert!(backend.draws()[0].cover);
    }
}
