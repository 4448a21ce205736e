//! Render-to-texture passes for caches and filters.
//!
//! A cache pass draws a subtree in its local space (scaled and offset by
//! the cache layout) into one of the cache's two render targets. Filters
//! then run as full-viewport cover passes that read one target and write
//! the other; extra filter images sit on units `1..`. The last written
//! target becomes the cache surface, or is blitted onto the primary output
//! when the renderer is cache-controlled.
//!
//! Everything the walker relies on (slot table, protected flags, bound
//! target, phase) is saved before a pass and restored afterwards, on
//! failure too.

use std::sync::Arc;

use crate::allocator::{SlotKey, SlotSnapshot};
use crate::backend::{GpuBackend, TextureFiltering, UniformValue, VertexAttribute};
use crate::cache::{CacheDescriptor, CacheId, CacheLayout, CacheRecord, RenderTarget};
use crate::error::{RenderError, RenderResult};
use crate::filters::{expand_passes, FilterContext, ShaderFilter};
use crate::geom::Rect;
use crate::node::DrawableNode;
use crate::render::{ActiveTarget, DrawPhase, Renderer, WalkContext};
use crate::shaders::{ShaderProgram, COVER_POSITIONS, COVER_UVS};
use crate::types::ImageSource;

const COVER_VERTICES: usize = 6;

struct SavedState<B: GpuBackend> {
    slots: SlotSnapshot,
    target: ActiveTarget<B>,
    phase: DrawPhase,
}

impl<B: GpuBackend> Renderer<B> {
    /// Define a cache covering `bounds` (node-local coordinates) at `scale`
    /// surface pixels per unit. Nothing is allocated until the first
    /// [`cache_subtree`](Self::cache_subtree).
    pub fn create_cache(&mut self, bounds: Rect, scale: f32) -> CacheDescriptor {
        let descriptor = CacheDescriptor::new(CacheId::next(), bounds, scale);
        self.caches.insert(descriptor.id(), CacheRecord::default());
        descriptor
    }

    /// Render `node` and its subtree into the cache described by
    /// `descriptor`, then apply `filters` in order.
    ///
    /// The node's own transform, alpha and visibility are not applied;
    /// they take effect when the cached node is drawn. Caches nested in
    /// the subtree are drawn from their surfaces.
    ///
    /// # Errors
    ///
    /// - [`RenderError::CacheNotDefined`] if `descriptor` was not created
    ///   by this renderer or was uncached.
    /// - [`RenderError::ResourceExhausted`] if the render targets cannot be
    ///   allocated; the previous surface is kept.
    /// - [`RenderError::ContextLost`] and [`RenderError::NoFreeSlot`] as
    ///   for regular draws.
    pub fn cache_subtree(
        &mut self,
        node: &dyn DrawableNode,
        filters: &[Arc<dyn ShaderFilter>],
        descriptor: &CacheDescriptor,
    ) -> RenderResult<()> {
        self.ensure_context()?;
        let id = descriptor.id();
        if !self.caches.contains_key(&id) {
            return Err(RenderError::CacheNotDefined);
        }
        self.flush("cacheStart")?;

        let saved = self.enter_cache_pass();
        let result = self.run_cache_pass(node, filters, id, descriptor.layout(filters));
        self.leave_cache_pass(saved);
        result
    }

    /// Re-render the cache defined on `node` with the node's filters.
    ///
    /// # Errors
    ///
    /// [`RenderError::CacheNotDefined`] when the node has no cache, plus
    /// everything [`cache_subtree`](Self::cache_subtree) returns.
    pub fn update_cache(&mut self, node: &dyn DrawableNode) -> RenderResult<()> {
        let descriptor = node.cache().ok_or(RenderError::CacheNotDefined)?;
        self.cache_subtree(node, node.filters(), descriptor)
    }

    /// Free both render targets of a cache and forget it. Returns the
    /// number of textures deleted.
    pub fn uncache(&mut self, id: CacheId) -> usize {
        let Some(mut record) = self.caches.remove(&id) else {
            return 0;
        };
        for index in 0..record.targets.len() {
            self.allocator.remove(SlotKey::Surface(id, index));
        }
        for target in record.targets.iter().flatten() {
            self.forget_texture(target.texture);
        }
        let released = record.targets.iter().flatten().count();
        record.destroy(&mut self.backend);
        released
    }

    /// Texture holding the finished surface of a cache.
    pub fn cache_surface(&self, id: CacheId) -> Option<B::Texture> {
        self.caches.get(&id)?.surface_texture()
    }

    /// Layout of the current surface, or of the last pass written to the
    /// primary output.
    pub fn cache_layout(&self, id: CacheId) -> Option<CacheLayout> {
        self.caches.get(&id)?.layout
    }

    fn enter_cache_pass(&mut self) -> SavedState<B> {
        let saved = SavedState {
            slots: self.allocator.snapshot(),
            target: self.target,
            phase: self.phase,
        };
        // The last unit hosts render-target bindings during the pass. With a
        // single unit it stays the batch slot and gets rebound on flush.
        let reserved = self.allocator.combined_units().saturating_sub(1);
        if reserved > 0 {
            self.allocator.protect(reserved, true);
        }
        self.allocator.reset();
        self.sync_registry_slots();
        saved
    }

    fn leave_cache_pass(&mut self, saved: SavedState<B>) {
        self.allocator.restore(saved.slots);
        self.sync_registry_slots();
        self.bound.fill(None);
        self.backend.set_blending(true);
        self.bind_target(saved.target);
        self.phase = saved.phase;
    }

    fn run_cache_pass(
        &mut self,
        node: &dyn DrawableNode,
        filters: &[Arc<dyn ShaderFilter>],
        id: CacheId,
        layout: CacheLayout,
    ) -> RenderResult<()> {
        let passes = expand_passes(filters);
        let controlled = self.config.cache_controlled;
        let needed = match (passes.is_empty(), controlled) {
            (true, true) => 0,
            (true, false) => 1,
            (false, _) => 2,
        };
        let (first, surface_resized) =
            self.prepare_targets(id, layout, needed).inspect_err(|e| {
                log::error!("Cache render targets unavailable, keeping the previous surface: {e}");
            })?;

        let result = self.fill_cache(node, &passes, id, layout, first);
        if result.is_err() && surface_resized {
            log::warn!("Cache pass failed after its surface was resized, dropping the surface");
            if let Some(record) = self.caches.get_mut(&id) {
                record.surface = None;
                record.layout = None;
            }
        }
        result
    }

    fn fill_cache(
        &mut self,
        node: &dyn DrawableNode,
        passes: &[Arc<dyn ShaderFilter>],
        id: CacheId,
        layout: CacheLayout,
        first: usize,
    ) -> RenderResult<()> {
        let controlled = self.config.cache_controlled;
        let matrix = layout.surface_matrix();
        let mut ctx = WalkContext {
            ignore: Some(id),
            ignore_all: false,
        };

        if passes.is_empty() && controlled {
            self.bind_target(ActiveTarget::output(self.viewport));
            self.backend.clear();
            self.draw_subtree(node, &matrix, 1.0, &mut ctx, true)?;
            self.commit_layout(id, layout);
            return Ok(());
        }

        let target = self.cache_target(id, first)?;
        self.bind_target(target);
        self.backend.clear();
        self.draw_subtree(node, &matrix, 1.0, &mut ctx, true)?;
        if passes.is_empty() {
            self.set_surface(id, first, layout);
            return Ok(());
        }

        let filter_context = FilterContext {
            width: layout.width,
            height: layout.height,
        };
        let mut source = first;
        self.backend.set_blending(false);
        for filter in passes {
            let dest = 1 - source;
            let from = self.cache_target(id, source)?;
            let to = self.cache_target(id, dest)?;

            let mut uniforms = filter.uniforms(&filter_context);
            match self.bind_filter_inputs(filter.as_ref()) {
                Ok(samplers) => uniforms.extend(samplers),
                Err(e) => {
                    log::warn!("Skipping filter {}: {e}", filter.shader_key());
                    continue;
                }
            }
            self.bind_target(to);

            let program = match self.shaders.filter(&mut self.backend, filter.as_ref()) {
                Ok(program) => program,
                Err(e) => {
                    log::warn!("Skipping filter {}: {e}", filter.shader_key());
                    continue;
                }
            };
            self.backend.clear();
            draw_cover(&mut self.backend, program, from, false, &uniforms)?;
            self.note_cover("filter");
            source = dest;
        }

        if controlled {
            let from = self.cache_target(id, source)?;
            self.bind_target(ActiveTarget::output(self.viewport));
            self.backend.clear();
            let program = self.shaders.cover(&mut self.backend)?;
            draw_cover(&mut self.backend, program, from, true, &[])?;
            self.note_cover("cover");
            self.commit_layout(id, layout);
        } else {
            self.set_surface(id, source, layout);
        }
        self.backend.set_blending(true);
        Ok(())
    }

    /// Binds every extra image of `filter` on units `1..` and returns the
    /// sampler uniforms pointing at them.
    fn bind_filter_inputs(
        &mut self,
        filter: &dyn ShaderFilter,
    ) -> RenderResult<Vec<(&'static str, UniformValue)>> {
        let inputs = filter.inputs();
        let limit = self.allocator.combined_units();
        if inputs.len() >= limit {
            return Err(RenderError::SlotOutOfRange {
                index: inputs.len(),
                limit,
            });
        }
        let mut samplers = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let unit = index + 1;
            let texture = self.filter_input_texture(&input.image, unit);
            self.bind_unit(unit, texture);
            let sampler = i32::try_from(unit).unwrap_or(i32::MAX);
            samplers.push((input.sampler, UniformValue::Int(sampler)));
        }
        Ok(samplers)
    }

    /// Uploads `image` through the registry if needed; the placeholder
    /// stands in while it is pending or failed.
    fn filter_input_texture(&mut self, image: &ImageSource, unit: usize) -> B::Texture {
        let Some(store) = self.prepare_source(image) else {
            return self.placeholder;
        };
        if self.registry.get(store).is_some_and(|r| r.needs_upload()) {
            self.upload(store, unit);
        }
        let draw_id = self.draw_id;
        self.registry
            .get_mut(store)
            .and_then(|record| {
                record.last_draw_id = draw_id;
                record.handle.filter(|_| record.is_uploaded())
            })
            .unwrap_or(self.placeholder)
    }

    /// Creates or resizes the `count` targets a pass writes and returns the
    /// index written first, plus whether the surface target's storage was
    /// reallocated. The target not holding the surface is prepared first so
    /// an allocation failure leaves the surface intact.
    fn prepare_targets(
        &mut self,
        id: CacheId,
        layout: CacheLayout,
        count: usize,
    ) -> RenderResult<(usize, bool)> {
        let unit = self.allocator.combined_units().saturating_sub(1);
        let filtering = if self.config.antialias {
            TextureFiltering::Linear
        } else {
            TextureFiltering::Nearest
        };
        let record = self
            .caches
            .get_mut(&id)
            .ok_or(RenderError::CacheNotDefined)?;

        let first = 1 - record.last_target.min(1);
        let order = [first, 1 - first];
        let mut surface_resized = false;
        let mut result = Ok(());
        for &index in order.iter().take(count) {
            match ensure_target(
                &mut self.backend,
                &mut record.targets[index],
                unit,
                layout,
                filtering,
            ) {
                Ok(resized) => surface_resized |= resized && record.surface == Some(index),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if count > 0 {
            self.forget_unit(unit);
        }
        result.map(|()| (first, surface_resized))
    }

    fn cache_target(&self, id: CacheId, index: usize) -> RenderResult<ActiveTarget<B>> {
        let target = self
            .caches
            .get(&id)
            .and_then(|c| c.targets.get(index))
            .and_then(Option::as_ref)
            .ok_or(RenderError::CacheNotDefined)?;
        Ok(ActiveTarget {
            framebuffer: Some(target.framebuffer),
            texture: Some(target.texture),
            width: target.width,
            height: target.height,
            y_sign: 1.0,
        })
    }

    fn set_surface(&mut self, id: CacheId, index: usize, layout: CacheLayout) {
        if let Some(record) = self.caches.get_mut(&id) {
            record.surface = Some(index);
            record.last_target = index;
            record.layout = Some(layout);
        }
    }

    fn commit_layout(&mut self, id: CacheId, layout: CacheLayout) {
        if let Some(record) = self.caches.get_mut(&id) {
            record.layout = Some(layout);
        }
    }

    fn note_cover(&mut self, what: &str) {
        self.stats.draw_calls += 1;
        log::trace!("Draw[{}:{}] : {what}", self.draw_id, self.batch_id);
    }
}

/// Creates `slot` or resizes it to `layout`. Returns whether an existing
/// target lost its contents.
fn ensure_target<B: GpuBackend>(
    backend: &mut B,
    slot: &mut Option<RenderTarget<B>>,
    unit: usize,
    layout: CacheLayout,
    filtering: TextureFiltering,
) -> RenderResult<bool> {
    let (width, height) = (layout.width, layout.height);
    if let Some(target) = slot {
        if target.width == width && target.height == height {
            return Ok(false);
        }
        backend.allocate_texture(unit, target.texture, width, height, filtering)?;
        target.width = width;
        target.height = height;
        return Ok(true);
    }

    let texture = backend.create_texture()?;
    let framebuffer = match backend
        .allocate_texture(unit, texture, width, height, filtering)
        .and_then(|()| backend.create_framebuffer(texture))
    {
        Ok(framebuffer) => framebuffer,
        Err(e) => {
            backend.delete_texture(texture);
            return Err(e);
        }
    };
    *slot = Some(RenderTarget {
        texture,
        framebuffer,
        width,
        height,
    });
    Ok(false)
}

/// One full-viewport pass sampling `source` on unit 0. Extra inputs must
/// already be bound.
fn draw_cover<B: GpuBackend>(
    backend: &mut B,
    program: &ShaderProgram<B>,
    source: ActiveTarget<B>,
    flip_y: bool,
    uniforms: &[(&'static str, UniformValue)],
) -> RenderResult<()> {
    let Some(texture) = source.texture else {
        return Err(RenderError::CacheNotDefined);
    };
    backend.use_program(Some(program.program));
    if let Some(location) = &program.flip_y {
        backend.set_uniform(location, &UniformValue::Bool(flip_y));
    }
    for (name, value) in uniforms {
        if let Some(location) = program.extra.get(name) {
            backend.set_uniform(location, value);
        }
    }
    backend.bind_texture(0, Some(texture));

    backend.reserve_attributes(COVER_VERTICES)?;
    for (attribute, data) in [
        (VertexAttribute::Position, &COVER_POSITIONS),
        (VertexAttribute::Uv, &COVER_UVS),
    ] {
        if let Some(location) = program.attribute(attribute) {
            backend.write_attribute(attribute, location, data);
        }
    }
    backend.draw_triangles(COVER_VERTICES);
    Ok(())
}
