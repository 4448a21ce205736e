//! The scene walker and draw orchestrator.
//!
//! [`Renderer`] walks a [`DrawableNode`] tree depth-first, packs every
//! drawable into [`BatchBuffers`] and issues one draw call per batch. A
//! batch ends when the card buffer is full, when no texture slot is left
//! for the next texture, or when the walk finishes.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::allocator::{SlotAllocator, SlotAssignment, SlotKey};
use crate::backend::{GpuBackend, TextureFiltering, UniformValue, VertexAttribute};
use crate::batch::{BatchBuffers, VERTICES_PER_CARD};
use crate::cache::{CacheId, CacheRecord};
use crate::config::{Color, RendererConfig};
use crate::error::{RenderError, RenderResult};
use crate::geom::{Matrix2D, QuadBounds, Rect, UvRect};
use crate::node::{DrawableNode, NodeContent};
use crate::registry::{SourceVersion, StoreId, TextureRegistry};
use crate::shaders::{ProgramKey, ShaderCache};
use crate::types::{premultiply_rgba, ImageSource, SpriteFrame};

#[cfg(feature = "glow")]
use crate::backend::GlowBackend;

/// A [`Renderer`] drawing through OpenGL.
#[cfg(feature = "glow")]
pub type GlowRenderer = Renderer<GlowBackend>;

/// Where [`Renderer::draw_into_target`] draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawTarget {
    /// The primary output (the default framebuffer).
    Output,
    /// On top of the current surface of a cache.
    Cache(CacheId),
}

/// Something whose textures [`Renderer::release_texture`] should drop.
#[derive(Clone, Copy)]
pub enum TextureRef<'a> {
    /// Every texture used by a subtree; caches in it are uncached.
    Node(&'a dyn DrawableNode),
    /// The texture of one pixel source.
    Source(&'a ImageSource),
    /// A registry record.
    Store(StoreId),
    /// Both render targets of a cache.
    Cache(CacheId),
}

/// Counters for the last draw pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Draw calls issued, cover passes included.
    pub draw_calls: usize,
    /// Cards drawn.
    pub cards: usize,
    /// Texture uploads.
    pub uploads: usize,
}

/// Where the orchestrator is in a draw pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawPhase {
    /// No pass has started yet.
    Idle,
    /// Packing cards.
    Walking,
    /// Submitting a batch.
    Flushing,
    /// The last pass finished.
    Done,
}

/// How a node is drawn, decided once per visit.
enum RenderStyle<'a> {
    WholeImage {
        image: &'a ImageSource,
        source_rect: Option<Rect>,
    },
    Frame(&'a SpriteFrame),
    /// Drawn as one card from the cache surface; children are not visited.
    Cached(CacheId),
    Unsupported,
}

/// Per-pass walk state.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WalkContext {
    /// Cache whose surface must not be sampled (the one being written).
    pub(crate) ignore: Option<CacheId>,
    /// Draw every cached node from its content.
    pub(crate) ignore_all: bool,
}

impl WalkContext {
    fn uses_cache(&self, id: CacheId) -> bool {
        !self.ignore_all && self.ignore != Some(id)
    }
}

/// The framebuffer draws currently go to.
#[derive(Debug)]
pub(crate) struct ActiveTarget<B: GpuBackend> {
    /// `None` for the primary output.
    pub(crate) framebuffer: Option<B::Framebuffer>,
    /// Color attachment, never sampled while bound.
    pub(crate) texture: Option<B::Texture>,
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// `-1` flips Y for the primary output, `1` keeps render targets in
    /// image orientation.
    pub(crate) y_sign: f32,
}

impl<B: GpuBackend> Clone for ActiveTarget<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: GpuBackend> Copy for ActiveTarget<B> {}

impl<B: GpuBackend> ActiveTarget<B> {
    pub(crate) fn output((width, height): (u32, u32)) -> Self {
        Self {
            framebuffer: None,
            texture: None,
            width,
            height,
            y_sign: -1.0,
        }
    }
}

/// A batched 2D renderer over a [`GpuBackend`].
///
/// Textures are uploaded lazily the first time a node using them is drawn
/// and stay on the GPU until released or purged. Caches created with
/// [`create_cache`](Self::create_cache) render subtrees into off-screen
/// surfaces that later frames draw as a single card.
///
/// # Example
///
/// ```
/// use scene_renderer_glow::{HeadlessBackend, ImageSource, Node, Renderer, RendererConfig};
///
/// let mut renderer = Renderer::new(HeadlessBackend::new(8, 16), RendererConfig::default()).unwrap();
/// renderer.resize_viewport(320, 240);
///
/// let image = ImageSource::from_rgba(2, 2, vec![255; 16]);
/// let stage = Node::container(vec![Node::bitmap(image).at(10.0, 10.0)]);
/// let stats = renderer.render_frame(&stage).unwrap();
/// assert_eq!(stats.draw_calls, 1);
/// ```
pub struct Renderer<B: GpuBackend> {
    pub(crate) backend: B,
    pub(crate) config: RendererConfig,
    pub(crate) registry: TextureRegistry<B::Texture>,
    pub(crate) allocator: SlotAllocator,
    pub(crate) batch: BatchBuffers,
    pub(crate) shaders: ShaderCache<B>,
    pub(crate) caches: HashMap<CacheId, CacheRecord<B>>,
    /// 1×1 transparent texture bound to empty slots and failed uploads.
    pub(crate) placeholder: B::Texture,
    /// What each combined unit holds as far as the renderer knows; `None`
    /// when unknown.
    pub(crate) bound: Vec<Option<B::Texture>>,
    pub(crate) regular_key: ProgramKey,
    pub(crate) viewport: (u32, u32),
    pub(crate) target: ActiveTarget<B>,
    pub(crate) phase: DrawPhase,
    pub(crate) stats: FrameStats,
    pub(crate) draw_id: u64,
    pub(crate) batch_id: u64,
}

impl<B: GpuBackend> Renderer<B> {
    /// Create a renderer drawing through `backend`.
    ///
    /// Compiles the batch program for as many texture units as the backend
    /// (or [`RendererConfig::texture_units_hint`]) allows, lowering the
    /// count when the driver rejects the shader. Call
    /// [`resize_viewport`](Self::resize_viewport) before the first frame.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::ContextLost`] for a dead context, a shader
    /// error when even a single-unit program fails, or
    /// [`RenderError::ResourceExhausted`] when the placeholder texture or
    /// vertex buffers cannot be created.
    pub fn new(mut backend: B, config: RendererConfig) -> RenderResult<Self> {
        if backend.is_context_lost() {
            return Err(RenderError::ContextLost);
        }

        let limits = backend.texture_unit_limits();
        let requested = config
            .texture_units_hint
            .map_or(limits.batch, |hint| hint.clamp(1, limits.batch.max(1)));

        let mut shaders = ShaderCache::new();
        let units = shaders
            .regular(&mut backend, requested, config.premultiplied_alpha)?
            .key
            .units;
        if units < requested {
            log::debug!("Batch texture units reduced from {requested} to {units}");
        }

        let placeholder = backend.create_texture()?;
        backend.upload_texture(0, placeholder, 1, 1, &[0; 4], TextureFiltering::Nearest)?;

        let batch = BatchBuffers::new(config.max_cards_per_batch);
        backend.reserve_attributes(batch.max_cards() * VERTICES_PER_CARD)?;
        backend.set_clear_color(config.clear_color.to_array());
        backend.set_blending(true);

        Ok(Self {
            registry: TextureRegistry::new(),
            allocator: SlotAllocator::new(units, limits.combined),
            bound: vec![None; limits.combined.max(units)],
            regular_key: ProgramKey::regular(units, config.premultiplied_alpha),
            caches: HashMap::new(),
            viewport: (0, 0),
            target: ActiveTarget::output((0, 0)),
            phase: DrawPhase::Idle,
            stats: FrameStats::default(),
            draw_id: 0,
            batch_id: 0,
            backend,
            config,
            batch,
            shaders,
            placeholder,
        })
    }

    /// Draw `root` onto the primary output.
    ///
    /// # Errors
    ///
    /// See [`draw_into_target`](Self::draw_into_target).
    pub fn render_frame(&mut self, root: &dyn DrawableNode) -> RenderResult<FrameStats> {
        self.draw_into_target(root, DrawTarget::Output, false)
    }

    /// Draw `root` into `target`.
    ///
    /// The primary output is cleared first when
    /// [`auto_clear`](RendererConfig::auto_clear) is set; cache surfaces are
    /// drawn over. With `ignore_caches` every cached node is drawn from its
    /// content instead of its surface.
    ///
    /// # Errors
    ///
    /// - [`RenderError::ContextLost`] if the context is gone.
    /// - [`RenderError::CacheNotDefined`] if `target` names a cache that
    ///   has no surface yet.
    /// - [`RenderError::NoFreeSlot`] if every batch slot is protected.
    pub fn draw_into_target(
        &mut self,
        root: &dyn DrawableNode,
        target: DrawTarget,
        ignore_caches: bool,
    ) -> RenderResult<FrameStats> {
        self.ensure_context()?;
        self.stats = FrameStats::default();

        let mut ctx = WalkContext {
            ignore: None,
            ignore_all: ignore_caches,
        };
        match target {
            DrawTarget::Output => {
                self.bind_target(ActiveTarget::output(self.viewport));
                if self.config.auto_clear {
                    self.backend.clear();
                }
            }
            DrawTarget::Cache(id) => {
                let surface = self
                    .caches
                    .get(&id)
                    .and_then(|record| record.surface.and_then(|i| record.targets.get(i)))
                    .and_then(Option::as_ref)
                    .ok_or(RenderError::CacheNotDefined)?;
                let active = ActiveTarget {
                    framebuffer: Some(surface.framebuffer),
                    texture: Some(surface.texture),
                    width: surface.width,
                    height: surface.height,
                    y_sign: 1.0,
                };
                ctx.ignore = Some(id);
                self.bind_target(active);
            }
        }

        let result = self.draw_subtree(root, &Matrix2D::IDENTITY, 1.0, &mut ctx, false);
        if target != DrawTarget::Output {
            self.bind_target(ActiveTarget::output(self.viewport));
        }
        result.map(|()| self.stats)
    }

    /// One complete pass: begin, walk, final flush.
    ///
    /// With `as_root` the node's own transform and alpha are replaced by
    /// `matrix` and `alpha`, which is how cache passes draw a node in its
    /// local space.
    pub(crate) fn draw_subtree(
        &mut self,
        root: &dyn DrawableNode,
        matrix: &Matrix2D,
        alpha: f32,
        ctx: &mut WalkContext,
        as_root: bool,
    ) -> RenderResult<()> {
        self.begin_draw()?;
        let walked = if as_root {
            self.visit(root, *matrix, alpha, ctx)
        } else {
            self.walk(root, matrix, alpha, ctx)
        };
        let flushed = self.flush("drawFinish");
        self.phase = DrawPhase::Done;
        walked.and(flushed)
    }

    fn begin_draw(&mut self) -> RenderResult<()> {
        self.flush("beginDraw")?;
        self.draw_id += 1;
        self.phase = DrawPhase::Walking;
        Ok(())
    }

    fn walk(
        &mut self,
        node: &dyn DrawableNode,
        parent: &Matrix2D,
        parent_alpha: f32,
        ctx: &mut WalkContext,
    ) -> RenderResult<()> {
        if !node.visible() {
            return Ok(());
        }
        let alpha = parent_alpha * node.alpha();
        if alpha <= 0.0 {
            return Ok(());
        }
        let matrix = parent.append(&node.local_matrix());
        if matrix.is_degenerate() {
            return Ok(());
        }
        self.visit(node, matrix, alpha, ctx)
    }

    fn visit(
        &mut self,
        node: &dyn DrawableNode,
        matrix: Matrix2D,
        alpha: f32,
        ctx: &mut WalkContext,
    ) -> RenderResult<()> {
        match self.render_style(node, ctx) {
            RenderStyle::Cached(id) => return self.draw_cached(id, &matrix, alpha),
            RenderStyle::WholeImage { image, source_rect } => {
                self.draw_image(image, source_rect, &matrix, alpha)?;
            }
            RenderStyle::Frame(frame) => self.draw_frame(frame, &matrix, alpha)?,
            RenderStyle::Unsupported => {}
        }

        if node.is_container() {
            for index in 0..node.child_count() {
                if let Some(child) = node.child(index) {
                    self.walk(child, &matrix, alpha, ctx)?;
                }
            }
        }
        Ok(())
    }

    fn render_style<'a>(&self, node: &'a dyn DrawableNode, ctx: &WalkContext) -> RenderStyle<'a> {
        if let Some(cache) = node.cache() {
            let id = cache.id();
            let has_surface = self.caches.get(&id).is_some_and(|c| c.surface.is_some());
            if has_surface && ctx.uses_cache(id) {
                return RenderStyle::Cached(id);
            }
        }
        match node.content() {
            NodeContent::Image { image, source_rect } => {
                RenderStyle::WholeImage { image, source_rect }
            }
            NodeContent::Frame { sheet, frame } => {
                sheet.frame(frame).map_or(RenderStyle::Unsupported, RenderStyle::Frame)
            }
            NodeContent::None => RenderStyle::Unsupported,
        }
    }

    fn draw_image(
        &mut self,
        image: &ImageSource,
        source_rect: Option<Rect>,
        matrix: &Matrix2D,
        alpha: f32,
    ) -> RenderResult<()> {
        let Some(store) = self.prepare_source(image) else {
            return Ok(());
        };
        #[expect(clippy::cast_precision_loss)]
        let (width, height) = {
            let (w, h) = image.size();
            (w as f32, h as f32)
        };
        let (quad, uv) = match source_rect {
            Some(rect) => (
                QuadBounds::sized(rect.width, rect.height),
                UvRect::from_pixels(&rect, width, height),
            ),
            None => (QuadBounds::sized(width, height), UvRect::FULL),
        };
        self.push_card(SlotKey::Store(store), quad, matrix, uv, alpha)
    }

    fn draw_frame(&mut self, frame: &SpriteFrame, matrix: &Matrix2D, alpha: f32) -> RenderResult<()> {
        let Some(store) = self.prepare_source(&frame.image) else {
            return Ok(());
        };
        let quad = QuadBounds {
            left: -frame.reg_x,
            top: -frame.reg_y,
            right: frame.rect.width - frame.reg_x,
            bottom: frame.rect.height - frame.reg_y,
        };
        self.push_card(SlotKey::Store(store), quad, matrix, frame.uv_rect(), alpha)
    }

    fn draw_cached(&mut self, id: CacheId, matrix: &Matrix2D, alpha: f32) -> RenderResult<()> {
        let Some((surface, quad)) = self
            .caches
            .get(&id)
            .and_then(|c| Some((c.surface?, c.layout?.quad())))
        else {
            return Ok(());
        };
        self.push_card(SlotKey::Surface(id, surface), quad, matrix, UvRect::FULL, alpha)
    }

    /// Registers `image` if it can be drawn now; `None` skips the node.
    pub(crate) fn prepare_source(&mut self, image: &ImageSource) -> Option<StoreId> {
        let Some(snapshot) = image.snapshot() else {
            log::trace!("Skipping pending source {}", image.id());
            return None;
        };
        if let Err(reason) = snapshot.validate() {
            let error = RenderError::UnreadableSource {
                id: image.id(),
                reason,
            };
            log::warn!("{error}");
            return None;
        }
        Some(self.registry.resolve(image))
    }

    /// Places `key` in a slot and appends one card sampling it.
    fn push_card(
        &mut self,
        key: SlotKey,
        quad: QuadBounds,
        matrix: &Matrix2D,
        uv: UvRect,
        alpha: f32,
    ) -> RenderResult<()> {
        if self.batch.is_full() {
            self.flush("vertexOverflow")?;
        }

        let slot = self.acquire_slot(key)?;
        if let SlotKey::Store(store) = key {
            self.touch_record(store, slot);
        }

        self.batch
            .append_card(quad, matrix, uv, slot, alpha)
            .map_err(|e| RenderError::exhausted(e.to_string()))
    }

    fn acquire_slot(&mut self, key: SlotKey) -> RenderResult<usize> {
        let mut assignment = self.allocator.insert(key, self.batch_id);
        if assignment == SlotAssignment::Overflow {
            self.flush("textureOverflow")?;
            assignment = self.allocator.insert(key, self.batch_id);
        }
        match assignment {
            SlotAssignment::Reused(slot) => Ok(slot),
            SlotAssignment::Assigned { slot, evicted } => {
                if let Some(SlotKey::Store(old)) = evicted {
                    if let Some(record) = self.registry.get_mut(old) {
                        record.active_slot = None;
                    }
                }
                Ok(slot)
            }
            SlotAssignment::Overflow => Err(RenderError::NoFreeSlot),
        }
    }

    /// Uploads `store` if its source changed and stamps batch and draw ids.
    fn touch_record(&mut self, store: StoreId, slot: usize) {
        let needs_upload = self.registry.get(store).is_some_and(|r| r.needs_upload());
        if needs_upload {
            self.upload(store, slot);
        }
        if let Some(record) = self.registry.get_mut(store) {
            record.active_slot = Some(slot);
            record.last_batch_id = Some(self.batch_id);
            record.last_draw_id = self.draw_id;
        }
    }

    pub(crate) fn upload(&mut self, store: StoreId, slot: usize) {
        let premultiplied = self.config.premultiplied_alpha;
        let antialias = self.config.antialias;
        let Some(record) = self.registry.get_mut(store) else {
            return;
        };
        let Some(snapshot) = record.image.snapshot() else {
            return;
        };
        let version = SourceVersion {
            source: record.image.id(),
            generation: snapshot.generation,
        };

        let texture = match record.handle {
            Some(texture) => texture,
            None => match self.backend.create_texture() {
                Ok(texture) => {
                    record.handle = Some(texture);
                    texture
                }
                Err(e) => {
                    log::error!("Texture for source {} unavailable, using placeholder: {e}", record.image.id());
                    record.failed = Some(version);
                    return;
                }
            },
        };

        let is_pot = snapshot.is_power_of_two();
        if !is_pot {
            log::debug!("NPOT texture {}x{}, using nearest filtering", snapshot.width, snapshot.height);
        }
        let filtering = if is_pot && antialias {
            TextureFiltering::Linear
        } else {
            TextureFiltering::Nearest
        };
        let pixels: Cow<'_, [u8]> = if premultiplied {
            Cow::Owned(premultiply_rgba(&snapshot.pixels))
        } else {
            Cow::Borrowed(snapshot.pixels.as_slice())
        };

        let uploaded = self.backend.upload_texture(
            slot,
            texture,
            snapshot.width,
            snapshot.height,
            &pixels,
            filtering,
        );
        if let Some(unit) = self.bound.get_mut(slot) {
            *unit = uploaded.is_ok().then_some(texture);
        }
        match uploaded {
            Ok(()) => {
                record.uploaded = Some(version);
                record.failed = None;
                record.is_power_of_two = is_pot;
                record.width = snapshot.width;
                record.height = snapshot.height;
                self.stats.uploads += 1;
            }
            Err(e) => {
                log::error!("Upload of source {} failed, using placeholder: {e}", record.image.id());
                record.failed = Some(version);
            }
        }
    }

    /// Texture to bind for `slot` in the next draw call.
    fn slot_texture(&self, slot: usize) -> B::Texture {
        let texture = match self.allocator.occupant(slot) {
            Some(SlotKey::Store(id)) => self
                .registry
                .get(id)
                .filter(|r| r.is_uploaded())
                .and_then(|r| r.handle),
            Some(SlotKey::Surface(cache, index)) => self
                .caches
                .get(&cache)
                .and_then(|c| c.targets.get(index))
                .and_then(Option::as_ref)
                .map(|t| t.texture),
            None => None,
        };
        match texture {
            Some(texture) if Some(texture) != self.target.texture => texture,
            _ => self.placeholder,
        }
    }

    /// Submits the packed cards as one draw call.
    pub(crate) fn flush(&mut self, reason: &str) -> RenderResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let previous = std::mem::replace(&mut self.phase, DrawPhase::Flushing);

        for slot in 0..self.allocator.units() {
            let texture = self.slot_texture(slot);
            self.bind_unit(slot, texture);
        }

        let program = self.shaders.regular(
            &mut self.backend,
            self.regular_key.units,
            self.regular_key.premultiplied,
        )?;
        self.backend.use_program(Some(program.program));
        self.backend.set_blending(true);
        #[expect(clippy::cast_precision_loss)]
        let resolution = [self.target.width as f32, self.target.height as f32];
        if let Some(location) = &program.resolution {
            self.backend.set_uniform(location, &UniformValue::Vec2(resolution));
        }
        if let Some(location) = &program.y_sign {
            self.backend
                .set_uniform(location, &UniformValue::Float(self.target.y_sign));
        }

        self.backend.reserve_attributes(self.batch.vertex_count())?;
        for attribute in VertexAttribute::ALL {
            let Some(location) = program.attribute(attribute) else {
                continue;
            };
            let data = match attribute {
                VertexAttribute::Position => self.batch.positions(),
                VertexAttribute::Uv => self.batch.uvs(),
                VertexAttribute::TextureIndex => self.batch.texture_indices(),
                VertexAttribute::Alpha => self.batch.alphas(),
            };
            self.backend.write_attribute(attribute, location, data);
        }
        self.backend.draw_triangles(self.batch.vertex_count());
        log::trace!("Draw[{}:{}] : {reason}", self.draw_id, self.batch_id);

        self.stats.draw_calls += 1;
        self.stats.cards += self.batch.cards();
        self.batch_id += 1;
        self.batch.clear();
        self.phase = previous;
        Ok(())
    }

    /// Binds `texture` to `unit` unless it is already there.
    pub(crate) fn bind_unit(&mut self, unit: usize, texture: B::Texture) {
        if self.bound.get(unit) == Some(&Some(texture)) {
            return;
        }
        self.backend.bind_texture(unit, Some(texture));
        if let Some(bound) = self.bound.get_mut(unit) {
            *bound = Some(texture);
        }
    }

    /// Marks `unit` as holding something unknown.
    pub(crate) fn forget_unit(&mut self, unit: usize) {
        if let Some(bound) = self.bound.get_mut(unit) {
            *bound = None;
        }
    }

    /// Forgets every unit holding `texture`; deleted names may be reused.
    pub(crate) fn forget_texture(&mut self, texture: B::Texture) {
        for bound in &mut self.bound {
            if *bound == Some(texture) {
                *bound = None;
            }
        }
    }

    /// Binds `target` and sets the viewport to its size.
    pub(crate) fn bind_target(&mut self, target: ActiveTarget<B>) {
        self.backend.bind_framebuffer(target.framebuffer);
        self.backend.set_viewport(target.width, target.height);
        self.target = target;
    }

    pub(crate) fn ensure_context(&mut self) -> RenderResult<()> {
        if self.backend.is_context_lost() {
            log::error!("GPU context lost");
            return Err(RenderError::ContextLost);
        }
        Ok(())
    }

    /// Points every registry record at the slot it occupies, if any.
    pub(crate) fn sync_registry_slots(&mut self) {
        self.registry
            .sync_slots(self.allocator.occupants().filter_map(|(slot, key)| match key {
                SlotKey::Store(id) => Some((slot, id)),
                SlotKey::Surface(..) => None,
            }));
    }

    /// Drop textures.
    ///
    /// In safe mode a record shared by several sources (same
    /// [`with_key`](ImageSource::with_key) key) is only deleted once all of
    /// them are released. Returns the number of textures deleted, render
    /// targets included.
    pub fn release_texture(&mut self, item: TextureRef<'_>, safe_mode: bool) -> usize {
        match item {
            TextureRef::Node(node) => self.release_node(node, safe_mode),
            TextureRef::Source(image) => self.release_source(image, safe_mode),
            TextureRef::Store(id) => self.registry.remove(id).map_or(0, |record| {
                self.kill_record(record.store_id, record.handle);
                1
            }),
            TextureRef::Cache(id) => self.uncache(id),
        }
    }

    fn release_node(&mut self, node: &dyn DrawableNode, safe_mode: bool) -> usize {
        let mut released = 0;
        for index in 0..node.child_count() {
            if let Some(child) = node.child(index) {
                released += self.release_node(child, safe_mode);
            }
        }
        if let Some(cache) = node.cache() {
            if self.caches.contains_key(&cache.id()) {
                log::debug!("Automatic uncache on release; prefer calling uncache explicitly");
                released += self.uncache(cache.id());
            }
        }
        match node.content() {
            NodeContent::Image { image, .. } => released += self.release_source(image, safe_mode),
            NodeContent::Frame { sheet, .. } => {
                for image in sheet.images() {
                    released += self.release_source(&image, safe_mode);
                }
            }
            NodeContent::None => {}
        }
        released
    }

    fn release_source(&mut self, image: &ImageSource, safe_mode: bool) -> usize {
        match self.registry.release_source(image.id(), safe_mode) {
            Some(record) => {
                self.kill_record(record.store_id, record.handle);
                1
            }
            None => {
                log::trace!("No texture to release for source {}", image.id());
                0
            }
        }
    }

    fn kill_record(&mut self, store: StoreId, handle: Option<B::Texture>) {
        self.allocator.remove(SlotKey::Store(store));
        if let Some(texture) = handle {
            self.forget_texture(texture);
            self.backend.delete_texture(texture);
        }
    }

    /// Delete every texture not sampled during the last `threshold` draws
    /// (default [`RendererConfig::purge_threshold`]). Returns how many were
    /// deleted.
    pub fn purge_unused(&mut self, threshold: Option<u64>) -> usize {
        let threshold = threshold.unwrap_or(self.config.purge_threshold);
        let stale = self.registry.stale(self.draw_id, threshold);
        for &id in &stale {
            if let Some(record) = self.registry.remove(id) {
                self.kill_record(id, record.handle);
            }
        }
        if !stale.is_empty() {
            log::debug!("Purged {} textures unused for {threshold} draws", stale.len());
        }
        stale.len()
    }

    /// Lock or unlock texture unit `index` against batching.
    ///
    /// # Errors
    ///
    /// [`RenderError::SlotOutOfRange`] when `index` is not below the
    /// combined texture unit count.
    pub fn protect_slot(&mut self, index: usize, locked: bool) -> RenderResult<()> {
        let limit = self.allocator.combined_units();
        if index >= limit {
            return Err(RenderError::SlotOutOfRange { index, limit });
        }
        if let Some(SlotKey::Store(id)) = self.allocator.protect(index, locked) {
            if let Some(record) = self.registry.get_mut(id) {
                record.active_slot = None;
            }
        }
        Ok(())
    }

    /// Limit the number of texture units used for batching.
    ///
    /// The count is clamped to `1..=` the device limit and lowered further
    /// if the shader fails to compile. Returns the count in use.
    ///
    /// # Errors
    ///
    /// A shader error when a single-unit program fails too.
    pub fn set_max_texture_units_hint(&mut self, count: usize) -> RenderResult<usize> {
        self.flush("unitChange")?;
        let limits = self.backend.texture_unit_limits();
        let requested = count.clamp(1, limits.batch.max(1));
        let units = self
            .shaders
            .regular(&mut self.backend, requested, self.config.premultiplied_alpha)?
            .key
            .units;
        if units < requested {
            log::debug!("Batch texture units reduced from {requested} to {units}");
        }

        self.config.texture_units_hint = Some(count);
        self.regular_key = ProgramKey::regular(units, self.config.premultiplied_alpha);
        if units != self.allocator.units() {
            self.allocator.resize(units, limits.combined);
            self.sync_registry_slots();
        }
        Ok(units)
    }

    /// Change the clear color.
    pub fn set_clear_color(&mut self, color: Color) {
        self.config.clear_color = color;
        self.backend.set_clear_color(color.to_array());
    }

    /// Resize the primary output.
    pub fn resize_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        if self.target.framebuffer.is_none() {
            self.bind_target(ActiveTarget::output(self.viewport));
        }
    }

    /// Change the number of cards per draw call.
    ///
    /// # Errors
    ///
    /// [`RenderError::ResourceExhausted`] if the vertex buffers cannot grow.
    pub fn set_max_cards_per_batch(&mut self, max_cards: usize) -> RenderResult<()> {
        self.flush("bufferResize")?;
        self.batch.resize(max_cards);
        self.config.max_cards_per_batch = self.batch.max_cards();
        self.backend
            .reserve_attributes(self.batch.max_cards() * VERTICES_PER_CARD)
    }

    /// Clear the primary output with the clear color.
    pub fn clear(&mut self) {
        self.bind_target(ActiveTarget::output(self.viewport));
        self.backend.clear();
    }

    /// Counters of the last draw pass.
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Draw passes started so far.
    pub fn draw_id(&self) -> u64 {
        self.draw_id
    }

    /// Draw calls issued so far.
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Texture units used for batching.
    pub fn texture_units(&self) -> usize {
        self.allocator.units()
    }

    /// Current phase of the orchestrator.
    pub fn phase(&self) -> DrawPhase {
        self.phase
    }

    /// Current configuration.
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Number of textures in the registry.
    pub fn texture_count(&self) -> usize {
        self.registry.len()
    }

    /// Slot currently holding the texture of `image`.
    pub fn active_slot(&self, image: &ImageSource) -> Option<usize> {
        let store = self.registry.find_source(image.id())?;
        self.registry.get(store)?.active_slot
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Delete every GPU resource owned by the renderer.
    ///
    /// The renderer must not be used afterwards.
    pub fn destroy(&mut self) {
        self.batch.clear();
        self.shaders.destroy(&mut self.backend);
        for record in self.registry.drain() {
            if let Some(texture) = record.handle {
                self.backend.delete_texture(texture);
            }
        }
        for (_, mut record) in self.caches.drain() {
            record.destroy(&mut self.backend);
        }
        self.allocator.reset();
        self.bound.fill(None);
        self.backend.delete_texture(self.placeholder);
        self.backend.destroy();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::node::Node;

    fn renderer(units: usize) -> Renderer<HeadlessBackend> {
        let mut r = Renderer::new(HeadlessBackend::new(units, units), RendererConfig::default()).unwrap();
        r.resize_viewport(100, 100);
        r
    }

    fn image(w: u32, h: u32) -> ImageSource {
        ImageSource::from_rgba(w, h, vec![200; (w * h * 4) as usize])
    }

    #[test]
    fn walk_concatenates_matrices_and_alpha() {
        let mut r = renderer(4);
        let stage = Node::container(vec![Node::container(vec![Node::bitmap(image(2, 2))
            .at(5.0, 0.0)
            .with_alpha(0.5)])
        .at(10.0, 20.0)
        .with_alpha(0.5)]);
        r.render_frame(&stage).unwrap();

        let draw = &r.backend().draws()[0];
        assert_eq!(&draw.positions[..2], &[15.0, 20.0]);
        assert!((draw.alphas[0] - 0.25).abs() < f32::EPSILON);
        assert_eq!(r.phase(), DrawPhase::Done);
    }

    #[test]
    fn degenerate_and_hidden_nodes_are_skipped() {
        let mut r = renderer(4);
        let stage = Node::container(vec![
            Node::bitmap(image(1, 1)).scaled(0.0, 1.0),
            Node::bitmap(image(1, 1)).hidden(),
            Node::bitmap(image(1, 1)).with_alpha(0.0),
        ]);
        let stats = r.render_frame(&stage).unwrap();
        assert_eq!(stats, FrameStats::default());
        assert!(r.backend().draws().is_empty());
    }

    #[test]
    fn unchanged_source_is_uploaded_once() {
        let mut r = renderer(4);
        let img = image(2, 2);
        let stage = Node::container(vec![Node::bitmap(img.clone()), Node::bitmap(img.clone())]);
        assert_eq!(r.render_frame(&stage).unwrap().uploads, 1);
        assert_eq!(r.render_frame(&stage).unwrap().uploads, 0);

        img.invalidate();
        assert_eq!(r.render_frame(&stage).unwrap().uploads, 1);
    }

    #[test]
    fn identical_frames_rebind_nothing() {
        let mut r = renderer(4);
        let (a, b) = (image(2, 2), image(3, 3));
        let stage = Node::container(vec![Node::bitmap(a.clone()), Node::bitmap(b)]);
        r.render_frame(&stage).unwrap();
        assert!(r.backend().bind_count() > 0);

        r.backend_mut().clear_log();
        r.render_frame(&stage).unwrap();
        assert_eq!(r.backend().bind_count(), 0);
        let draw = &r.backend().draws()[0];
        assert_ne!(draw.card_texture(0), draw.card_texture(1));
        assert_ne!(draw.card_texture(0), Some(r.placeholder));

        // Re-uploading binds on the slot already.
        a.invalidate();
        r.backend_mut().clear_log();
        r.render_frame(&stage).unwrap();
        assert_eq!(r.backend().upload_count(), 1);
        assert_eq!(r.backend().bind_count(), 0);
    }

    #[test]
    fn filtering_follows_pot_and_antialias() {
        let config = RendererConfig {
            antialias: true,
            ..RendererConfig::default()
        };
        let mut r = Renderer::new(HeadlessBackend::new(4, 4), config).unwrap();
        r.resize_viewport(10, 10);
        let stage = Node::container(vec![Node::bitmap(image(4, 4)), Node::bitmap(image(3, 4))]);
        r.render_frame(&stage).unwrap();

        let filters: Vec<_> = r
            .backend()
            .commands()
            .iter()
            .filter_map(|c| match c {
                crate::backend::Command::UploadTexture { width, filtering, .. } if *width > 1 => {
                    Some(*filtering)
                }
                _ => None,
            })
            .collect();
        assert_eq!(filters, vec![TextureFiltering::Linear, TextureFiltering::Nearest]);
    }

    #[test]
    fn failed_upload_binds_placeholder() {
        let mut r = renderer(4);
        r.backend_mut().set_fail_uploads(true);
        let stage = Node::container(vec![Node::bitmap(image(2, 2))]);
        r.render_frame(&stage).unwrap();

        let draw = &r.backend().draws()[0];
        assert_eq!(draw.card_texture(0), Some(r.placeholder));
    }

    #[test]
    fn invalid_pixel_buffer_is_skipped() {
        let mut r = renderer(4);
        let broken = ImageSource::from_rgba(4, 4, vec![0; 3]);
        let stage = Node::container(vec![Node::bitmap(broken)]);
        assert_eq!(r.render_frame(&stage).unwrap().cards, 0);
    }

    #[test]
    fn units_hint_resizes_allocator() {
        let mut r = renderer(8);
        assert_eq!(r.texture_units(), 8);
        assert_eq!(r.set_max_texture_units_hint(3).unwrap(), 3);
        assert_eq!(r.texture_units(), 3);
        assert_eq!(r.set_max_texture_units_hint(0).unwrap(), 1);
        assert_eq!(r.set_max_texture_units_hint(99).unwrap(), 8);
    }

    #[test]
    fn destroy_releases_everything() {
        let mut r = renderer(4);
        let stage = Node::container(vec![Node::bitmap(image(2, 2))]);
        r.render_frame(&stage).unwrap();
        r.destroy();
        assert_eq!(r.backend().live_textures(), 0);
        assert_eq!(r.backend().live_programs(), 0);
    }
}
