#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use scene_renderer_glow::{
    init_logging, BlurFilter, ColorFilter, DisplacementFilter, DrawTarget, HeadlessBackend,
    ImageSource, LoggingConfig, Node, Rect, RenderError, Renderer, RendererConfig, ShaderFilter,
    SpriteFrame, SpriteSheet, TextureRef, UniformValue,
};

fn renderer_with(backend: HeadlessBackend, config: RendererConfig) -> Renderer<HeadlessBackend> {
    init_logging(LoggingConfig {
        is_test: true,
        ..LoggingConfig::default()
    });
    let mut renderer = Renderer::new(backend, config).unwrap();
    renderer.resize_viewport(64, 64);
    renderer
}

fn renderer(batch_units: usize, combined_units: usize) -> Renderer<HeadlessBackend> {
    renderer_with(
        HeadlessBackend::new(batch_units, combined_units),
        RendererConfig::default(),
    )
}

fn solid(width: u32, height: u32, value: u8) -> ImageSource {
    ImageSource::from_rgba(width, height, vec![value; (width * height * 4) as usize])
}

fn cached(renderer: &mut Renderer<HeadlessBackend>, children: Vec<Node>) -> Node {
    let descriptor = renderer.create_cache(Rect::new(0.0, 0.0, 16.0, 16.0), 1.0);
    Node::container(children).with_cache(descriptor)
}

fn range(values: &[f32]) -> (f32, f32) {
    values
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

#[test]
fn transparent_tree_issues_no_draw() {
    let mut r = renderer(4, 4);
    let stage = Node::container(vec![Node::bitmap(solid(2, 2, 255)), Node::bitmap(solid(2, 2, 1))])
        .with_alpha(0.0);

    let stats = r.render_frame(&stage).unwrap();
    assert_eq!(stats.draw_calls, 0);
    assert!(r.backend().draws().is_empty());
    assert_eq!(r.texture_count(), 0);
}

#[test]
fn full_card_buffer_splits_batches_in_order() {
    let mut r = renderer(4, 4);
    r.set_max_cards_per_batch(4).unwrap();
    let image = solid(2, 2, 9);
    #[allow(clippy::cast_precision_loss)]
    let children = (0..5)
        .map(|i| Node::bitmap(image.clone()).at(i as f32 * 10.0, 0.0))
        .collect();

    let stats = r.render_frame(&Node::container(children)).unwrap();
    assert_eq!(stats.draw_calls, 2);
    assert_eq!(stats.cards, 5);

    let draws = r.backend().draws();
    assert_eq!(draws[0].cards(), 4);
    assert_eq!(draws[1].cards(), 1);
    assert_eq!(draws[0].positions[0], 0.0);
    assert_eq!(draws[0].positions[12], 10.0);
    assert_eq!(draws[1].positions[0], 40.0);
    // One texture for all five cards.
    assert_eq!(stats.uploads, 1);
}

#[test]
fn running_out_of_slots_flushes_and_evicts() {
    let mut r = renderer(2, 2);
    let (a, b, c) = (solid(1, 1, 1), solid(1, 1, 2), solid(1, 1, 3));
    let stage = Node::container(vec![
        Node::bitmap(a.clone()),
        Node::bitmap(b.clone()),
        Node::bitmap(c.clone()),
    ]);

    let stats = r.render_frame(&stage).unwrap();
    assert_eq!(stats.draw_calls, 2);
    let draws = r.backend().draws();
    assert_eq!(draws[0].cards(), 2);
    assert_eq!(draws[1].cards(), 1);

    assert_eq!(r.active_slot(&a), None);
    assert_eq!(r.active_slot(&b), Some(1));
    assert_eq!(r.active_slot(&c), Some(0));
    assert_eq!(r.texture_count(), 3);
}

#[test]
fn overlapping_cards_keep_tree_order() {
    let mut r = renderer(4, 4);
    let (below, above) = (solid(2, 2, 10), solid(2, 2, 20));
    let stage = Node::container(vec![Node::bitmap(below.clone()), Node::bitmap(above.clone())]);
    r.render_frame(&stage).unwrap();

    let draw = &r.backend().draws()[0];
    let below_slot = r.active_slot(&below).unwrap();
    let above_slot = r.active_slot(&above).unwrap();
    assert_eq!(draw.card_texture(0), draw.units[below_slot]);
    assert_eq!(draw.card_texture(1), draw.units[above_slot]);
    assert_ne!(draw.card_texture(0), draw.card_texture(1));
}

#[test]
fn whole_images_use_full_uvs_and_regions_use_their_part() {
    let mut r = renderer(4, 4);
    let image = solid(4, 4, 50);
    r.render_frame(&Node::container(vec![Node::bitmap(image.clone())]))
        .unwrap();
    assert_eq!(range(&r.backend().draws()[0].uvs), (0.0, 1.0));

    r.backend_mut().clear_log();
    let region = Node::bitmap_region(image, Rect::new(1.0, 1.0, 2.0, 2.0)).at(5.0, 5.0);
    r.render_frame(&Node::container(vec![region])).unwrap();
    let draw = &r.backend().draws()[0];
    assert_eq!(range(&draw.uvs), (0.25, 0.75));
    assert_eq!(range(&draw.positions), (5.0, 7.0));
}

#[test]
fn sprite_frames_are_placed_around_registration_point() {
    let mut r = renderer(4, 4);
    let sheet = Arc::new(SpriteSheet::new(vec![SpriteFrame::new(
        solid(4, 4, 70),
        Rect::new(2.0, 0.0, 2.0, 2.0),
        1.0,
        1.0,
    )]));
    r.render_frame(&Node::container(vec![Node::sprite(sheet, 0).at(10.0, 10.0)]))
        .unwrap();

    let draw = &r.backend().draws()[0];
    assert_eq!(range(&draw.positions), (9.0, 11.0));
    assert_eq!(range(&draw.uvs), (0.0, 1.0));
    let us: Vec<f32> = draw.uvs.iter().step_by(2).copied().collect();
    assert_eq!(range(&us), (0.5, 1.0));
}

#[test]
fn same_tree_produces_same_output() {
    let mut r = renderer(4, 4);
    let mut stage = Node::container(vec![
        Node::bitmap(solid(2, 2, 200)).at(3.0, 4.0).rotated(30.0),
        Node::bitmap(solid(4, 4, 100)).with_alpha(0.5),
    ]);

    r.render_frame(&stage).unwrap();
    let first = r.backend().screen_digest();
    r.render_frame(&stage).unwrap();
    assert_eq!(r.backend().screen_digest(), first);

    stage.children_mut().unwrap()[1].alpha = 0.25;
    r.render_frame(&stage).unwrap();
    assert_ne!(r.backend().screen_digest(), first);
}

#[test]
fn pending_source_is_drawn_once_ready() {
    let mut r = renderer(4, 4);
    let image = ImageSource::pending(2, 2);
    let stage = Node::container(vec![Node::bitmap(image.clone())]);

    let stats = r.render_frame(&stage).unwrap();
    assert_eq!(stats.cards, 0);
    assert_eq!(r.backend().upload_count(), 1); // placeholder only

    image.set_pixels(2, 2, vec![255; 16]);
    let stats = r.render_frame(&stage).unwrap();
    assert_eq!(stats.cards, 1);
    assert_eq!(stats.uploads, 1);
}

#[test]
fn unused_textures_are_purged() {
    let mut r = renderer(4, 4);
    let (kept, dropped) = (solid(1, 1, 1), solid(1, 1, 2));
    let both = Node::container(vec![Node::bitmap(kept.clone()), Node::bitmap(dropped.clone())]);
    let one = Node::container(vec![Node::bitmap(kept.clone())]);

    r.render_frame(&both).unwrap();
    r.render_frame(&one).unwrap();
    r.render_frame(&one).unwrap();
    let live = r.backend().live_textures();

    assert_eq!(r.purge_unused(None), 0);
    assert_eq!(r.purge_unused(Some(2)), 1);
    assert_eq!(r.texture_count(), 1);
    assert_eq!(r.backend().live_textures(), live - 1);
    assert_eq!(r.active_slot(&dropped), None);
    assert!(r.active_slot(&kept).is_some());
}

#[test]
fn safe_release_waits_for_every_sharing_source() {
    let mut r = renderer(4, 4);
    let a = solid(2, 2, 5).with_key("atlas");
    let b = solid(2, 2, 5).with_key("atlas");
    r.render_frame(&Node::container(vec![Node::bitmap(a.clone()), Node::bitmap(b.clone())]))
        .unwrap();
    assert_eq!(r.texture_count(), 1);

    assert_eq!(r.release_texture(TextureRef::Source(&a), true), 0);
    assert_eq!(r.texture_count(), 1);
    assert_eq!(r.release_texture(TextureRef::Source(&b), true), 1);
    assert_eq!(r.texture_count(), 0);
}

#[test]
fn unsafe_release_drops_shared_texture_at_once() {
    let mut r = renderer(4, 4);
    let a = solid(2, 2, 5).with_key("shared");
    let b = solid(2, 2, 5).with_key("shared");
    r.render_frame(&Node::container(vec![Node::bitmap(a.clone()), Node::bitmap(b)]))
        .unwrap();

    assert_eq!(r.release_texture(TextureRef::Source(&a), false), 1);
    assert_eq!(r.texture_count(), 0);
}

#[test]
fn shared_texture_is_not_reuploaded_every_frame() {
    let mut r = renderer(4, 4);
    let a = solid(2, 2, 5).with_key("atlas");
    let b = solid(2, 2, 7).with_key("atlas");
    a.invalidate();
    let stage = Node::container(vec![Node::bitmap(a.clone()), Node::bitmap(b.clone())]);

    let uploads: Vec<_> = (0..3)
        .map(|_| r.render_frame(&stage).unwrap().uploads)
        .collect();
    assert_eq!(uploads, vec![1, 0, 0]);
    assert_eq!(r.texture_count(), 1);

    // Both cards of a frame sample the same pixels.
    let draw = r.backend().draws().last().unwrap();
    assert_eq!(draw.card_texture(0), draw.card_texture(1));

    b.invalidate();
    assert_eq!(r.render_frame(&stage).unwrap().uploads, 1);
    assert_eq!(r.render_frame(&stage).unwrap().uploads, 0);
}

#[test]
fn unchanged_slots_are_not_rebound() {
    let mut r = renderer(4, 8);
    let stage = Node::container(vec![
        Node::bitmap(solid(2, 2, 1)),
        Node::bitmap(solid(2, 2, 2)),
    ]);
    r.render_frame(&stage).unwrap();
    let first = r.backend().draws().last().unwrap().card_texture(0);

    r.backend_mut().clear_log();
    r.render_frame(&stage).unwrap();
    assert_eq!(r.backend().bind_count(), 0);

    // A cache pass draws with other textures on the same units.
    let node = cached(&mut r, vec![Node::bitmap(solid(4, 4, 3))]);
    r.update_cache(&node).unwrap();
    r.backend_mut().clear_log();
    r.render_frame(&stage).unwrap();
    assert!(r.backend().bind_count() > 0);
    assert_eq!(r.backend().draws()[0].card_texture(0), first);
    assert_eq!(r.backend().bound_texture(0), first);
}

#[test]
fn displacement_map_is_sampled_from_second_unit() {
    let mut r = renderer(4, 8);
    let map = solid(4, 4, 128);
    let filter: Arc<dyn ShaderFilter> = Arc::new(DisplacementFilter::new(map, 20.0));
    let node = cached(&mut r, vec![Node::bitmap(solid(16, 16, 9))]).with_filters(vec![filter]);
    let id = node.cache.as_ref().unwrap().id();
    r.update_cache(&node).unwrap();

    let cover = r.backend().draws().iter().find(|d| d.cover).unwrap();
    let map_texture = cover.units[1].unwrap();
    assert_ne!(cover.units[0], Some(map_texture));
    assert!(cover.sampled.contains(&map_texture));
    assert_eq!(r.backend().texture_size(map_texture), Some((4, 4)));
    assert_eq!(cover.uniforms.get("u_dudv_sampler"), Some(&UniformValue::Int(1)));
    assert_eq!(cover.uniforms.get("u_power"), Some(&UniformValue::Float(20.0)));
    assert_eq!(r.backend().feedback_loops(), 0);

    // The filtered surface is what the stage shows.
    let surface = r.cache_surface(id).unwrap();
    r.backend_mut().clear_log();
    r.render_frame(&Node::container(vec![node])).unwrap();
    assert_eq!(r.backend().draws()[0].card_texture(0), Some(surface));
}

#[test]
fn releasing_a_cached_node_uncaches_it() {
    let mut r = renderer(4, 8);
    let node = cached(&mut r, vec![Node::bitmap(solid(4, 4, 30))]);
    r.update_cache(&node).unwrap();
    assert_eq!(r.backend().live_framebuffers(), 1);

    assert_eq!(r.release_texture(TextureRef::Node(&node), false), 2);
    assert_eq!(r.backend().live_framebuffers(), 0);
    // Only the placeholder is left.
    assert_eq!(r.backend().live_textures(), 1);
}

#[test]
fn out_of_range_slot_is_rejected() {
    let mut r = renderer(4, 8);
    assert!(matches!(
        r.protect_slot(8, true),
        Err(RenderError::SlotOutOfRange { index: 8, limit: 8 })
    ));
    r.protect_slot(7, true).unwrap();

    r.protect_slot(0, true).unwrap();
    let image = solid(1, 1, 1);
    r.render_frame(&Node::container(vec![Node::bitmap(image.clone())]))
        .unwrap();
    assert_eq!(r.active_slot(&image), Some(1));
}

#[test]
fn every_slot_protected_is_an_error() {
    let mut r = renderer(2, 2);
    r.protect_slot(0, true).unwrap();
    r.protect_slot(1, true).unwrap();
    let result = r.render_frame(&Node::container(vec![Node::bitmap(solid(1, 1, 1))]));
    assert!(matches!(result, Err(RenderError::NoFreeSlot)));
}

#[test]
fn lost_context_is_reported() {
    let mut r = renderer(4, 4);
    r.backend_mut().lose_context();
    let stage = Node::container(vec![Node::bitmap(solid(1, 1, 1))]);
    assert!(matches!(r.render_frame(&stage), Err(RenderError::ContextLost)));

    let mut backend = HeadlessBackend::new(4, 4);
    backend.lose_context();
    assert!(matches!(
        Renderer::new(backend, RendererConfig::default()),
        Err(RenderError::ContextLost)
    ));
}

#[test]
fn rejected_shader_is_retried_with_fewer_units() {
    let r = renderer_with(
        HeadlessBackend::new(16, 16).with_max_sampler_array(4),
        RendererConfig::default(),
    );
    assert_eq!(r.texture_units(), 4);

    let attempts = r.backend().compile_attempts();
    assert_eq!(attempts.first(), Some(&Some(16)));
    assert_eq!(attempts.last(), Some(&Some(4)));
}

#[test]
fn cache_misuse_is_reported() {
    let mut r = renderer(4, 8);
    let plain = Node::bitmap(solid(1, 1, 1));
    assert!(matches!(
        r.update_cache(&plain),
        Err(RenderError::CacheNotDefined)
    ));

    let mut other = renderer(4, 8);
    let foreign = other.create_cache(Rect::new(0.0, 0.0, 4.0, 4.0), 1.0);
    assert!(matches!(
        r.cache_subtree(&plain, &[], &foreign),
        Err(RenderError::CacheNotDefined)
    ));

    // Defined but never rendered: there is no surface to draw into.
    let fresh = r.create_cache(Rect::new(0.0, 0.0, 4.0, 4.0), 1.0);
    assert!(matches!(
        r.draw_into_target(&plain, DrawTarget::Cache(fresh.id()), false),
        Err(RenderError::CacheNotDefined)
    ));
}

#[test]
fn cached_subtree_draws_as_one_card() {
    let mut r = renderer(4, 8);
    let node = cached(
        &mut r,
        vec![
            Node::bitmap(solid(4, 4, 1)),
            Node::bitmap(solid(4, 4, 2)).at(4.0, 0.0),
            Node::bitmap(solid(4, 4, 3)).at(8.0, 0.0),
        ],
    )
    .at(20.0, 20.0);
    let id = node.cache.as_ref().unwrap().id();
    r.update_cache(&node).unwrap();

    r.backend_mut().clear_log();
    let stats = r.render_frame(&Node::container(vec![node])).unwrap();
    assert_eq!((stats.draw_calls, stats.cards), (1, 1));

    let draw = &r.backend().draws()[0];
    assert_eq!(draw.card_texture(0), r.cache_surface(id));
    assert_eq!(range(&draw.positions), (20.0, 36.0));
}

#[test]
fn ignoring_caches_draws_content() {
    let mut r = renderer(4, 8);
    let node = cached(
        &mut r,
        vec![Node::bitmap(solid(4, 4, 1)), Node::bitmap(solid(4, 4, 2))],
    );
    r.update_cache(&node).unwrap();

    let stats = r.draw_into_target(&node, DrawTarget::Output, true).unwrap();
    assert_eq!(stats.cards, 2);
}

#[test]
fn nested_cache_is_sampled_from_its_surface() {
    let mut r = renderer(4, 8);
    let inner = cached(
        &mut r,
        vec![Node::bitmap(solid(4, 4, 1)), Node::bitmap(solid(4, 4, 2))],
    );
    let inner_id = inner.cache.as_ref().unwrap().id();
    r.update_cache(&inner).unwrap();

    let outer = cached(&mut r, vec![inner, Node::bitmap(solid(4, 4, 3)).at(8.0, 8.0)]);
    let outer_id = outer.cache.as_ref().unwrap().id();
    r.update_cache(&outer).unwrap();

    let pass = r.backend().draws().last().unwrap();
    assert!(pass.target.is_some());
    assert_eq!(pass.cards(), 2);
    assert_eq!(pass.card_texture(0), r.cache_surface(inner_id));
    assert_eq!(r.backend().feedback_loops(), 0);

    r.backend_mut().clear_log();
    r.render_frame(&Node::container(vec![outer])).unwrap();
    let draw = &r.backend().draws()[0];
    assert_eq!(draw.cards(), 1);
    assert_eq!(draw.card_texture(0), r.cache_surface(outer_id));
}

#[test]
fn filter_chain_never_reads_its_target() {
    let mut r = renderer(4, 8);
    let filters: Vec<Arc<dyn ShaderFilter>> = vec![
        Arc::new(BlurFilter::new(3.0, 3.0, 2)),
        Arc::new(ColorFilter::multiply(0.5, 0.5, 0.5, 1.0)),
        Arc::new(BlurFilter::new(1.0, 0.0, 1)),
        Arc::new(ColorFilter::default()),
    ];
    let node = cached(&mut r, vec![Node::bitmap(solid(8, 8, 40))]).with_filters(filters);
    let id = node.cache.as_ref().unwrap().id();

    r.update_cache(&node).unwrap();
    r.update_cache(&node).unwrap();
    assert_eq!(r.backend().feedback_loops(), 0);

    let covers = r.backend().draws().iter().filter(|d| d.cover).count();
    assert_eq!(covers, 8);

    // Blur padding grows the surface past the cached bounds.
    let layout = r.cache_layout(id).unwrap();
    assert!(layout.width > 16 && layout.height > 16);
}

#[test]
fn failed_target_allocation_keeps_previous_surface() {
    let mut r = renderer(4, 8);
    let node = cached(&mut r, vec![Node::bitmap(solid(4, 4, 60))]);
    let id = node.cache.as_ref().unwrap().id();
    r.update_cache(&node).unwrap();
    let surface = r.cache_surface(id).unwrap();
    let digest = r.backend().texture_digest(surface);

    let live = r.backend().live_textures();
    r.backend_mut().set_texture_budget(Some(live));
    assert!(matches!(
        r.update_cache(&node),
        Err(RenderError::ResourceExhausted(_))
    ));
    assert_eq!(r.cache_surface(id), Some(surface));
    assert_eq!(r.backend().texture_digest(surface), digest);
    assert_eq!(r.backend().bound_framebuffer(), None);

    r.backend_mut().clear_log();
    r.render_frame(&Node::container(vec![node])).unwrap();
    assert_eq!(r.backend().draws()[0].card_texture(0), Some(surface));
}

#[test]
fn drawing_into_a_cache_adds_to_its_surface() {
    let mut r = renderer(4, 8);
    let node = cached(&mut r, vec![Node::bitmap(solid(4, 4, 60))]);
    let id = node.cache.as_ref().unwrap().id();
    r.update_cache(&node).unwrap();
    let surface = r.cache_surface(id).unwrap();
    let before = r.backend().texture_digest(surface);

    let overlay = Node::bitmap(solid(2, 2, 255)).at(1.0, 1.0);
    let stats = r
        .draw_into_target(&overlay, DrawTarget::Cache(id), false)
        .unwrap();
    assert_eq!(stats.draw_calls, 1);
    assert_ne!(r.backend().texture_digest(surface), before);
    assert!(r.backend().draws().last().unwrap().target.is_some());
    assert_eq!(r.backend().bound_framebuffer(), None);
    assert_eq!(r.backend().feedback_loops(), 0);
}

#[test]
fn cache_controlled_renderer_writes_the_output() {
    let config = RendererConfig {
        cache_controlled: true,
        ..RendererConfig::default()
    };
    let mut r = renderer_with(HeadlessBackend::new(4, 8), config);

    let plain = cached(&mut r, vec![Node::bitmap(solid(4, 4, 80))]);
    let plain_id = plain.cache.as_ref().unwrap().id();
    r.update_cache(&plain).unwrap();
    assert_eq!(r.backend().live_framebuffers(), 0);
    assert_eq!(r.backend().draws().last().unwrap().target, None);
    assert_eq!(r.cache_surface(plain_id), None);

    let filtered = cached(&mut r, vec![Node::bitmap(solid(4, 4, 80))])
        .with_filters(vec![Arc::new(ColorFilter::default())]);
    r.update_cache(&filtered).unwrap();
    assert_eq!(r.backend().live_framebuffers(), 2);

    let blit = r.backend().draws().last().unwrap();
    assert!(blit.cover);
    assert_eq!(blit.target, None);
    assert_eq!(blit.uniforms.get("u_flip_y"), Some(&UniformValue::Bool(true)));
    assert_eq!(r.backend().feedback_loops(), 0);
}

#[test]
fn repeated_cache_pass_is_bit_identical() {
    let mut r = renderer(4, 8);
    let node = cached(
        &mut r,
        vec![
            Node::bitmap(solid(4, 4, 10)).rotated(15.0),
            Node::bitmap(solid(2, 2, 90)).at(6.0, 6.0).with_alpha(0.5),
        ],
    )
    .with_filters(vec![
        Arc::new(ColorFilter::multiply(1.0, 0.5, 0.25, 1.0)),
        Arc::new(BlurFilter::new(2.0, 2.0, 1)),
    ]);
    let id = node.cache.as_ref().unwrap().id();

    r.update_cache(&node).unwrap();
    let first = r.cache_surface(id).unwrap();
    let digest = r.backend().texture_digest(first);

    r.update_cache(&node).unwrap();
    let second = r.cache_surface(id).unwrap();
    assert_eq!(r.backend().texture_digest(second), digest);
}
