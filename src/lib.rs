//! A batched 2D scene-graph renderer using OpenGL via [glow].
//!
//! This crate provides [`Renderer`], which walks a retained tree of
//! transformable, alpha-blended nodes and turns it into as few draw calls
//! as it can. Every image or sprite frame becomes a textured quad (a
//! *card*); cards sampling up to `N` different textures share one draw
//! call, where `N` is the number of texture units the device offers.
//!
//! # Features
//!
//! - **Texture slot management**: textures are assigned to hardware units
//!   round-robin and re-uploaded only when their source changes.
//! - **Lazy texture upload**: pixel sources may be filled from another
//!   thread; pending sources are skipped until ready.
//! - **Shader variants**: the batch program is generated for the unit
//!   count in use and recompiled with fewer units if the driver refuses.
//! - **Render-to-texture caches** with ping-pong targets, so chains of
//!   filters ([`ColorFilter`], [`ColorMatrixFilter`], [`BlurFilter`],
//!   [`AlphaMapFilter`], [`DisplacementFilter`], [`AberrationFilter`] or
//!   your own [`ShaderFilter`]) never read the texture they write.
//! - **Headless backend** recording every call, for tests and tools.
//!
//! # Safety
//!
//! Creating a [`GlowBackend`] requires a valid, current OpenGL context and
//! is therefore `unsafe`. Once created, the backend and the renderer
//! driving it assume that context stays current.
//!
//! [glow]: https://docs.rs/glow

pub mod allocator;
pub mod backend;
pub mod batch;
pub mod cache;
mod compositor;
mod config;
mod error;
pub mod filters;
mod geom;
mod logging;
mod node;
pub mod registry;
mod render;
pub mod shaders;
mod types;

#[cfg(feature = "glow")]
pub use backend::GlowBackend;
pub use backend::{
    Command, DrawCall, GpuBackend, HeadlessBackend, HeadlessFramebuffer, HeadlessProgram,
    HeadlessTexture, HeadlessUniform, TextureFiltering, TextureUnitLimits, UniformValue,
    VertexAttribute,
};
pub use cache::{CacheDescriptor, CacheId, CacheLayout};
pub use config::{
    Color, ParseColorError, RendererConfig, DEFAULT_MAX_CARDS_PER_BATCH, DEFAULT_PURGE_THRESHOLD,
};
pub use error::{RenderError, RenderResult};
pub use filters::{
    AberrationFilter, AlphaMapFilter, BlurFilter, ColorFilter, ColorMatrixFilter,
    DisplacementFilter, FilterContext, FilterInput, ShaderFilter,
};
pub use geom::{Matrix2D, QuadBounds, Rect, UvRect};
pub use logging::{init_logging, LoggingConfig};
pub use node::{DrawableNode, Node, NodeContent, NodeKind, Transform};
pub use registry::StoreId;
#[cfg(feature = "glow")]
pub use render::GlowRenderer;
pub use render::{DrawPhase, DrawTarget, FrameStats, Renderer, TextureRef};
pub use shaders::{build_source, ShaderSource, ShaderVariant};
pub use types::{premultiply_rgba, ImageSource, PixelSnapshot, SourceKey, SpriteFrame, SpriteSheet};
