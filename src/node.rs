//! What the renderer needs from a scene graph, plus a minimal node type.
//!
//! The renderer only reads the tree through [`DrawableNode`]. [`Node`] is
//! a small owned implementation good enough for tests and simple scenes.

use std::sync::Arc;

use crate::cache::CacheDescriptor;
use crate::filters::ShaderFilter;
use crate::geom::{Matrix2D, Rect};
use crate::types::{ImageSource, SpriteSheet};

/// Pixels a node draws.
#[derive(Debug, Clone, Copy)]
pub enum NodeContent<'a> {
    /// Nothing (pure containers, shapes the renderer does not handle).
    None,
    /// A whole image, or the `source_rect` part of it.
    Image {
        /// The image.
        image: &'a ImageSource,
        /// Sub-rectangle in image pixels.
        source_rect: Option<Rect>,
    },
    /// One frame of a sprite sheet.
    Frame {
        /// The sheet.
        sheet: &'a SpriteSheet,
        /// Frame index.
        frame: usize,
    },
}

/// A node of a retained scene graph as seen by the renderer.
///
/// Children are drawn in index order, after their parent.
pub trait DrawableNode {
    /// Transform relative to the parent.
    fn local_matrix(&self) -> Matrix2D;

    /// Opacity multiplier, `0..=1`.
    fn alpha(&self) -> f32 {
        1.0
    }

    /// Whether the node (and its subtree) is drawn.
    fn visible(&self) -> bool {
        true
    }

    /// Whether the node has children to descend into.
    fn is_container(&self) -> bool {
        false
    }

    /// Number of children.
    fn child_count(&self) -> usize {
        0
    }

    /// Child by index.
    fn child(&self, _index: usize) -> Option<&dyn DrawableNode> {
        None
    }

    /// Pixels drawn by the node itself.
    fn content(&self) -> NodeContent<'_> {
        NodeContent::None
    }

    /// Cache defined on this node.
    fn cache(&self) -> Option<&CacheDescriptor> {
        None
    }

    /// Filters applied when the cache is updated.
    fn filters(&self) -> &[Arc<dyn ShaderFilter>] {
        &[]
    }
}

/// Display properties composed into a [`Matrix2D`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// X position.
    pub x: f32,
    /// Y position.
    pub y: f32,
    /// Horizontal scale.
    pub scale_x: f32,
    /// Vertical scale.
    pub scale_y: f32,
    /// Rotation in degrees, clockwise.
    pub rotation: f32,
    /// Horizontal skew in degrees.
    pub skew_x: f32,
    /// Vertical skew in degrees.
    pub skew_y: f32,
    /// Registration point x.
    pub reg_x: f32,
    /// Registration point y.
    pub reg_y: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            skew_x: 0.0,
            skew_y: 0.0,
            reg_x: 0.0,
            reg_y: 0.0,
        }
    }
}

impl Transform {
    /// The local matrix.
    pub fn matrix(&self) -> Matrix2D {
        Matrix2D::from_transform(
            self.x,
            self.y,
            self.scale_x,
            self.scale_y,
            self.rotation,
            self.skew_x,
            self.skew_y,
            self.reg_x,
            self.reg_y,
        )
    }
}

/// What a [`Node`] holds.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Draws nothing itself.
    Empty,
    /// Children drawn in order.
    Container(Vec<Node>),
    /// An image or part of one.
    Bitmap {
        /// The image.
        image: ImageSource,
        /// Sub-rectangle in image pixels.
        source_rect: Option<Rect>,
    },
    /// A sprite-sheet frame.
    Sprite {
        /// The sheet.
        sheet: Arc<SpriteSheet>,
        /// Current frame.
        frame: usize,
    },
}

/// A simple owned scene-graph node.
#[derive(Debug, Clone)]
pub struct Node {
    /// Display properties.
    pub transform: Transform,
    /// Opacity.
    pub alpha: f32,
    /// Visibility.
    pub visible: bool,
    /// Content.
    pub kind: NodeKind,
    /// Cache, if one was created for this node.
    pub cache: Option<CacheDescriptor>,
    /// Filters used by cache updates.
    pub filters: Vec<Arc<dyn ShaderFilter>>,
}

impl Default for Node {
    fn default() -> Self {
        Self::new(NodeKind::Empty)
    }
}

impl Node {
    /// A visible, opaque node at the origin.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            transform: Transform::default(),
            alpha: 1.0,
            visible: true,
            kind,
            cache: None,
            filters: Vec::new(),
        }
    }

    /// A container.
    pub fn container(children: Vec<Node>) -> Self {
        Self::new(NodeKind::Container(children))
    }

    /// A whole-image bitmap.
    pub fn bitmap(image: ImageSource) -> Self {
        Self::new(NodeKind::Bitmap {
            image,
            source_rect: None,
        })
    }

    /// A bitmap showing `source_rect` of `image`.
    pub fn bitmap_region(image: ImageSource, source_rect: Rect) -> Self {
        Self::new(NodeKind::Bitmap {
            image,
            source_rect: Some(source_rect),
        })
    }

    /// A sprite showing `frame` of `sheet`.
    pub fn sprite(sheet: Arc<SpriteSheet>, frame: usize) -> Self {
        Self::new(NodeKind::Sprite { sheet, frame })
    }

    /// Moves the node.
    #[must_use]
    pub fn at(mut self, x: f32, y: f32) -> Self {
        self.transform.x = x;
        self.transform.y = y;
        self
    }

    /// Scales the node.
    #[must_use]
    pub fn scaled(mut self, scale_x: f32, scale_y: f32) -> Self {
        self.transform.scale_x = scale_x;
        self.transform.scale_y = scale_y;
        self
    }

    /// Rotates the node (degrees).
    #[must_use]
    pub fn rotated(mut self, degrees: f32) -> Self {
        self.transform.rotation = degrees;
        self
    }

    /// Sets the registration point.
    #[must_use]
    pub fn with_reg(mut self, reg_x: f32, reg_y: f32) -> Self {
        self.transform.reg_x = reg_x;
        self.transform.reg_y = reg_y;
        self
    }

    /// Sets the opacity.
    #[must_use]
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Hides the node.
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// Attaches filters.
    #[must_use]
    pub fn with_filters(mut self, filters: Vec<Arc<dyn ShaderFilter>>) -> Self {
        self.filters = filters;
        self
    }

    /// Attaches a cache descriptor.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheDescriptor) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Children, if this is a container.
    pub fn children(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Container(children) => children,
            _ => &[],
        }
    }

    /// Mutable children, if this is a container.
    pub fn children_mut(&mut self) -> Option<&mut Vec<Node>> {
        match &mut self.kind {
            NodeKind::Container(children) => Some(children),
            _ => None,
        }
    }
}

impl DrawableNode for Node {
    fn local_matrix(&self) -> Matrix2D {
        self.transform.matrix()
    }

    fn alpha(&self) -> f32 {
        self.alpha
    }

    fn visible(&self) -> bool {
        self.visible
    }

    fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::Container(_))
    }

    fn child_count(&self) -> usize {
        self.children().len()
    }

    fn child(&self, index: usize) -> Option<&dyn DrawableNode> {
        self.children()
            .get(index)
            .map(|child| child as &dyn DrawableNode)
    }

    fn content(&self) -> NodeContent<'_> {
        match &self.kind {
            NodeKind::Bitmap { image, source_rect } => NodeContent::Image {
                image,
                source_rect: *source_rect,
            },
            NodeKind::Sprite { sheet, frame } => NodeContent::Frame {
                sheet,
                frame: *frame,
            },
            NodeKind::Empty | NodeKind::Container(_) => NodeContent::None,
        }
    }

    fn cache(&self) -> Option<&CacheDescriptor> {
        self.cache.as_ref()
    }

    fn filters(&self) -> &[Arc<dyn ShaderFilter>] {
        &self.filters
    }
}
