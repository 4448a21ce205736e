//! 2D affine math and the small rectangle types the batcher works with.

/// Degrees to radians.
const DEG_TO_RAD: f32 = std::f32::consts::PI / 180.0;

/// A 2D affine transform.
///
/// Maps `(x, y)` to `(x*a + y*c + tx, x*b + y*d + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix2D {
    /// X scale / rotation component.
    pub a: f32,
    /// Y shear / rotation component.
    pub b: f32,
    /// X shear / rotation component.
    pub c: f32,
    /// Y scale / rotation component.
    pub d: f32,
    /// X translation.
    pub tx: f32,
    /// Y translation.
    pub ty: f32,
}

impl Default for Matrix2D {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Matrix2D {
    /// The identity transform.
    pub const IDENTITY: Self = Self::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0);

    /// Creates a matrix from its six components.
    pub const fn new(a: f32, b: f32, c: f32, d: f32, tx: f32, ty: f32) -> Self {
        Self { a, b, c, d, tx, ty }
    }

    /// Uniform scale followed by a translation.
    pub const fn scale_translate(scale: f32, tx: f32, ty: f32) -> Self {
        Self::new(scale, 0.0, 0.0, scale, tx, ty)
    }

    /// Returns `self × other`: `other` is applied first, then `self`.
    #[must_use]
    pub fn append(&self, other: &Self) -> Self {
        Self {
            a: self.a * other.a + self.c * other.b,
            b: self.b * other.a + self.d * other.b,
            c: self.a * other.c + self.c * other.d,
            d: self.b * other.c + self.d * other.d,
            tx: self.a * other.tx + self.c * other.ty + self.tx,
            ty: self.b * other.tx + self.d * other.ty + self.ty,
        }
    }

    /// Builds the local matrix for a set of display properties.
    ///
    /// Rotation and skew are in degrees; the registration point is
    /// subtracted after scale/rotation so it becomes the pivot.
    #[expect(clippy::too_many_arguments)] // mirrors the display property set
    #[must_use]
    pub fn from_transform(
        x: f32,
        y: f32,
        scale_x: f32,
        scale_y: f32,
        rotation: f32,
        skew_x: f32,
        skew_y: f32,
        reg_x: f32,
        reg_y: f32,
    ) -> Self {
        let (sin, cos) = if rotation % 360.0 == 0.0 {
            (0.0, 1.0)
        } else {
            (rotation * DEG_TO_RAD).sin_cos()
        };

        let scaled = Self::new(
            cos * scale_x,
            sin * scale_x,
            -sin * scale_y,
            cos * scale_y,
            0.0,
            0.0,
        );

        let mut m = if skew_x != 0.0 || skew_y != 0.0 {
            let (skew_x, skew_y) = (skew_x * DEG_TO_RAD, skew_y * DEG_TO_RAD);
            Self::new(skew_y.cos(), skew_y.sin(), -skew_x.sin(), skew_x.cos(), x, y)
                .append(&scaled)
        } else {
            Self { tx: x, ty: y, ..scaled }
        };

        if reg_x != 0.0 || reg_y != 0.0 {
            m.tx -= reg_x * m.a + reg_y * m.c;
            m.ty -= reg_x * m.b + reg_y * m.d;
        }
        m
    }

    /// Determinant of the linear part.
    pub fn determinant(&self) -> f32 {
        self.a * self.d - self.b * self.c
    }

    /// Whether the matrix collapses everything to a line or point
    /// (e.g. a zero scale).
    pub fn is_degenerate(&self) -> bool {
        self.determinant().abs() <= f32::EPSILON * f32::EPSILON
    }

    /// Inverse transform, or `None` when degenerate.
    pub fn invert(&self) -> Option<Self> {
        let n = self.determinant();
        if n == 0.0 || !n.is_finite() {
            return None;
        }
        Some(Self {
            a: self.d / n,
            b: -self.b / n,
            c: -self.c / n,
            d: self.a / n,
            tx: (self.c * self.ty - self.d * self.tx) / n,
            ty: -(self.a * self.ty - self.b * self.tx) / n,
        })
    }

    /// Applies the transform to a point.
    pub fn transform_point(&self, x: f32, y: f32) -> [f32; 2] {
        [
            x * self.a + y * self.c + self.tx,
            x * self.b + y * self.d + self.ty,
        ]
    }
}

/// An axis-aligned rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    pub width: f32,
    /// Height.
    pub height: f32,
}

impl Rect {
    /// Creates a rectangle.
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Smallest rectangle containing both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        Self::new(left, top, right - left, bottom - top)
    }

    /// Whether the rectangle covers no area.
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// A sampled region of a texture in normalized `0..=1` coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvRect {
    /// Top edge (v).
    pub top: f32,
    /// Left edge (u).
    pub left: f32,
    /// Bottom edge (v).
    pub bottom: f32,
    /// Right edge (u).
    pub right: f32,
}

impl UvRect {
    /// The whole texture.
    pub const FULL: Self = Self {
        top: 0.0,
        left: 0.0,
        bottom: 1.0,
        right: 1.0,
    };

    /// Normalizes a pixel rectangle against the size of its image.
    ///
    /// Returns [`UvRect::FULL`] for an empty image.
    pub fn from_pixels(rect: &Rect, image_width: f32, image_height: f32) -> Self {
        if image_width <= 0.0 || image_height <= 0.0 {
            return Self::FULL;
        }
        Self {
            top: rect.y / image_height,
            left: rect.x / image_width,
            bottom: (rect.y + rect.height) / image_height,
            right: (rect.x + rect.width) / image_width,
        }
    }
}

/// Local-space corners of one card: `left, top` to `right, bottom`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadBounds {
    /// Left edge.
    pub left: f32,
    /// Top edge.
    pub top: f32,
    /// Right edge.
    pub right: f32,
    /// Bottom edge.
    pub bottom: f32,
}

impl QuadBounds {
    /// Quad from the origin to `width, height`.
    pub const fn sized(width: f32, height: f32) -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            right: width,
            bottom: height,
        }
    }
}
