//! CPU-side vertex buffers for one batched draw call.

use crate::geom::{Matrix2D, QuadBounds, UvRect};

/// Vertices per card (two triangles).
pub const VERTICES_PER_CARD: usize = 6;

/// Returned by [`BatchBuffers::append_card`] when the buffers are full.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("batch is full ({0} cards)")]
pub struct BatchFull(pub usize);

/// Four parallel attribute streams sized for `max_cards` cards.
///
/// Positions and UVs hold two floats per vertex; texture index and alpha
/// one each. Only the first `cards * 6` vertices are meaningful.
#[derive(Debug, Clone)]
pub struct BatchBuffers {
    positions: Vec<f32>,
    uvs: Vec<f32>,
    texture_indices: Vec<f32>,
    alphas: Vec<f32>,
    cards: usize,
    max_cards: usize,
}

impl BatchBuffers {
    /// Allocates buffers for `max_cards` cards (at least one).
    pub fn new(max_cards: usize) -> Self {
        let max_cards = max_cards.max(1);
        let vertices = max_cards * VERTICES_PER_CARD;
        Self {
            positions: Vec::with_capacity(vertices * 2),
            uvs: Vec::with_capacity(vertices * 2),
            texture_indices: Vec::with_capacity(vertices),
            alphas: Vec::with_capacity(vertices),
            cards: 0,
            max_cards,
        }
    }

    /// Cards currently packed.
    pub fn cards(&self) -> usize {
        self.cards
    }

    /// Capacity in cards.
    pub fn max_cards(&self) -> usize {
        self.max_cards
    }

    /// Packed vertex count.
    pub fn vertex_count(&self) -> usize {
        self.cards * VERTICES_PER_CARD
    }

    /// Whether no card is packed.
    pub fn is_empty(&self) -> bool {
        self.cards == 0
    }

    /// Whether another card would not fit.
    pub fn is_full(&self) -> bool {
        self.cards >= self.max_cards
    }

    /// Position stream, two floats per vertex.
    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    /// UV stream, two floats per vertex.
    pub fn uvs(&self) -> &[f32] {
        &self.uvs
    }

    /// Texture slot stream, one float per vertex.
    pub fn texture_indices(&self) -> &[f32] {
        &self.texture_indices
    }

    /// Alpha stream, one float per vertex.
    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }

    /// Appends one card.
    ///
    /// The local quad corners are pushed through `matrix` and emitted as
    /// TL, BL, TR, BL, TR, BR. Every vertex gets the same slot and alpha.
    ///
    /// # Errors
    ///
    /// Returns [`BatchFull`] when the card limit has been reached. The
    /// buffers are left untouched; the caller must flush first.
    pub fn append_card(
        &mut self,
        quad: QuadBounds,
        matrix: &Matrix2D,
        uv: UvRect,
        slot: usize,
        alpha: f32,
    ) -> Result<(), BatchFull> {
        if self.is_full() {
            return Err(BatchFull(self.max_cards));
        }

        let tl = matrix.transform_point(quad.left, quad.top);
        let bl = matrix.transform_point(quad.left, quad.bottom);
        let tr = matrix.transform_point(quad.right, quad.top);
        let br = matrix.transform_point(quad.right, quad.bottom);

        for p in [tl, bl, tr, bl, tr, br] {
            self.positions.extend_from_slice(&p);
        }
        self.uvs.extend_from_slice(&[
            uv.left, uv.top, // TL
            uv.left, uv.bottom, // BL
            uv.right, uv.top, // TR
            uv.left, uv.bottom, // BL
            uv.right, uv.top, // TR
            uv.right, uv.bottom, // BR
        ]);

        // Slot counts are tiny, the conversion is exact.
        #[expect(clippy::cast_precision_loss)]
        let index = slot as f32;
        self.texture_indices.extend_from_slice(&[index; VERTICES_PER_CARD]);
        self.alphas.extend_from_slice(&[alpha; VERTICES_PER_CARD]);

        self.cards += 1;
        Ok(())
    }

    /// Drops every packed card, keeping the allocation.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.uvs.clear();
        self.texture_indices.clear();
        self.alphas.clear();
        self.cards = 0;
    }

    /// Changes the card capacity. Packed cards are dropped.
    pub fn resize(&mut self, max_cards: usize) {
        *self = Self::new(max_cards);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn card_emits_six_vertices_in_order() {
        let mut buffers = BatchBuffers::new(4);
        buffers
            .append_card(
                QuadBounds::sized(10.0, 20.0),
                &Matrix2D::scale_translate(1.0, 5.0, 5.0),
                UvRect::FULL,
                3,
                0.5,
            )
            .unwrap();

        assert_eq!(buffers.vertex_count(), 6);
        assert_eq!(
            buffers.positions(),
            &[5.0, 5.0, 5.0, 25.0, 15.0, 5.0, 5.0, 25.0, 15.0, 5.0, 15.0, 25.0]
        );
        assert_eq!(
            buffers.uvs(),
            &[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0]
        );
        assert_eq!(buffers.texture_indices(), &[3.0; 6]);
        assert_eq!(buffers.alphas(), &[0.5; 6]);
    }

    #[test]
    fn full_buffer_rejects_cards() {
        let mut buffers = BatchBuffers::new(2);
        let quad = QuadBounds::sized(1.0, 1.0);
        for _ in 0..2 {
            buffers
                .append_card(quad, &Matrix2D::IDENTITY, UvRect::FULL, 0, 1.0)
                .unwrap();
        }
        assert!(buffers.is_full());
        assert_eq!(
            buffers.append_card(quad, &Matrix2D::IDENTITY, UvRect::FULL, 0, 1.0),
            Err(BatchFull(2))
        );
        assert_eq!(buffers.cards(), 2);

        buffers.clear();
        assert!(buffers.is_empty());
        assert!(buffers.positions().is_empty());
    }

    #[test]
    fn resize_changes_capacity() {
        let mut buffers = BatchBuffers::new(1);
        buffers.resize(0);
        assert_eq!(buffers.max_cards(), 1);
        buffers.resize(64);
        assert_eq!(buffers.max_cards(), 64);
    }
}
