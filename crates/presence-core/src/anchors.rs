//! SCRFD anchor geometry.
//!
//! Every detector output row corresponds to one anchor slot. The flat order
//! here must match the order the model flattens its per-stride heads: strides
//! concatenated in configuration order, row-major within a stride, two slots
//! per grid cell.

use std::ops::Range;

/// Number of anchors SCRFD predicts per grid cell (two default sizes, same center).
pub const ANCHORS_PER_CELL: usize = 2;

/// One candidate detection position in input-tensor pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorSlot {
    pub center_x: f32,
    pub center_y: f32,
    pub stride: usize,
}

/// Cells per axis for one stride: `ceil(input_size / stride)`.
pub fn grid_size(input_size: usize, stride: usize) -> usize {
    input_size.div_ceil(stride)
}

/// Anchor count contributed by one stride.
pub fn anchors_for_stride(input_size: usize, stride: usize) -> usize {
    let g = grid_size(input_size, stride);
    g * g * ANCHORS_PER_CELL
}

/// Build the flat anchor list for a square input.
///
/// Zero strides are ignored.
pub fn build_anchors(input_size: usize, strides: &[usize]) -> Vec<AnchorSlot> {
    let total = strides
        .iter()
        .filter(|&&s| s > 0)
        .map(|&s| anchors_for_stride(input_size, s))
        .sum();
    let mut anchors = Vec::with_capacity(total);

    for &stride in strides.iter().filter(|&&s| s > 0) {
        let grid = grid_size(input_size, stride);
        let s = stride as f32;
        for i in 0..grid {
            for j in 0..grid {
                let slot = AnchorSlot {
                    center_x: (j as f32 + 0.5) * s,
                    center_y: (i as f32 + 0.5) * s,
                    stride,
                };
                for _ in 0..ANCHORS_PER_CELL {
                    anchors.push(slot);
                }
            }
        }
    }

    anchors
}

/// Anchor list plus the slice each stride occupies in it.
///
/// Built once at startup and shared by every frame.
#[derive(Debug, Clone)]
pub struct AnchorTable {
    input_size: usize,
    slots: Vec<AnchorSlot>,
    ranges: Vec<(usize, Range<usize>)>,
}

impl AnchorTable {
    pub fn new(input_size: usize, strides: &[usize]) -> Self {
        let slots = build_anchors(input_size, strides);

        let mut ranges = Vec::with_capacity(strides.len());
        let mut offset = 0;
        for &stride in strides.iter().filter(|&&s| s > 0) {
            let n = anchors_for_stride(input_size, stride);
            ranges.push((stride, offset..offset + n));
            offset += n;
        }

        tracing::debug!(input_size, ?strides, anchors = slots.len(), "anchor table built");

        Self {
            input_size,
            slots,
            ranges,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn strides(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().map(|(s, _)| *s)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Anchors belonging to `stride`, in the order its output buffers use.
    pub fn for_stride(&self, stride: usize) -> Option<&[AnchorSlot]> {
        self.ranges
            .iter()
            .find(|(s, _)| *s == stride)
            .map(|(_, r)| &self.slots[r.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_count_matches_formula() {
        let anchors = build_anchors(640, &[8, 16, 32]);
        // 2 * (80² + 40² + 20²)
        assert_eq!(anchors.len(), 2 * (6400 + 1600 + 400));
    }

    #[test]
    fn test_anchor_count_non_divisible_input() {
        // ceil(100/32) = 4
        let anchors = build_anchors(100, &[32]);
        assert_eq!(anchors.len(), 2 * 4 * 4);
        let last = anchors.last().unwrap();
        assert_eq!((last.center_x, last.center_y), (112.0, 112.0));
    }

    #[test]
    fn test_anchors_deterministic() {
        assert_eq!(build_anchors(320, &[8, 16, 32]), build_anchors(320, &[8, 16, 32]));
    }

    #[test]
    fn test_anchor_layout_row_major_with_pairs() {
        let anchors = build_anchors(32, &[16]);
        // grid 2x2, two slots per cell
        let centers: Vec<(f32, f32)> = anchors.iter().map(|a| (a.center_x, a.center_y)).collect();
        assert_eq!(
            centers,
            vec![
                (8.0, 8.0), (8.0, 8.0),
                (24.0, 8.0), (24.0, 8.0),
                (8.0, 24.0), (8.0, 24.0),
                (24.0, 24.0), (24.0, 24.0),
            ]
        );
        assert!(anchors.iter().all(|a| a.stride == 16));
    }

    #[test]
    fn test_table_stride_ranges() {
        let table = AnchorTable::new(640, &[8, 16, 32]);
        assert_eq!(table.len(), 16800);
        assert_eq!(table.for_stride(8).unwrap().len(), 12800);
        assert_eq!(table.for_stride(16).unwrap().len(), 3200);
        let s32 = table.for_stride(32).unwrap();
        assert_eq!(s32.len(), 800);
        assert_eq!(s32[0].stride, 32);
        assert_eq!((s32[0].center_x, s32[0].center_y), (16.0, 16.0));
        assert!(table.for_stride(64).is_none());
        assert_eq!(table.strides().collect::<Vec<_>>(), vec![8, 16, 32]);
    }
}
