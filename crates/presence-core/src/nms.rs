//! Greedy non-maximum suppression.

use crate::types::{BoundingBox, Detection};
use std::cmp::Ordering;

/// Compute Intersection-over-Union between two boxes.
///
/// Zero-area (or inverted) boxes have IoU 0 with everything.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter_area = inter_w * inter_h;

    let union_area = area_a + area_b - inter_area;
    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Return the indices of detections kept by greedy NMS, best first.
///
/// Equal confidences keep their input order, so identical input always
/// yields identical output.
pub fn suppress(detections: &[Detection], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&i, &j| {
        detections[j]
            .confidence
            .partial_cmp(&detections[i].confidence)
            .unwrap_or(Ordering::Equal)
            .then(i.cmp(&j))
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for &j in &order[pos + 1..] {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x1: x, y1: y, x2: x + w, y2: y + h },
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_det(0.0, 0.0, 100.0, 100.0, 1.0).bbox;
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_det(0.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let b = make_det(20.0, 20.0, 10.0, 10.0, 1.0).bbox;
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_det(0.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let b = make_det(5.0, 0.0, 10.0, 10.0, 1.0).bbox;
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_box() {
        let a = make_det(5.0, 5.0, 0.0, 0.0, 1.0).bbox;
        assert_eq!(iou(&a, &a), 0.0);
    }

    #[test]
    fn test_nms_collapses_high_overlap() {
        // 100x100 vs 100x90 inside it: IoU = 0.9
        let dets = vec![
            make_det(0.0, 0.0, 100.0, 90.0, 0.8),
            make_det(0.0, 0.0, 100.0, 100.0, 0.95),
        ];
        assert!((iou(&dets[0].bbox, &dets[1].bbox) - 0.9).abs() < 1e-6);
        assert_eq!(suppress(&dets, 0.4), vec![1]);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let dets = vec![
            make_det(0.0, 0.0, 100.0, 100.0, 0.9),
            make_det(5.0, 5.0, 100.0, 100.0, 0.8),
            make_det(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        assert_eq!(suppress(&dets, 0.4), vec![0, 2]);
    }

    #[test]
    fn test_nms_disjoint_faces_survive_any_threshold() {
        let dets = vec![
            make_det(0.0, 0.0, 50.0, 50.0, 0.9),
            make_det(400.0, 300.0, 60.0, 60.0, 0.85),
        ];
        for t in [0.01, 0.2, 0.4, 0.6, 0.99] {
            assert_eq!(suppress(&dets, t).len(), 2, "threshold {t}");
        }
    }

    #[test]
    fn test_nms_ties_break_by_index() {
        let dets = vec![
            make_det(300.0, 0.0, 10.0, 10.0, 0.7),
            make_det(0.0, 0.0, 10.0, 10.0, 0.7),
            make_det(1.0, 0.0, 10.0, 10.0, 0.7),
        ];
        assert_eq!(suppress(&dets, 0.4), vec![0, 1]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(suppress(&[], 0.4).is_empty());
    }
}
