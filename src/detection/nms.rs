//! 非极大值抑制 (NMS)

use super::types::DetectionBox;

/// 贪心NMS, 原地保留结果
///
/// 按置信度降序稳定排序(同分保持输入顺序), 依次保留与已保留框IOU都不超过阈值的框.
pub fn non_max_suppression(boxes: &mut Vec<DetectionBox>, iou_threshold: f32) {
    boxes.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..boxes.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if boxes[prev_index].iou(&boxes[index]) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            boxes.swap(current_index, index);
            current_index += 1;
        }
    }
    boxes.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x: f32, y: f32, conf: f32) -> DetectionBox {
        DetectionBox::new(x, y, 20.0, 20.0, "obj", conf)
    }

    #[test]
    fn test_nms_keeps_highest_in_cluster() {
        let mut boxes = vec![bx(0.0, 0.0, 0.6), bx(1.0, 1.0, 0.9), bx(100.0, 100.0, 0.7)];
        non_max_suppression(&mut boxes, 0.5);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].confidence, 0.9);
        assert_eq!(boxes[1].confidence, 0.7);
    }

    #[test]
    fn test_nms_pairwise_iou_and_idempotent() {
        let mut boxes = Vec::new();
        for i in 0..30 {
            let offset = (i * 7 % 50) as f32;
            boxes.push(bx(offset, offset / 2.0, 0.3 + (i as f32) * 0.02));
        }
        non_max_suppression(&mut boxes, 0.5);
        for i in 0..boxes.len() {
            for j in (i + 1)..boxes.len() {
                assert!(boxes[i].iou(&boxes[j]) <= 0.5);
            }
        }
        let mut again = boxes.clone();
        non_max_suppression(&mut again, 0.5);
        assert_eq!(again, boxes);
    }

    #[test]
    fn test_nms_ties_keep_input_order() {
        let mut a = bx(0.0, 0.0, 0.8);
        a.label = "first".into();
        let mut b = bx(0.0, 0.0, 0.8);
        b.label = "second".into();
        let mut boxes = vec![a, b];
        non_max_suppression(&mut boxes, 0.5);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].label, "first");
    }

    #[test]
    fn test_nms_nan_confidence_does_not_panic() {
        let mut boxes = Vec::new();
        for i in 0..64 {
            let conf = if i % 3 == 0 { f32::NAN } else { 0.3 + (i as f32) * 0.01 };
            boxes.push(bx((i * 13 % 200) as f32, (i * 29 % 200) as f32, conf));
        }
        non_max_suppression(&mut boxes, 0.5);
        assert!(!boxes.is_empty());
        let finite: Vec<f32> = boxes.iter().map(|b| b.confidence).filter(|c| !c.is_nan()).collect();
        assert!(finite.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_nms_empty() {
        let mut boxes: Vec<DetectionBox> = Vec::new();
        non_max_suppression(&mut boxes, 0.5);
        assert!(boxes.is_empty());
    }
}
