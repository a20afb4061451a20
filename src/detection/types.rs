//! 检测数据结构定义
//! Data structures shared by dispatcher, NMS and tracker

use std::path::PathBuf;

/// 检测框 (源图像像素坐标, 左上角 + 宽高)
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub label: String,
    pub confidence: f32,
    /// 跟踪ID, 0 表示未分配
    pub track_id: u32,
}

impl DetectionBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            label: label.into(),
            confidence,
            track_id: 0,
        }
    }

    /// 获取中心点
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// 计算IOU (Intersection over Union), 不相交时为 0
    pub fn iou(&self, other: &DetectionBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }

        intersection / union
    }
}

/// 单个模型对单帧的推理结果
#[derive(Clone, Debug, Default)]
pub struct InferenceResult {
    pub model_path: PathBuf,
    pub boxes: Vec<DetectionBox>,
    pub inference_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_and_area() {
        let b = DetectionBox::new(10.0, 20.0, 30.0, 40.0, "person", 0.9);
        assert_eq!(b.center(), (25.0, 40.0));
        assert_eq!(b.area(), 1200.0);
        assert_eq!(b.track_id, 0);
    }

    #[test]
    fn test_iou() {
        let a = DetectionBox::new(0.0, 0.0, 10.0, 10.0, "a", 0.9);
        let b = DetectionBox::new(5.0, 0.0, 10.0, 10.0, "a", 0.8);
        // 交集 50, 并集 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);

        let far = DetectionBox::new(100.0, 100.0, 10.0, 10.0, "a", 0.8);
        assert_eq!(a.iou(&far), 0.0);

        // 边相接不算相交
        let touching = DetectionBox::new(10.0, 0.0, 10.0, 10.0, "a", 0.8);
        assert_eq!(a.iou(&touching), 0.0);
    }
}
