//! 预处理 - letterbox缩放、BGR→RGB、归一化、CHW排布, 以及跨模型的形状组去重

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use fast_image_resize as fr;
use ndarray::{Array, IxDyn};
use tracing::{debug, info};

use crate::input::Frame;
use crate::models::{ModelRegistry, ModelSession};

/// letterbox 参数
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub new_width: u32,
    pub new_height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
}

impl Letterbox {
    /// 保持宽高比缩放到目标画布内, 居中放置
    pub fn compute(orig_width: u32, orig_height: u32, target_width: u32, target_height: u32) -> Self {
        let scale = (target_width as f32 / orig_width as f32).min(target_height as f32 / orig_height as f32);
        let new_width = ((orig_width as f32 * scale).round() as u32).clamp(1, target_width);
        let new_height = ((orig_height as f32 * scale).round() as u32).clamp(1, target_height);
        Self {
            scale,
            new_width,
            new_height,
            x_offset: (target_width - new_width) / 2,
            y_offset: (target_height - new_height) / 2,
        }
    }
}

/// 某个形状组的预处理结果
#[derive(Clone, Debug)]
pub struct PreprocessedTensor {
    /// [1, 3, H, W], RGB, [0,1]
    pub tensor: Array<f32, IxDyn>,
    pub orig_width: u32,
    pub orig_height: u32,
    pub scale: f32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub shape_group: usize,
}

/// 形状组分配 (随模型集合变化重新计算)
#[derive(Debug)]
pub struct ShapePlan {
    pub generation: u64,
    pub models: Vec<Arc<ModelSession>>,
    /// 每个形状组的目标 (宽, 高)
    pub groups: Vec<(u32, u32)>,
    /// 与 `models` 一一对应的形状组编号
    pub assignments: Vec<usize>,
}

impl ShapePlan {
    pub fn build(generation: u64, models: Vec<Arc<ModelSession>>) -> Self {
        let shapes: Vec<(u32, u32)> = models
            .iter()
            .map(|m| (m.input_shape().width, m.input_shape().height))
            .collect();
        let (groups, assignments) = assign_shape_groups(&shapes);
        for (model, &group) in models.iter().zip(&assignments) {
            if model.shape_group() != Some(group) {
                debug!("🧩 {} → 形状组 {}", model.path().display(), group);
                model.assign_shape_group(group);
            }
        }
        Self {
            generation,
            models,
            groups,
            assignments,
        }
    }

    pub fn empty() -> Self {
        Self {
            generation: 0,
            models: Vec::new(),
            groups: Vec::new(),
            assignments: Vec::new(),
        }
    }
}

/// 相同 (宽, 高) 的模型共用一个形状组, 组号按首次出现顺序分配
pub fn assign_shape_groups(shapes: &[(u32, u32)]) -> (Vec<(u32, u32)>, Vec<usize>) {
    let mut groups: Vec<(u32, u32)> = Vec::new();
    let assignments = shapes
        .iter()
        .map(|shape| match groups.iter().position(|g| g == shape) {
            Some(group) => group,
            None => {
                groups.push(*shape);
                groups.len() - 1
            }
        })
        .collect();
    (groups, assignments)
}

/// 预处理阶段 (由生产者线程独占)
pub struct PreprocessingStage {
    resizer: fr::Resizer,
    plan: Arc<ShapePlan>,
    tensors_computed: u64,
}

impl Default for PreprocessingStage {
    fn default() -> Self {
        Self::new()
    }
}

impl PreprocessingStage {
    pub fn new() -> Self {
        Self {
            resizer: fr::Resizer::new(),
            plan: Arc::new(ShapePlan::empty()),
            tensors_computed: 0,
        }
    }

    /// 模型集合有变化时重建形状组
    pub fn refresh_plan(&mut self, registry: &ModelRegistry) -> Arc<ShapePlan> {
        if self.plan.generation != registry.generation() || self.plan.models.len() != registry.len() {
            let (generation, models) = registry.snapshot();
            let plan = ShapePlan::build(generation, models);
            info!(
                "🧩 形状组更新: {} 个模型 → {} 个形状组 {:?}",
                plan.models.len(),
                plan.groups.len(),
                plan.groups
            );
            self.plan = Arc::new(plan);
        }
        Arc::clone(&self.plan)
    }

    /// 为每个形状组计算一次张量
    pub fn process(&mut self, frame: &Frame, registry: &ModelRegistry) -> Result<(Arc<ShapePlan>, Vec<PreprocessedTensor>)> {
        let plan = self.refresh_plan(registry);
        let start = Instant::now();
        let tensors = plan
            .groups
            .iter()
            .enumerate()
            .map(|(group, &(w, h))| self.letterbox(frame, w, h, group))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "🖼️ 预处理 {} 个形状组: {:.2}ms",
            tensors.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok((plan, tensors))
    }

    /// 累计计算的张量个数
    pub fn tensors_computed(&self) -> u64 {
        self.tensors_computed
    }

    /// letterbox → [1, 3, H, W]
    pub fn letterbox(&mut self, frame: &Frame, target_width: u32, target_height: u32, shape_group: usize) -> Result<PreprocessedTensor> {
        let lb = Letterbox::compute(frame.width, frame.height, target_width, target_height);

        let src = fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)?;
        let resized;
        let pixels: &[u8] = if lb.new_width == frame.width && lb.new_height == frame.height {
            &frame.data
        } else {
            let mut dst = fr::images::Image::new(lb.new_width, lb.new_height, fr::PixelType::U8x3);
            self.resizer.resize(
                &src,
                &mut dst,
                &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Box)),
            )?;
            resized = dst;
            resized.buffer()
        };

        let (th, tw) = (target_height as usize, target_width as usize);
        let mut data = vec![0.0f32; 3 * th * tw];
        let plane = th * tw;
        let (xo, yo) = (lb.x_offset as usize, lb.y_offset as usize);
        let nw = lb.new_width as usize;
        for y in 0..lb.new_height as usize {
            for x in 0..nw {
                let src_idx = (y * nw + x) * 3;
                let dst_idx = (y + yo) * tw + (x + xo);
                // BGR → RGB
                data[dst_idx] = pixels[src_idx + 2] as f32 / 255.0;
                data[plane + dst_idx] = pixels[src_idx + 1] as f32 / 255.0;
                data[2 * plane + dst_idx] = pixels[src_idx] as f32 / 255.0;
            }
        }

        self.tensors_computed += 1;
        Ok(PreprocessedTensor {
            tensor: Array::from_shape_vec(IxDyn(&[1, 3, th, tw]), data)?,
            orig_width: frame.width,
            orig_height: frame.height,
            scale: lb.scale,
            x_offset: lb.x_offset,
            y_offset: lb.y_offset,
            shape_group,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::FixedBackend;

    fn solid_frame(width: u32, height: u32, bgr: [u8; 3]) -> Frame {
        let data = bgr.iter().copied().cycle().take((width * height * 3) as usize).collect();
        Frame::new(width, height, data)
    }

    fn session(path: &str, w: u32, h: u32) -> ModelSession {
        ModelSession::new(path, vec!["obj".into()], Box::new(FixedBackend::new(w, h, vec![])))
    }

    #[test]
    fn test_letterbox_params() {
        let lb = Letterbox::compute(1280, 720, 640, 640);
        assert_eq!(lb.scale, 0.5);
        assert_eq!((lb.new_width, lb.new_height), (640, 360));
        assert_eq!((lb.x_offset, lb.y_offset), (0, 140));

        let lb = Letterbox::compute(100, 100, 100, 100);
        assert_eq!(lb.scale, 1.0);
        assert_eq!((lb.x_offset, lb.y_offset), (0, 0));

        let lb = Letterbox::compute(300, 600, 320, 320);
        assert_eq!((lb.new_width, lb.new_height), (160, 320));
        assert_eq!((lb.x_offset, lb.y_offset), (80, 0));
    }

    #[test]
    fn test_assign_shape_groups() {
        let (groups, assignments) = assign_shape_groups(&[(640, 640), (320, 320), (640, 640), (640, 480)]);
        assert_eq!(groups, vec![(640, 640), (320, 320), (640, 480)]);
        assert_eq!(assignments, vec![0, 1, 0, 2]);
    }

    #[test]
    fn test_letterbox_tensor_layout() {
        let mut stage = PreprocessingStage::new();
        // BGR (10, 20, 30) → RGB (30, 20, 10)
        let frame = solid_frame(8, 4, [10, 20, 30]);
        let t = stage.letterbox(&frame, 8, 8, 0).unwrap();
        assert_eq!(t.tensor.shape(), &[1, 3, 8, 8]);
        assert_eq!((t.x_offset, t.y_offset), (0, 2));

        // 填充区为 0
        assert_eq!(t.tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(t.tensor[[0, 2, 7, 7]], 0.0);
        // 图像区
        assert!((t.tensor[[0, 0, 2, 0]] - 30.0 / 255.0).abs() < 1e-6);
        assert!((t.tensor[[0, 1, 3, 4]] - 20.0 / 255.0).abs() < 1e-6);
        assert!((t.tensor[[0, 2, 5, 7]] - 10.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_resize_area_filter_keeps_solid_color() {
        let mut stage = PreprocessingStage::new();
        let frame = solid_frame(64, 32, [0, 128, 255]);
        let t = stage.letterbox(&frame, 16, 16, 0).unwrap();
        assert_eq!(t.scale, 0.25);
        assert_eq!((t.x_offset, t.y_offset), (0, 4));
        let tol = 2.0 / 255.0;
        assert!((t.tensor[[0, 0, 8, 8]] - 1.0).abs() < tol);
        assert!((t.tensor[[0, 1, 8, 8]] - 128.0 / 255.0).abs() < tol);
        assert!(t.tensor[[0, 2, 8, 8]] < tol);
    }

    #[test]
    fn test_shape_dedup_computes_once_per_group() {
        let registry = ModelRegistry::new();
        let a = registry.add(session("a.onnx", 32, 32));
        let b = registry.add(session("b.onnx", 32, 32));
        let c = registry.add(session("c.onnx", 16, 16));

        let mut stage = PreprocessingStage::new();
        let frame = solid_frame(64, 48, [1, 2, 3]);
        let (plan, tensors) = stage.process(&frame, &registry).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(stage.tensors_computed(), 2);
        assert_eq!(plan.assignments, vec![0, 0, 1]);
        assert_eq!(a.shape_group(), Some(0));
        assert_eq!(b.shape_group(), Some(0));
        assert_eq!(c.shape_group(), Some(1));

        // 第二帧沿用分组
        let (plan2, _) = stage.process(&frame, &registry).unwrap();
        assert!(Arc::ptr_eq(&plan, &plan2));
        assert_eq!(stage.tensors_computed(), 4);
    }

    #[test]
    fn test_plan_invalidated_on_model_change() {
        let registry = ModelRegistry::new();
        registry.add(session("a.onnx", 32, 32));
        let b = registry.add(session("b.onnx", 16, 16));

        let mut stage = PreprocessingStage::new();
        let plan = stage.refresh_plan(&registry);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(b.shape_group(), Some(1));

        registry.remove("a.onnx");
        let plan = stage.refresh_plan(&registry);
        assert_eq!(plan.groups, vec![(16, 16)]);
        assert_eq!(b.shape_group(), Some(0));
    }
}
