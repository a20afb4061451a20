//! 推理调度 - 对每个模型取其形状组的张量推理, 解码输出并做NMS

use std::time::Instant;

use anyhow::{anyhow, Result};
use ndarray::{Array, Axis, IxDyn};
use tracing::{debug, warn};

use super::nms::non_max_suppression;
use super::types::{DetectionBox, InferenceResult};
use crate::preprocess::{PreprocessedTensor, ShapePlan};

/// 推理调度器
#[derive(Clone, Debug)]
pub struct InferenceDispatcher {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for InferenceDispatcher {
    fn default() -> Self {
        Self::new(0.25, 0.5)
    }
}

impl InferenceDispatcher {
    pub fn new(conf_threshold: f32, iou_threshold: f32) -> Self {
        Self {
            conf_threshold,
            iou_threshold,
        }
    }

    /// 对所有在役模型推理
    ///
    /// 单个模型推理失败只丢弃该模型本帧的结果, 其他模型照常进行.
    pub fn infer(&self, plan: &ShapePlan, tensors: &[PreprocessedTensor]) -> Vec<InferenceResult> {
        let mut results = Vec::with_capacity(plan.models.len());

        for (model, &group) in plan.models.iter().zip(&plan.assignments) {
            if model.is_retired() {
                continue;
            }
            let Some(pre) = tensors.get(group) else {
                warn!("⚠️ 模型 {} 缺少形状组 {} 的张量, 跳过", model.path().display(), group);
                continue;
            };

            let start = Instant::now();
            let output = match model.run(&pre.tensor) {
                Ok(output) => output,
                Err(e) => {
                    warn!("❌ {:#}", e);
                    continue;
                }
            };

            let mut boxes = match decode_output(&output, pre, model.labels(), self.conf_threshold) {
                Ok(boxes) => boxes,
                Err(e) => {
                    warn!("❌ 模型 {} 输出解码失败: {:#}", model.path().display(), e);
                    continue;
                }
            };
            let candidates = boxes.len();
            non_max_suppression(&mut boxes, self.iou_threshold);
            let inference_ms = start.elapsed().as_secs_f64() * 1000.0;

            debug!(
                "🔍 {} | 候选 {} → NMS后 {} | {:.1}ms",
                model.path().display(),
                candidates,
                boxes.len(),
                inference_ms
            );

            results.push(InferenceResult {
                model_path: model.path().to_path_buf(),
                boxes,
                inference_ms,
            });
        }

        results
    }
}

/// 解码 `[1, N, C]` 或 `[N, C]` 输出, 每行 `cx, cy, w, h, conf[, class]`
///
/// 坐标减去letterbox偏移、除以缩放比例并裁剪到原图, 宽或高不为正的框丢弃.
pub fn decode_output(
    output: &Array<f32, IxDyn>,
    pre: &PreprocessedTensor,
    labels: &[String],
    conf_threshold: f32,
) -> Result<Vec<DetectionBox>> {
    let rows = match output.ndim() {
        2 => output.view(),
        3 if output.shape()[0] == 1 => output.index_axis(Axis(0), 0),
        _ => return Err(anyhow!("不支持的输出形状: {:?}", output.shape())),
    };
    let cols = rows.shape()[1];
    if cols < 5 {
        return Err(anyhow!("输出每行至少需要5列, 实际 {}", cols));
    }

    let multi_class = labels.len() > 1 && cols > 5;
    let (ow, oh) = (pre.orig_width as f32, pre.orig_height as f32);
    let (xo, yo) = (pre.x_offset as f32, pre.y_offset as f32);
    let mut boxes = Vec::new();

    for row in rows.axis_iter(Axis(0)) {
        let confidence = row[4];
        if confidence.is_nan() || confidence < conf_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let x1 = ((cx - w / 2.0 - xo) / pre.scale).clamp(0.0, ow);
        let y1 = ((cy - h / 2.0 - yo) / pre.scale).clamp(0.0, oh);
        let x2 = ((cx + w / 2.0 - xo) / pre.scale).clamp(0.0, ow);
        let y2 = ((cy + h / 2.0 - yo) / pre.scale).clamp(0.0, oh);
        let (width, height) = (x2 - x1, y2 - y1);
        if width.is_nan() || height.is_nan() || width <= 0.0 || height <= 0.0 {
            continue;
        }

        let label = if multi_class {
            let class_id = row[5].max(0.0) as usize;
            labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| class_id.to_string())
        } else {
            labels.first().cloned().unwrap_or_else(|| "object".to_string())
        };

        boxes.push(DetectionBox::new(x1, y1, width, height, label, confidence));
    }

    Ok(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::FixedBackend;
    use crate::models::{ModelRegistry, ModelSession};
    use crate::preprocess::PreprocessingStage;
    use crate::input::Frame;

    fn pre(orig_w: u32, orig_h: u32, scale: f32, xo: u32, yo: u32) -> PreprocessedTensor {
        PreprocessedTensor {
            tensor: Array::zeros(IxDyn(&[1, 3, 1, 1])),
            orig_width: orig_w,
            orig_height: orig_h,
            scale,
            x_offset: xo,
            y_offset: yo,
            shape_group: 0,
        }
    }

    fn output(rows: &[&[f32]]) -> Array<f32, IxDyn> {
        let cols = rows[0].len();
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Array::from_shape_vec(IxDyn(&[1, rows.len(), cols]), flat).unwrap()
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_decode_unletterbox() {
        // 1280x720 → 640x640: scale 0.5, y偏移 140
        let out = output(&[&[320.0, 320.0, 100.0, 50.0, 0.9]]);
        let boxes = decode_output(&out, &pre(1280, 720, 0.5, 0, 140), &labels(&["person"]), 0.25).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert_eq!((b.x, b.y, b.width, b.height), (540.0, 310.0, 200.0, 100.0));
        assert_eq!(b.label, "person");
        assert_eq!(b.track_id, 0);
    }

    #[test]
    fn test_decode_threshold_clamp_and_discard() {
        let out = output(&[
            &[50.0, 50.0, 10.0, 10.0, 0.1],   // 低置信度
            &[5.0, 5.0, 20.0, 20.0, 0.5],     // 左上越界, 裁剪
            &[50.0, 200.0, 10.0, 10.0, 0.9],  // 完全落在填充区
            &[50.0, 50.0, 0.0, 10.0, 0.9],    // 宽为 0
        ]);
        let boxes = decode_output(&out, &pre(100, 100, 1.0, 0, 0), &labels(&["a"]), 0.25).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!((boxes[0].x, boxes[0].y, boxes[0].width, boxes[0].height), (0.0, 0.0, 15.0, 15.0));
    }

    #[test]
    fn test_decode_drops_nan_rows() {
        let out = output(&[
            &[50.0, 50.0, 10.0, 10.0, f32::NAN],
            &[f32::NAN, 50.0, 10.0, 10.0, 0.9],
            &[20.0, 20.0, 10.0, 10.0, 0.8],
        ]);
        let boxes = decode_output(&out, &pre(100, 100, 1.0, 0, 0), &labels(&["a"]), 0.25).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].confidence, 0.8);
    }

    #[test]
    fn test_decode_multi_class_labels() {
        let out = output(&[&[50.0, 50.0, 10.0, 10.0, 0.9, 1.0], &[20.0, 20.0, 10.0, 10.0, 0.8, 7.0]]);
        let boxes = decode_output(&out, &pre(100, 100, 1.0, 0, 0), &labels(&["cat", "dog"]), 0.25).unwrap();
        assert_eq!(boxes[0].label, "dog");
        assert_eq!(boxes[1].label, "7");

        // 单标签时忽略类别列
        let boxes = decode_output(&out, &pre(100, 100, 1.0, 0, 0), &labels(&["cat"]), 0.25).unwrap();
        assert!(boxes.iter().all(|b| b.label == "cat"));
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let out = Array::zeros(IxDyn(&[1, 4, 4]));
        assert!(decode_output(&out, &pre(10, 10, 1.0, 0, 0), &[], 0.25).is_err());
        let out = Array::zeros(IxDyn(&[2, 3, 6]));
        assert!(decode_output(&out, &pre(10, 10, 1.0, 0, 0), &[], 0.25).is_err());
    }

    #[test]
    fn test_dispatch_skips_failed_and_retired_models() {
        struct Broken;
        impl crate::models::InferenceBackend for Broken {
            fn input_shape(&self) -> crate::models::InputShape {
                crate::models::InputShape::new(3, 64, 64)
            }
            fn run(&mut self, _input: &Array<f32, IxDyn>) -> anyhow::Result<Array<f32, IxDyn>> {
                anyhow::bail!("malformed tensor")
            }
        }

        let registry = ModelRegistry::new();
        registry.add(ModelSession::new(
            "good.onnx",
            labels(&["person"]),
            Box::new(FixedBackend::new(64, 64, vec![[32.0, 32.0, 10.0, 10.0, 0.9], [33.0, 32.0, 10.0, 10.0, 0.8]])),
        ));
        registry.add(ModelSession::new("broken.onnx", labels(&["x"]), Box::new(Broken)));
        let retired = registry.add(ModelSession::new(
            "retired.onnx",
            labels(&["y"]),
            Box::new(FixedBackend::new(64, 64, vec![[10.0, 10.0, 5.0, 5.0, 0.9]])),
        ));

        let mut stage = PreprocessingStage::new();
        let frame = Frame::new(64, 64, vec![0; 64 * 64 * 3]);
        let (plan, tensors) = stage.process(&frame, &registry).unwrap();
        assert_eq!(tensors.len(), 1);

        // 本帧计划生成后被移除
        registry.remove(retired.path());

        let results = InferenceDispatcher::default().infer(&plan, &tensors);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].model_path, std::path::PathBuf::from("good.onnx"));
        // 两个重叠框经NMS只剩一个
        assert_eq!(results[0].boxes.len(), 1);
        assert_eq!(results[0].boxes[0].confidence, 0.9);
    }
}
