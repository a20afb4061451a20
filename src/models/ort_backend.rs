// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::debug;

use super::{InferenceBackend, InputShape};

/// 动态维度 (-1) 时使用的默认输入尺寸
const DEFAULT_INPUT_SIZE: u32 = 640;

/// ONNX Runtime 推理后端
pub struct OrtBackend {
    session: Session,
    input: InputShape,
}

impl OrtBackend {
    pub fn new(model_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = Session::builder()
            .context("创建ORT会话构建器失败")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("设置图优化级别失败")?
            .commit_from_file(model_path)
            .with_context(|| format!("加载ONNX模型失败: {}", model_path.display()))?;

        let input = Self::read_input_shape(&session)?;
        debug!(
            "📐 模型输入 NCHW: [1, {}, {}, {}]",
            input.channels, input.height, input.width
        );
        Ok(Self { session, input })
    }

    /// 输入按 NCHW 解析: 高 = dim 2, 宽 = dim 3
    fn read_input_shape(session: &Session) -> Result<InputShape> {
        let input = session
            .inputs
            .first()
            .ok_or_else(|| anyhow!("模型没有输入"))?;
        let dims: Vec<i64> = input
            .input_type
            .tensor_shape()
            .ok_or_else(|| anyhow!("模型输入不是张量"))?
            .to_vec();
        anyhow::ensure!(dims.len() == 4, "期望4维输入, 实际 {}维: {:?}", dims.len(), dims);

        let dim = |d: i64, default: u32| if d > 0 { d as u32 } else { default };
        Ok(InputShape::new(
            dim(dims[1], 3) as usize,
            dim(dims[2], DEFAULT_INPUT_SIZE),
            dim(dims[3], DEFAULT_INPUT_SIZE),
        ))
    }
}

impl InferenceBackend for OrtBackend {
    fn input_shape(&self) -> InputShape {
        self.input
    }

    fn run(&mut self, input: &Array<f32, IxDyn>) -> Result<Array<f32, IxDyn>> {
        let shape: Vec<usize> = input.shape().to_vec();
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_array((shape, data.into_boxed_slice())).context("创建输入张量失败")?;

        let outputs = self.session.run(ort::inputs![tensor]).context("推理失败")?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("提取输出张量失败")?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        Array::from_shape_vec(IxDyn(&dims), data.to_vec()).context("输出张量形状无效")
    }
}
