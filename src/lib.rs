// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 流水线配置参数
pub mod detection; // 检测结果、NMS 与目标跟踪
pub mod error; // 错误类型
pub mod input; // 视频输入系统
pub mod models; // 模型会话与注册表
pub mod pipeline; // 生产者/消费者流水线与播放控制
pub mod preprocess; // Letterbox 预处理
pub mod renderer; // 检测结果绘制

pub use crate::config::{Args, PipelineConfig};
pub use crate::detection::{non_max_suppression, CentroidTracker, DetectionBox, InferenceResult, Tracker};
pub use crate::error::{PipelineError, Result};
pub use crate::input::{CaptureBackend, CaptureSource, Frame, SourceDescriptor};
pub use crate::models::{InferenceBackend, InputShape, ModelRegistry, ModelSession};
pub use crate::pipeline::{shared_sink, AnnotatedFrame, FrameSink, PlaybackState, TransportController};
pub use crate::renderer::Renderer;

/// 本地时间字符串, 用于输出文件命名
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%3f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    chrono::Local::now().format(&fmt).to_string()
}
