/// 检测系统 (Detection System)
///
/// 消费者线程内按顺序执行
/// - Dispatcher: 逐模型推理与输出解码
/// - NMS:        非极大值抑制
/// - Tracker:    中心点跟踪
pub mod dispatcher;
pub mod nms;
pub mod tracker;
pub mod types;

pub use dispatcher::{decode_output, InferenceDispatcher};
pub use nms::non_max_suppression;
pub use tracker::{CentroidTracker, TrackedEntity, Tracker};
pub use types::{DetectionBox, InferenceResult};
