/// 推理流水线 (Inference Pipeline)
///
/// 双线程架构,通过有界队列通信:
/// - FrameProducer:     读帧 + 预处理 (独立线程)
/// - InferenceConsumer: 推理 + NMS + 跟踪 + 绘制 (独立线程)
/// - TransportController: 播放状态机, 独占输入源锁
pub mod consumer;
pub mod producer;
pub mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use image::RgbImage;

use crate::detection::DetectionBox;
use crate::input::{CaptureSource, Frame};
use crate::preprocess::{PreprocessedTensor, ShapePlan};

pub use consumer::{FrameProcessor, InferenceConsumer};
pub use producer::FrameProducer;
pub use transport::{PlaybackState, TransportController};

/// 输入源共享句柄 (所有访问都在这把锁内串行)
pub type SharedCapture = Arc<Mutex<Option<CaptureSource>>>;

/// 渲染回调共享句柄
pub type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

// ========== 队列消息类型定义 ==========

/// 队列元素 (生产者 → 消费者)
///
/// `tensors[g]` 是形状组 g 的预处理结果, 组号由 `plan` 给出.
pub struct FrameData {
    pub frame: Frame,
    pub plan: Arc<ShapePlan>,
    pub tensors: Vec<PreprocessedTensor>,
}

/// 标注帧 (消费者 → 渲染回调)
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub detections: Vec<DetectionBox>,
    pub index: u64,
    pub timestamp_ms: u64,
    /// 经过推理 (加载/定位时的预览帧为 false)
    pub inferred: bool,
    pub inference_ms: f64,
}

impl AnnotatedFrame {
    /// 未经推理的预览帧
    pub fn preview(frame: &Frame) -> Self {
        Self {
            image: frame.to_rgb_image(),
            detections: Vec::new(),
            index: frame.index,
            timestamp_ms: frame.timestamp_ms,
            inferred: false,
            inference_ms: 0.0,
        }
    }
}

/// 渲染回调
///
/// 只在消费者线程(或控制线程的同步调用)中被调用, 不会并发调用自身.
pub trait FrameSink: Send {
    fn on_frame_ready(&mut self, frame: AnnotatedFrame);
}

impl<F> FrameSink for F
where
    F: FnMut(AnnotatedFrame) + Send,
{
    fn on_frame_ready(&mut self, frame: AnnotatedFrame) {
        self(frame)
    }
}

pub fn shared_sink(sink: impl FrameSink + 'static) -> SharedSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

pub(crate) fn emit(sink: &SharedSink, frame: AnnotatedFrame) {
    let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
    sink.on_frame_ready(frame);
}

// ========== 播放控制标志 ==========

/// 控制线程与工作线程共享的标志
#[derive(Debug, Default)]
pub struct PlaybackFlags {
    cancelled: AtomicBool,
    paused: AtomicBool,
    tracking: AtomicBool,
    /// 工作线程仍在运行
    active: AtomicBool,
    position_ms: AtomicU64,
}

impl PlaybackFlags {
    pub fn new(tracking: bool) -> Self {
        let flags = Self::default();
        flags.tracking.store(tracking, Ordering::Relaxed);
        flags
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    pub fn set_tracking(&self, enabled: bool) {
        self.tracking.store(enabled, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn position_ms(&self) -> u64 {
        self.position_ms.load(Ordering::Acquire)
    }

    pub fn set_position_ms(&self, position: u64) {
        self.position_ms.store(position, Ordering::Release);
    }
}
