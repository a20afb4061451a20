//! 推理消费者 (InferenceConsumer)
//! 职责: 从队列取帧 → 推理 → NMS → 跟踪 → 绘制 → 渲染回调

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use super::{emit, AnnotatedFrame, FrameData, PlaybackFlags, SharedSink};
use crate::detection::{CentroidTracker, InferenceDispatcher, Tracker};
use crate::renderer::Renderer;

/// 单帧处理: 推理 + 融合 + 跟踪 + 绘制
///
/// 消费者线程与单张图片处理共用.
#[derive(Clone)]
pub struct FrameProcessor {
    pub dispatcher: InferenceDispatcher,
    pub tracker: Arc<Mutex<CentroidTracker>>,
    pub renderer: Arc<Renderer>,
}

impl FrameProcessor {
    pub fn new(dispatcher: InferenceDispatcher, tracker: CentroidTracker, renderer: Renderer) -> Self {
        Self {
            dispatcher,
            tracker: Arc::new(Mutex::new(tracker)),
            renderer: Arc::new(renderer),
        }
    }

    pub fn process(&self, data: FrameData, tracking: bool) -> AnnotatedFrame {
        let start = Instant::now();
        let results = self.dispatcher.infer(&data.plan, &data.tensors);
        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;

        // 合并所有模型的结果
        let mut detections: Vec<_> = results.into_iter().flat_map(|r| r.boxes).collect();

        if tracking {
            let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            tracker.update(&mut detections);
        }

        let mut image = data.frame.to_rgb_image();
        self.renderer.annotate(&mut image, &detections);

        AnnotatedFrame {
            image,
            detections,
            index: data.frame.index,
            timestamp_ms: data.frame.timestamp_ms,
            inferred: true,
            inference_ms,
        }
    }

    pub fn reset_tracker(&self) {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner).reset();
    }
}

pub struct InferenceConsumer {
    receiver: Receiver<FrameData>,
    flags: Arc<PlaybackFlags>,
    processor: FrameProcessor,
    sink: SharedSink,
    pause_poll: Duration,
    poll_timeout: Duration,

    // 统计
    count: u64,
    last: Instant,
    total_ms: f64,
}

impl InferenceConsumer {
    pub fn new(
        receiver: Receiver<FrameData>,
        flags: Arc<PlaybackFlags>,
        processor: FrameProcessor,
        sink: SharedSink,
        pause_poll: Duration,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            receiver,
            flags,
            processor,
            sink,
            pause_poll,
            poll_timeout,
            count: 0,
            last: Instant::now(),
            total_ms: 0.0,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("inference-consumer".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        info!("✅ 推理线程启动");
        let _active = ActiveGuard(Arc::clone(&self.flags));

        loop {
            if self.flags.is_cancelled() {
                break;
            }
            if self.flags.is_paused() {
                thread::sleep(self.pause_poll);
                continue;
            }

            let data = match self.receiver.recv_timeout(self.poll_timeout) {
                Ok(data) => data,
                Err(RecvTimeoutError::Timeout) => continue,
                // 生产者已退出且队列已取空
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let annotated = self.processor.process(data, self.flags.tracking_enabled());
            debug!(
                "🎯 第 {} 帧: {} 个目标 | {:.1}ms",
                annotated.index,
                annotated.detections.len(),
                annotated.inference_ms
            );
            self.count += 1;
            self.total_ms += annotated.inference_ms;
            emit(&self.sink, annotated);

            if self.last.elapsed().as_secs_f64() >= 1.0 {
                let elapsed = self.last.elapsed().as_secs_f64();
                info!(
                    "📊 推理统计: {:.1}fps | 平均 {:.1}ms",
                    self.count as f64 / elapsed,
                    self.total_ms / self.count as f64
                );
                self.count = 0;
                self.total_ms = 0.0;
                self.last = Instant::now();
            }
        }

        info!("❌ 推理线程退出");
    }
}

/// 线程退出时清除运行标志, 控制器据此判断播放已结束 (含 panic 退出)
struct ActiveGuard(Arc<PlaybackFlags>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.set_active(false);
    }
}
