//! 播放控制 (TransportController)
//!
//! 状态机 Stopped / Playing / Paused. 输入源的读帧、定位与属性查询
//! 都在同一把锁内进行; stop/seek 先停止并等待工作线程退出, 再操作输入源.

use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use tracing::{info, warn};

use super::{
    emit, AnnotatedFrame, FrameData, FrameProcessor, FrameProducer, InferenceConsumer, PlaybackFlags, SharedCapture,
    SharedSink,
};
use crate::config::PipelineConfig;
use crate::detection::{CentroidTracker, DetectionBox, InferenceDispatcher};
use crate::error::{PipelineError, Result};
use crate::input::image_sequence::read_image_frame;
use crate::input::{CaptureBackend, CaptureSource};
use crate::models::{ModelRegistry, ModelSession};
use crate::preprocess::PreprocessingStage;
use crate::renderer::Renderer;

/// 播放状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

struct Workers {
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

pub struct TransportController {
    config: PipelineConfig,
    capture: SharedCapture,
    registry: Arc<ModelRegistry>,
    sink: SharedSink,
    flags: Arc<PlaybackFlags>,
    processor: FrameProcessor,
    workers: Option<Workers>,
    state: PlaybackState,
}

impl TransportController {
    pub fn new(config: PipelineConfig, registry: Arc<ModelRegistry>, sink: SharedSink) -> Self {
        Self::with_renderer(config, registry, sink, Renderer::new())
    }

    pub fn with_renderer(config: PipelineConfig, registry: Arc<ModelRegistry>, sink: SharedSink, renderer: Renderer) -> Self {
        let processor = FrameProcessor::new(
            InferenceDispatcher::new(config.conf_threshold, config.iou_threshold),
            CentroidTracker::new(config.track_distance_threshold, config.track_max_missed),
            renderer,
        );
        Self {
            flags: Arc::new(PlaybackFlags::new(config.tracking_enabled)),
            config,
            capture: Arc::default(),
            registry,
            sink,
            processor,
            workers: None,
            state: PlaybackState::Stopped,
        }
    }

    /// 当前状态; 播放到流结束后自动变为 Stopped
    pub fn state(&self) -> PlaybackState {
        if self.state != PlaybackState::Stopped && !self.flags.is_active() {
            PlaybackState::Stopped
        } else {
            self.state
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn add_model(&self, session: ModelSession) -> Arc<ModelSession> {
        self.registry.add(session)
    }

    pub fn remove_model(&self, path: impl AsRef<Path>) -> bool {
        self.registry.remove(path)
    }

    pub fn set_tracking_enabled(&self, enabled: bool) {
        self.flags.set_tracking(enabled);
        info!("🎯 目标跟踪: {}", if enabled { "启用" } else { "禁用" });
    }

    pub fn tracking_enabled(&self) -> bool {
        self.flags.tracking_enabled()
    }

    /// 加载视频文件、摄像头或网络流
    pub fn load(&mut self, descriptor: &str) -> Result<()> {
        self.stop();
        let source = CaptureSource::open(descriptor, self.config.default_fps)?;
        self.install(source)
    }

    /// 使用自定义输入后端加载
    pub fn load_backend(&mut self, descriptor: &str, backend: Box<dyn CaptureBackend>) -> Result<()> {
        self.stop();
        let source = CaptureSource::from_backend(descriptor, backend, self.config.default_fps);
        self.install(source)
    }

    /// 显示第一帧并把读取位置重置到开头
    fn install(&mut self, mut source: CaptureSource) -> Result<()> {
        let Some(first) = source.read_next() else {
            return Err(PipelineError::Open {
                descriptor: source.descriptor().to_string(),
                source: anyhow::anyhow!("无法读取第一帧"),
            });
        };
        if !source.capabilities().live {
            source.seek_to_frame(0)?;
        }

        self.processor.reset_tracker();
        self.flags.set_position_ms(0);
        *self.capture.lock().unwrap_or_else(PoisonError::into_inner) = Some(source);
        emit(&self.sink, AnnotatedFrame::preview(&first));
        self.state = PlaybackState::Stopped;
        Ok(())
    }

    pub fn play(&mut self) -> Result<()> {
        match self.state() {
            PlaybackState::Playing => Ok(()),
            PlaybackState::Paused => {
                self.flags.set_paused(false);
                self.state = PlaybackState::Playing;
                info!("▶️ 继续播放");
                Ok(())
            }
            PlaybackState::Stopped => {
                self.halt_workers();
                if self.capture.lock().unwrap_or_else(PoisonError::into_inner).is_none() {
                    return Err(PipelineError::NotLoaded);
                }
                self.spawn_workers(false)?;
                self.state = PlaybackState::Playing;
                info!("▶️ 开始播放");
                Ok(())
            }
        }
    }

    pub fn pause(&mut self) {
        if self.state() == PlaybackState::Playing {
            self.flags.set_paused(true);
            self.state = PlaybackState::Paused;
            info!("⏸️ 暂停");
        }
    }

    /// 停止播放并释放输入源
    pub fn stop(&mut self) {
        self.halt_workers();
        if let Some(mut source) = self.capture.lock().unwrap_or_else(PoisonError::into_inner).take() {
            source.release();
        }
        self.state = PlaybackState::Stopped;
    }

    /// 定位到指定毫秒, 越界时裁剪到 [0, 时长], 完成后继续播放
    pub fn seek(&mut self, target_ms: i64) -> Result<()> {
        let (duration, live, descriptor) = {
            let capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
            let source = capture.as_ref().ok_or(PipelineError::NotLoaded)?;
            let caps = source.capabilities();
            (caps.duration_ms, caps.live, source.descriptor().to_string())
        };
        if live {
            return Err(PipelineError::SeekUnsupported(descriptor));
        }

        let target = target_ms.clamp(0, duration as i64) as u64;
        let previous = self.state();
        self.halt_workers();

        let preview = {
            let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
            let source = capture.as_mut().ok_or(PipelineError::NotLoaded)?;
            let repositioned = source.seek_to_millis(target).and_then(|_| {
                let frame = source.read_next();
                source.seek_to_millis(target)?;
                Ok(frame)
            });
            match repositioned {
                Ok(frame) => frame,
                Err(e) => {
                    drop(capture);
                    self.restore(previous);
                    return Err(e);
                }
            }
        };

        self.flags.set_position_ms(target);
        if let Some(frame) = preview {
            emit(&self.sink, AnnotatedFrame::preview(&frame));
        }
        info!("⏩ 定位到 {} ms", target);

        self.state = PlaybackState::Stopped;
        self.play()
    }

    /// 定位失败后恢复原来的播放状态
    fn restore(&mut self, previous: PlaybackState) {
        let resumed = match previous {
            PlaybackState::Stopped => Ok(()),
            PlaybackState::Playing => self.spawn_workers(false),
            PlaybackState::Paused => self.spawn_workers(true),
        };
        match resumed {
            Ok(()) => self.state = previous,
            Err(e) => {
                warn!("❌ 恢复播放失败: {}", e);
                self.state = PlaybackState::Stopped;
            }
        }
    }

    pub fn fast_forward(&mut self, millis: u64) -> Result<()> {
        self.seek(self.position_millis() as i64 + millis as i64)
    }

    pub fn rewind(&mut self, millis: u64) -> Result<()> {
        self.seek(self.position_millis() as i64 - millis as i64)
    }

    /// 从头重播
    pub fn replay(&mut self) -> Result<()> {
        self.seek(0)
    }

    pub fn position_millis(&self) -> u64 {
        self.flags.position_ms()
    }

    pub fn duration_millis(&self) -> u64 {
        self.capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|source| source.capabilities().duration_ms)
            .unwrap_or(0)
    }

    /// 单张图片推理: 停止播放, 同步执行完整流程并输出一帧
    pub fn process_still(&mut self, path: impl AsRef<Path>) -> Result<Vec<DetectionBox>> {
        self.stop();
        let path = path.as_ref();
        let frame = read_image_frame(path).map_err(|source| PipelineError::Open {
            descriptor: path.display().to_string(),
            source,
        })?;

        let (plan, tensors) = PreprocessingStage::new()
            .process(&frame, &self.registry)
            .map_err(|source| PipelineError::Open {
                descriptor: path.display().to_string(),
                source,
            })?;
        let annotated = self
            .processor
            .process(FrameData { frame, plan, tensors }, self.flags.tracking_enabled());
        let detections = annotated.detections.clone();
        info!("🖼️ 图片推理完成: {} 个目标", detections.len());
        emit(&self.sink, annotated);
        Ok(detections)
    }

    fn spawn_workers(&mut self, paused: bool) -> Result<()> {
        let (sender, receiver) = bounded(self.config.queue_capacity);
        self.flags.set_cancelled(false);
        self.flags.set_paused(paused);
        self.flags.set_active(true);

        let producer = FrameProducer::new(
            Arc::clone(&self.capture),
            Arc::clone(&self.registry),
            Arc::clone(&self.flags),
            sender,
            Duration::from_millis(self.config.producer_pause_poll_ms),
        );
        let consumer = InferenceConsumer::new(
            receiver,
            Arc::clone(&self.flags),
            self.processor.clone(),
            Arc::clone(&self.sink),
            Duration::from_millis(self.config.consumer_pause_poll_ms),
            Duration::from_millis(self.config.consumer_poll_timeout_ms),
        );

        let consumer = match consumer.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.flags.set_active(false);
                return Err(e.into());
            }
        };
        let producer = match producer.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.flags.set_cancelled(true);
                let _ = consumer.join();
                return Err(e.into());
            }
        };

        self.workers = Some(Workers { producer, consumer });
        Ok(())
    }

    /// 通知工作线程退出并等待; 队列随线程一起释放
    fn halt_workers(&mut self) {
        let Some(workers) = self.workers.take() else {
            return;
        };
        self.flags.set_cancelled(true);
        self.flags.set_paused(false);
        if workers.producer.join().is_err() {
            warn!("❌ 生产者线程异常退出");
        }
        if workers.consumer.join().is_err() {
            warn!("❌ 推理线程异常退出");
        }
        self.flags.set_active(false);
    }
}

impl Drop for TransportController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::SyntheticCapture;
    use crate::pipeline::shared_sink;
    use std::sync::Mutex;
    use std::time::Instant;

    fn controller() -> (TransportController, Arc<Mutex<Vec<AnnotatedFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let collected = Arc::clone(&frames);
        let sink = shared_sink(move |frame: AnnotatedFrame| collected.lock().unwrap().push(frame));
        let controller = TransportController::new(PipelineConfig::default(), Arc::new(ModelRegistry::new()), sink);
        (controller, frames)
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_play_requires_load() {
        let (mut controller, _) = controller();
        assert!(matches!(controller.play(), Err(PipelineError::NotLoaded)));
        assert!(matches!(controller.seek(0), Err(PipelineError::NotLoaded)));
        assert_eq!(controller.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_load_primes_first_frame() {
        let (mut controller, frames) = controller();
        controller
            .load_backend("synthetic", Box::new(SyntheticCapture::new(8, 8, 5, 100.0)))
            .unwrap();
        assert_eq!(controller.state(), PlaybackState::Stopped);
        assert_eq!(controller.duration_millis(), 50);
        assert_eq!(controller.position_millis(), 0);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].inferred);
        assert_eq!(frames[0].index, 0);
    }

    #[test]
    fn test_empty_source_fails_to_load() {
        let (mut controller, _) = controller();
        let err = controller
            .load_backend("empty", Box::new(SyntheticCapture::new(8, 8, 0, 25.0)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Open { .. }));
        assert!(matches!(controller.play(), Err(PipelineError::NotLoaded)));
    }

    #[test]
    fn test_play_pause_and_end_of_stream() {
        let (mut controller, frames) = controller();
        controller
            .load_backend("synthetic", Box::new(SyntheticCapture::new(8, 8, 20, 200.0)))
            .unwrap();

        controller.play().unwrap();
        assert_eq!(controller.state(), PlaybackState::Playing);
        controller.pause();
        assert_eq!(controller.state(), PlaybackState::Paused);
        controller.play().unwrap();

        wait_until(|| controller.state() == PlaybackState::Stopped);
        let inferred: Vec<u64> = frames.lock().unwrap().iter().filter(|f| f.inferred).map(|f| f.index).collect();
        assert_eq!(inferred, (0..20).collect::<Vec<_>>());
        assert_eq!(controller.position_millis(), 100);

        // 流结束后输入源保留, 可以重播
        controller.replay().unwrap();
        wait_until(|| controller.state() == PlaybackState::Stopped);
        let inferred = frames.lock().unwrap().iter().filter(|f| f.inferred).count();
        assert_eq!(inferred, 40);
    }

    #[test]
    fn test_seek_clamps_to_duration() {
        let (mut controller, frames) = controller();
        controller
            .load_backend("synthetic", Box::new(SyntheticCapture::new(8, 8, 100, 10.0)))
            .unwrap();
        assert_eq!(controller.duration_millis(), 10_000);

        controller.seek(-100).unwrap();
        assert_eq!(controller.state(), PlaybackState::Playing);
        controller.pause();
        {
            let frames = frames.lock().unwrap();
            let preview = frames.iter().filter(|f| !f.inferred).last().unwrap();
            assert_eq!(preview.index, 0);
        }

        controller.seek(10_000 + 5000).unwrap();
        assert_eq!(controller.position_millis(), 10_000);
        wait_until(|| controller.state() == PlaybackState::Stopped);

        controller.seek(4_000).unwrap();
        controller.pause();
        let frames = frames.lock().unwrap();
        let preview = frames.iter().filter(|f| !f.inferred).last().unwrap();
        assert_eq!(preview.index, 40);
        assert_eq!(preview.timestamp_ms, 4_000);
    }

    #[test]
    fn test_fast_forward_and_rewind() {
        let (mut controller, _) = controller();
        controller
            .load_backend("synthetic", Box::new(SyntheticCapture::new(8, 8, 100, 10.0)))
            .unwrap();
        controller.fast_forward(3_000).unwrap();
        controller.pause();
        let pos = controller.position_millis();
        assert!(pos >= 3_000);

        controller.rewind(60_000).unwrap();
        controller.pause();
        assert!(controller.position_millis() < pos);
        controller.stop();
        assert_eq!(controller.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_live_source_seek_unsupported() {
        let (mut controller, _) = controller();
        controller
            .load_backend("camera", Box::new(SyntheticCapture::new(8, 8, u64::MAX, 30.0).live()))
            .unwrap();
        controller.play().unwrap();
        assert!(matches!(controller.seek(1000), Err(PipelineError::SeekUnsupported(_))));
        assert_eq!(controller.state(), PlaybackState::Playing);
        controller.stop();
        assert_eq!(controller.state(), PlaybackState::Stopped);
        assert_eq!(controller.duration_millis(), 0);
    }

    #[test]
    fn test_stop_releases_capture() {
        let (mut controller, _) = controller();
        controller
            .load_backend("synthetic", Box::new(SyntheticCapture::new(8, 8, 1000, 25.0)))
            .unwrap();
        controller.play().unwrap();
        controller.stop();
        assert_eq!(controller.state(), PlaybackState::Stopped);
        assert!(matches!(controller.play(), Err(PipelineError::NotLoaded)));
    }

    /// 定位可在运行中被设为失败的输入源
    struct FlakySeek {
        inner: SyntheticCapture,
        fail: Arc<std::sync::atomic::AtomicBool>,
    }

    impl CaptureBackend for FlakySeek {
        fn fps(&self) -> f64 {
            self.inner.fps()
        }

        fn frame_count(&self) -> Option<u64> {
            self.inner.frame_count()
        }

        fn read(&mut self) -> anyhow::Result<Option<crate::input::Frame>> {
            self.inner.read()
        }

        fn seek_to_frame(&mut self, index: u64) -> anyhow::Result<()> {
            anyhow::ensure!(!self.fail.load(std::sync::atomic::Ordering::SeqCst), "seek rejected");
            self.inner.seek_to_frame(index)
        }

        fn position(&self) -> u64 {
            self.inner.position()
        }
    }

    #[test]
    fn test_failed_seek_keeps_state() {
        let (mut controller, frames) = controller();
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let backend = FlakySeek {
            inner: SyntheticCapture::new(8, 8, 1000, 100.0),
            fail: Arc::clone(&fail),
        };
        controller.load_backend("flaky", Box::new(backend)).unwrap();
        controller.play().unwrap();
        fail.store(true, std::sync::atomic::Ordering::SeqCst);

        let err = controller.seek(5_000).unwrap_err();
        assert!(matches!(err, PipelineError::Seek(_)));
        assert_eq!(controller.state(), PlaybackState::Playing);

        // 播放继续
        let inferred = || frames.lock().unwrap().iter().filter(|f| f.inferred).count();
        let before = inferred();
        wait_until(|| inferred() > before + 3);
        assert!(controller.position_millis() < 5_000);

        controller.pause();
        assert!(matches!(controller.seek(2_000), Err(PipelineError::Seek(_))));
        assert_eq!(controller.state(), PlaybackState::Paused);
        controller.play().unwrap();
        assert_eq!(controller.state(), PlaybackState::Playing);
        controller.stop();
    }

    #[test]
    fn test_consumer_panic_ends_playback() {
        let sink = shared_sink(|frame: AnnotatedFrame| {
            if frame.inferred {
                panic!("sink failure");
            }
        });
        let mut controller = TransportController::new(PipelineConfig::default(), Arc::new(ModelRegistry::new()), sink);
        controller
            .load_backend("synthetic", Box::new(SyntheticCapture::new(8, 8, 1000, 100.0)))
            .unwrap();
        controller.play().unwrap();
        wait_until(|| controller.state() == PlaybackState::Stopped);
        controller.stop();
    }

    #[test]
    fn test_tracking_toggle() {
        let (controller, _) = controller();
        assert!(!controller.tracking_enabled());
        controller.set_tracking_enabled(true);
        assert!(controller.tracking_enabled());
    }
}
