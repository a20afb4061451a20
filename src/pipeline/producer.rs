//! 帧生产者 (FrameProducer)
//! 职责: 在输入源锁内读帧 → 预处理 → 阻塞写入有界队列

use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{SendTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::{FrameData, PlaybackFlags, SharedCapture};
use crate::input::Frame;
use crate::models::ModelRegistry;
use crate::preprocess::PreprocessingStage;

pub struct FrameProducer {
    capture: SharedCapture,
    registry: Arc<ModelRegistry>,
    flags: Arc<PlaybackFlags>,
    sender: Sender<FrameData>,
    pause_poll: Duration,
    stage: PreprocessingStage,

    // 统计
    count: u64,
    last: Instant,
}

impl FrameProducer {
    pub fn new(
        capture: SharedCapture,
        registry: Arc<ModelRegistry>,
        flags: Arc<PlaybackFlags>,
        sender: Sender<FrameData>,
        pause_poll: Duration,
    ) -> Self {
        Self {
            capture,
            registry,
            flags,
            sender,
            pause_poll,
            stage: PreprocessingStage::new(),
            count: 0,
            last: Instant::now(),
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("frame-producer".into())
            .spawn(move || self.run())
    }

    /// 帧率与是否直播源
    fn pacing(&self) -> (f64, bool) {
        let capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        capture
            .as_ref()
            .map(|c| (c.capabilities().fps, c.capabilities().live))
            .unwrap_or((0.0, true))
    }

    /// 读一帧并同步播放位置
    fn read_frame(&self) -> Option<Frame> {
        let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        let source = capture.as_mut()?;
        let frame = source.read_next();
        self.flags.set_position_ms(source.position_millis());
        frame
    }

    pub fn run(mut self) {
        let (fps, live) = self.pacing();
        let frame_interval = if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        info!(
            "✅ 生产者线程启动 | {:.2} fps{}",
            fps,
            if live { " | 直播源不限速" } else { "" }
        );

        'frames: loop {
            if self.flags.is_cancelled() {
                break;
            }
            if self.flags.is_paused() {
                thread::sleep(self.pause_poll);
                continue;
            }

            let start = Instant::now();
            let Some(frame) = self.read_frame() else {
                info!("⏹️ 输入流结束");
                break;
            };

            let (plan, tensors) = match self.stage.process(&frame, &self.registry) {
                Ok(result) => result,
                Err(e) => {
                    warn!("⚠️ 第 {} 帧预处理失败, 跳过: {:#}", frame.index, e);
                    continue;
                }
            };

            // 队列满时阻塞, 期间仍响应取消
            let mut item = FrameData { frame, plan, tensors };
            loop {
                match self.sender.send_timeout(item, self.pause_poll) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Timeout(back)) => {
                        if self.flags.is_cancelled() {
                            break 'frames;
                        }
                        item = back;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => break 'frames,
                }
            }

            self.count += 1;
            if self.last.elapsed().as_secs_f64() >= 1.0 {
                let elapsed = self.last.elapsed().as_secs_f64();
                info!(
                    "📺 读帧统计: {:.1}fps | 队列 {}/{}",
                    self.count as f64 / elapsed,
                    self.sender.len(),
                    self.sender.capacity().unwrap_or(0)
                );
                self.count = 0;
                self.last = Instant::now();
            }

            // 按源帧率控制读帧节奏
            if !live {
                let processing = start.elapsed();
                if let Some(sleep) = frame_interval.checked_sub(processing) {
                    thread::sleep(sleep);
                }
            }
        }

        debug!("📤 生产者线程退出, 预处理张量 {} 个", self.stage.tensors_computed());
        // self.sender 随之释放, 消费者取完剩余元素后退出
    }
}
