//! FFmpeg输入源 - 视频文件 / 摄像头 / 网络流
//!
//! 解码在 FFmpeg 调度线程中进行, 帧过滤器把 BGR24 帧写入有界通道,
//! `read` 从通道取帧. 定位时中止当前解码并从新的起始时间重新打开.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::core::scheduler::ffmpeg_scheduler::{FfmpegScheduler, Running};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::stream_info::{find_video_stream_info, StreamInfo};
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{debug, info, warn};

use super::{CaptureBackend, Frame};

/// 解码线程与读取方之间的缓冲帧数
const DECODE_BUFFER: usize = 4;

/// 帧过滤器: 解码帧 → BGR24 紧密排列 → 通道
#[derive(Clone)]
struct BgrFrameFilter {
    sender: Sender<Frame>,
    total_frames: usize,
    dropped_frames: usize,
}

impl FrameFilter for BgrFrameFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: ez_ffmpeg::Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<ez_ffmpeg::Frame>, String> {
        self.total_frames += 1;

        unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped_frames += 1;
                warn!("⚠️ 丢弃帧 #{}: 空帧/损坏帧", self.total_frames);
                return Ok(None);
            }

            let w = (*frame.as_ptr()).width as usize;
            let h = (*frame.as_ptr()).height as usize;
            let plane = (*frame.as_ptr()).data[0];
            let stride = (*frame.as_ptr()).linesize[0] as usize;

            if w == 0 || h == 0 || plane.is_null() || stride < w * 3 {
                self.dropped_frames += 1;
                warn!(
                    "⚠️ 丢弃帧 #{}: 非法尺寸 {}x{} 步长 {}",
                    self.total_frames, w, h, stride
                );
                return Ok(None);
            }

            // 按行拷贝, 去掉行尾填充
            let row_bytes = w * 3;
            let mut data = Vec::with_capacity(row_bytes * h);
            for row in 0..h {
                let src = std::slice::from_raw_parts(plane.add(row * stride), row_bytes);
                data.extend_from_slice(src);
            }

            if self
                .sender
                .send(Frame::new(w as u32, h as u32, data))
                .is_err()
            {
                return Err("capture closed".to_string());
            }
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!(
            "✅ 解码线程退出: 总帧 {} | 丢弃 {}",
            self.total_frames, self.dropped_frames
        );
    }
}

/// FFmpeg输入源
pub struct FfmpegCapture {
    url: String,
    format: Option<&'static str>,
    live: bool,
    fps: f64,
    frame_count: Option<u64>,
    position: u64,
    receiver: Option<Receiver<Frame>>,
    scheduler: Option<FfmpegScheduler<Running>>,
}

impl FfmpegCapture {
    /// 打开视频文件或网络流
    pub fn open(url: &str) -> Result<Self> {
        let info = find_video_stream_info(url).map_err(|e| anyhow!("探测视频流失败: {}", e))?;
        let (fps, nb_frames) = match info {
            Some(StreamInfo::Video {
                avg_frame_rate,
                nb_frames,
                ..
            }) => {
                let fps = if avg_frame_rate.den != 0 {
                    avg_frame_rate.num as f64 / avg_frame_rate.den as f64
                } else {
                    0.0
                };
                (fps, nb_frames)
            }
            _ => return Err(anyhow!("没有找到视频流: {}", url)),
        };

        // 网络流没有时长; 文件优先使用帧数, 否则按时长估算
        let duration_us = ez_ffmpeg::container_info::get_duration_us(url).unwrap_or(0);
        let frame_count = if nb_frames > 0 {
            Some(nb_frames as u64)
        } else if duration_us > 0 && fps > 0.0 {
            Some((duration_us as f64 / 1_000_000.0 * fps) as u64)
        } else {
            None
        };

        info!(
            "📹 视频流: {} | {:.2} fps | 帧数 {:?}",
            url, fps, frame_count
        );

        Ok(Self {
            url: url.to_string(),
            format: None,
            live: frame_count.is_none(),
            fps,
            frame_count,
            position: 0,
            receiver: None,
            scheduler: None,
        })
    }

    /// 打开本地摄像头 (DirectShow / AVFoundation / V4L2)
    pub fn camera(index: u32) -> Result<Self> {
        let url = camera_url(index)?;
        info!("📷 摄像头 {} → {}", index, url);
        let mut capture = Self {
            url,
            format: Some(camera_format()),
            live: true,
            fps: 0.0,
            frame_count: None,
            position: 0,
            receiver: None,
            scheduler: None,
        };
        // 摄像头立即启动, 打开失败要在 load 时报告
        capture.start()?;
        Ok(capture)
    }

    fn start(&mut self) -> Result<()> {
        let (sender, receiver) = bounded(DECODE_BUFFER);
        let filter = BgrFrameFilter {
            sender,
            total_frames: 0,
            dropped_frames: 0,
        };

        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("capture", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let mut input = Input::new(self.url.clone());
        if let Some(format) = self.format {
            input = input.set_format(format);
        }
        if !self.live {
            if let Some(start_us) = start_time_us(self.position, self.fps) {
                input = input.set_start_time_us(start_us);
            }
        }

        let ctx = FfmpegContext::builder()
            .input(input)
            .filter_desc("format=bgr24")
            .output(out)
            .build()
            .map_err(|e| anyhow!("构建失败: {}", e))?;
        let sch = ctx.start().map_err(|e| anyhow!("启动失败: {}", e))?;
        debug!("▶️ 解码开始: {} (第 {} 帧)", self.url, self.position);

        self.receiver = Some(receiver);
        self.scheduler = Some(sch);
        Ok(())
    }

    fn shutdown(&mut self) {
        // 先断开通道, 解码线程的阻塞发送随即失败退出
        self.receiver = None;
        if let Some(sch) = self.scheduler.take() {
            let _ = sch.abort();
        }
    }
}

/// 帧号换算为解码起始时间 (微秒), 第0帧不需要定位
fn start_time_us(position: u64, fps: f64) -> Option<i64> {
    (position > 0 && fps > 0.0 && fps.is_finite()).then(|| (position as f64 / fps * 1_000_000.0) as i64)
}

impl CaptureBackend for FfmpegCapture {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn set_effective_fps(&mut self, fps: f64) {
        // 与 CaptureSource 的帧号/毫秒换算保持一致
        self.fps = fps;
    }

    fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.receiver.is_none() {
            self.start()?;
        }
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(None);
        };
        match receiver.recv() {
            Ok(frame) => {
                self.position += 1;
                Ok(Some(frame))
            }
            Err(_) => {
                debug!("⏹️ 解码结束: {}", self.url);
                Ok(None)
            }
        }
    }

    fn seek_to_frame(&mut self, index: u64) -> Result<()> {
        anyhow::ensure!(!self.live, "直播源不支持定位");
        self.shutdown();
        self.position = index;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn release(&mut self) {
        self.shutdown();
    }
}

/// 获取可用的摄像头设备列表
pub fn list_video_devices() -> Vec<(usize, String)> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => devices.into_iter().enumerate().collect(),
        Err(e) => {
            warn!("⚠️ 获取摄像头列表失败: {}", e);
            vec![]
        }
    }
}

fn camera_format() -> &'static str {
    if cfg!(target_os = "windows") {
        "dshow"
    } else if cfg!(target_os = "macos") {
        "avfoundation"
    } else {
        "v4l2"
    }
}

/// 摄像头URL - 根据平台选择
fn camera_url(index: u32) -> Result<String> {
    if cfg!(target_os = "windows") {
        // DirectShow 按设备名打开
        let name = list_video_devices()
            .into_iter()
            .find(|(i, _)| *i == index as usize)
            .map(|(_, name)| name)
            .ok_or_else(|| anyhow!("找不到摄像头设备 {}", index))?;
        Ok(format!("video={}", name))
    } else if cfg!(target_os = "macos") {
        Ok(index.to_string())
    } else {
        Ok(format!("/dev/video{}", index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_time_uses_effective_fps() {
        assert_eq!(start_time_us(0, 25.0), None);
        assert_eq!(start_time_us(50, 25.0), Some(2_000_000));
        // 帧率无效时不定位
        assert_eq!(start_time_us(50, 0.0), None);
        assert_eq!(start_time_us(50, f64::NAN), None);
    }

    #[test]
    fn test_fallback_fps_reaches_decoder() {
        let mut capture = FfmpegCapture {
            url: "missing.mp4".into(),
            format: None,
            live: false,
            fps: 0.0,
            frame_count: Some(250),
            position: 0,
            receiver: None,
            scheduler: None,
        };
        capture.set_effective_fps(25.0);
        capture.seek_to_frame(100).unwrap();
        assert_eq!(start_time_us(capture.position(), capture.fps()), Some(4_000_000));
    }
}
