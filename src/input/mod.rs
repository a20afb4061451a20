/// 视频输入系统 (Video Input System)
///
/// 统一封装摄像头编号、文件路径与网络流地址, 对外提供
/// "读下一帧 / 定位 / 时长 / 帧率" 接口.
/// - ImageSequence: 单张图片或图片目录 (可定位)
/// - SyntheticCapture: 内存合成帧 (测试与演示)
/// - FfmpegCapture: 视频文件 / 摄像头 / 网络流 (需 `ffmpeg` 特性)
pub mod image_sequence;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use image::RgbImage;
use tracing::{info, warn};
use url::Url;

use crate::error::{PipelineError, Result};

pub use image_sequence::ImageSequence;
pub use synthetic::SyntheticCapture;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{list_video_devices, FfmpegCapture};

/// 网络流协议
const STREAM_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "rtmps", "http", "https", "udp", "tcp", "srt", "hls"];

/// 可直接解码的图片格式
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff"];

/// 视频帧 (BGR24, 行紧密排列)
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// 帧序号 (从0开始)
    pub index: u64,
    /// 时间戳 (毫秒)
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
            index: 0,
            timestamp_ms: 0,
        }
    }

    /// RGB图像 → BGR帧
    pub fn from_rgb(image: &RgbImage) -> Self {
        let mut data = image.as_raw().clone();
        for px in data.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        Self::new(image.width(), image.height(), data)
    }

    /// 缓冲区长度与宽高一致
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * 3
    }

    /// BGR帧 → RGB图像 (用于标注与显示)
    ///
    /// 缓冲区长度不符时返回黑图并告警; `CaptureSource` 读出的帧已校验过长度.
    pub fn to_rgb_image(&self) -> RgbImage {
        let mut data = self.data.clone();
        for px in data.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        RgbImage::from_raw(self.width, self.height, data).unwrap_or_else(|| {
            warn!(
                "⚠️  第 {} 帧数据长度 {} 与 {}x{} 不符, 输出黑图",
                self.index,
                self.data.len(),
                self.width,
                self.height
            );
            RgbImage::new(self.width, self.height)
        })
    }
}

/// 输入来源描述
#[derive(Clone, Debug, PartialEq)]
pub enum SourceDescriptor {
    /// 摄像头编号
    Device(u32),
    /// 本地文件或图片目录
    Path(PathBuf),
    /// 网络流地址
    Stream(Url),
}

impl SourceDescriptor {
    pub fn parse(descriptor: &str) -> Self {
        let trimmed = descriptor.trim();
        if let Ok(index) = trimmed.parse::<u32>() {
            return SourceDescriptor::Device(index);
        }
        if let Ok(url) = Url::parse(trimmed) {
            if STREAM_SCHEMES.contains(&url.scheme()) {
                return SourceDescriptor::Stream(url);
            }
        }
        SourceDescriptor::Path(PathBuf::from(trimmed))
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, SourceDescriptor::Path(_))
    }
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 输入后端接口
///
/// 后端只负责按顺序产出帧与按帧号定位, 帧序号和时间戳由 [`CaptureSource`] 填写.
pub trait CaptureBackend: Send {
    /// 源报告的帧率 (可能为0或NaN)
    fn fps(&self) -> f64;

    /// 总帧数, 直播源为 None
    fn frame_count(&self) -> Option<u64>;

    fn is_live(&self) -> bool {
        self.frame_count().is_none()
    }

    /// 读取下一帧, 流结束返回 Ok(None)
    fn read(&mut self) -> anyhow::Result<Option<Frame>>;

    /// 定位到指定帧号, 下一次 read 返回该帧
    fn seek_to_frame(&mut self, index: u64) -> anyhow::Result<()>;

    /// 下一帧的帧号
    fn position(&self) -> u64;

    /// 告知实际使用的帧率 (源帧率无效时为回退值), 帧号与时间按它换算
    fn set_effective_fps(&mut self, _fps: f64) {}

    fn release(&mut self) {}
}

/// 输入能力描述
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Capabilities {
    /// 帧率 (已回退为有效值)
    pub fps: f64,
    pub frame_count: u64,
    /// 总时长 (毫秒), 直播源为0
    pub duration_ms: u64,
    pub live: bool,
}

/// 输入源
pub struct CaptureSource {
    descriptor: String,
    backend: Box<dyn CaptureBackend>,
    capabilities: Capabilities,
    released: bool,
}

impl CaptureSource {
    /// 按描述打开输入源
    pub fn open(descriptor: &str, default_fps: f64) -> Result<Self> {
        let open_err = |source: anyhow::Error| PipelineError::Open {
            descriptor: descriptor.to_string(),
            source,
        };

        let backend: Box<dyn CaptureBackend> = match SourceDescriptor::parse(descriptor) {
            SourceDescriptor::Device(index) => open_camera(index).map_err(open_err)?,
            SourceDescriptor::Path(path) => {
                if !path.exists() {
                    return Err(open_err(anyhow!("文件不存在: {}", path.display())));
                }
                if path.is_dir() {
                    Box::new(ImageSequence::from_dir(&path).map_err(open_err)?)
                } else if is_image_path(&path) {
                    Box::new(ImageSequence::single(&path))
                } else {
                    open_video(&path.to_string_lossy()).map_err(open_err)?
                }
            }
            SourceDescriptor::Stream(url) => open_video(url.as_str()).map_err(open_err)?,
        };

        Ok(Self::from_backend(descriptor, backend, default_fps))
    }

    /// 使用已构建的后端
    pub fn from_backend(descriptor: impl Into<String>, mut backend: Box<dyn CaptureBackend>, default_fps: f64) -> Self {
        let descriptor = descriptor.into();
        let reported = backend.fps();
        let fps = if reported > 0.0 && reported.is_finite() {
            reported
        } else {
            warn!("⚠️  输入源未报告有效帧率 ({}), 使用默认 {} fps", reported, default_fps);
            default_fps
        };
        backend.set_effective_fps(fps);

        let live = backend.is_live();
        let frame_count = if live { 0 } else { backend.frame_count().unwrap_or(0) };
        let duration_ms = if live {
            0
        } else {
            (frame_count as f64 / fps * 1000.0) as u64
        };

        info!(
            "🎬 输入源已打开: {} | {:.2} fps | {} 帧 | {} ms{}",
            descriptor,
            fps,
            frame_count,
            duration_ms,
            if live { " | 直播" } else { "" }
        );

        Self {
            descriptor,
            backend,
            capabilities: Capabilities {
                fps,
                frame_count,
                duration_ms,
                live,
            },
            released: false,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// 读取下一帧
    ///
    /// 读帧错误记录日志后按流结束处理.
    pub fn read_next(&mut self) -> Option<Frame> {
        if self.released {
            return None;
        }
        let index = self.backend.position();
        match self.backend.read() {
            Ok(Some(frame)) if !frame.is_well_formed() => {
                warn!(
                    "⚠️  第 {} 帧数据长度 {} 与 {}x{} 不符, 按流结束处理",
                    index,
                    frame.data.len(),
                    frame.width,
                    frame.height
                );
                None
            }
            Ok(Some(mut frame)) => {
                frame.index = index;
                frame.timestamp_ms = self.frame_to_millis(index);
                Some(frame)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("⚠️  读帧失败 (第 {} 帧), 按流结束处理: {:#}", index, e);
                None
            }
        }
    }

    pub fn seek_to_frame(&mut self, index: u64) -> Result<()> {
        if self.capabilities.live {
            return Err(PipelineError::SeekUnsupported(self.descriptor.clone()));
        }
        if self.released {
            return Err(PipelineError::Seek(anyhow!("输入源已释放")));
        }
        let index = index.min(self.capabilities.frame_count);
        self.backend.seek_to_frame(index).map_err(PipelineError::Seek)
    }

    pub fn seek_to_millis(&mut self, millis: u64) -> Result<()> {
        let index = (millis as f64 * self.capabilities.fps / 1000.0) as u64;
        self.seek_to_frame(index)
    }

    /// 下一帧的帧号
    pub fn frame_position(&self) -> u64 {
        self.backend.position()
    }

    /// 当前读取位置 (毫秒)
    pub fn position_millis(&self) -> u64 {
        self.frame_to_millis(self.backend.position())
    }

    fn frame_to_millis(&self, index: u64) -> u64 {
        (index as f64 * 1000.0 / self.capabilities.fps) as u64
    }

    /// 释放资源 (可重复调用)
    pub fn release(&mut self) {
        if !self.released {
            self.backend.release();
            self.released = true;
            info!("🔌 输入源已释放: {}", self.descriptor);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "ffmpeg")]
fn open_camera(index: u32) -> anyhow::Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(FfmpegCapture::camera(index)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_camera(index: u32) -> anyhow::Result<Box<dyn CaptureBackend>> {
    Err(anyhow!("摄像头 {} 需要启用 `ffmpeg` 特性", index))
}

#[cfg(feature = "ffmpeg")]
fn open_video(url: &str) -> anyhow::Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(FfmpegCapture::open(url)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_video(url: &str) -> anyhow::Result<Box<dyn CaptureBackend>> {
    Err(anyhow!("视频/流输入 `{}` 需要启用 `ffmpeg` 特性", url))
}
