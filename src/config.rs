//! 流水线配置 - 通过JSON文件调整参数

use std::fs;
use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

/// 流水线参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 检测参数 ===
    pub conf_threshold: f32, // 置信度阈值
    pub iou_threshold: f32,  // NMS IOU阈值

    // === 跟踪参数 ===
    pub tracking_enabled: bool,
    pub track_distance_threshold: f32, // 中心点匹配距离(像素)
    pub track_max_missed: u32,         // 最大连续丢失帧数

    // === 调度参数 ===
    pub queue_capacity: usize,
    pub default_fps: f64, // 源帧率无效时的回退值
    pub producer_pause_poll_ms: u64,
    pub consumer_pause_poll_ms: u64,
    pub consumer_poll_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            iou_threshold: 0.5,

            tracking_enabled: false,
            track_distance_threshold: 50.0,
            track_max_missed: 10,

            queue_capacity: 10,
            default_fps: 25.0,
            producer_pause_poll_ms: 10,
            consumer_pause_poll_ms: 100,
            consumer_poll_timeout_ms: 100,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置
    ///
    /// 文件不存在时写出默认配置; 解析失败时回退默认值.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("❌ 保存配置失败: {}", e);
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        fs::write(path.as_ref(), json)?;
        info!("💾 配置已保存到 {}", path.as_ref().display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(PipelineError::Config(format!(
                "conf_threshold 超出 [0,1]: {}",
                self.conf_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(PipelineError::Config(format!(
                "iou_threshold 超出 [0,1]: {}",
                self.iou_threshold
            )));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::Config("queue_capacity 不能为 0".into()));
        }
        if self.track_distance_threshold <= 0.0 {
            return Err(PipelineError::Config(
                "track_distance_threshold 必须为正".into(),
            ));
        }
        if !(self.default_fps > 0.0) {
            return Err(PipelineError::Config("default_fps 必须为正".into()));
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!(
            "🎛️  当前配置: 置信度 {:.2} | IOU {:.2} | 跟踪 {} (距离 {:.0}px, 丢失 {} 帧) | 队列 {}",
            self.conf_threshold,
            self.iou_threshold,
            if self.tracking_enabled { "启用" } else { "禁用" },
            self.track_distance_threshold,
            self.track_max_missed,
            self.queue_capacity
        );
    }
}

/// 播放器命令行参数
#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "YOLO 视频推理播放器", long_about = None)]
pub struct Args {
    /// 输入来源: 摄像头编号(0)、视频/图片路径、图片目录或网络流地址
    #[arg(short, long)]
    pub source: String,

    /// 模型与标签文件, 格式 `model.onnx:labels.txt`, 可重复
    #[arg(short, long = "model", value_name = "MODEL:LABELS", required = true)]
    pub models: Vec<String>,

    /// JSON 配置文件
    #[arg(long, default_value = "player.json")]
    pub config: String,

    /// 启用目标跟踪
    #[arg(long)]
    pub track: bool,

    /// 置信度阈值 (覆盖配置文件)
    #[arg(long)]
    pub conf: Option<f32>,

    /// NMS IOU 阈值 (覆盖配置文件)
    #[arg(long)]
    pub iou: Option<f32>,

    /// 最大处理帧数 (0 表示无限制)
    #[arg(long, default_value_t = 0)]
    pub max_frames: u64,

    /// 标注帧输出目录 (不指定则只打印检测结果)
    #[arg(short, long)]
    pub output_dir: Option<String>,

    /// 标签文字字体 (TTF/OTF)
    #[arg(long)]
    pub font: Option<String>,
}

impl Args {
    /// 命令行参数覆盖配置文件
    pub fn apply(&self, config: &mut PipelineConfig) {
        if self.track {
            config.tracking_enabled = true;
        }
        if let Some(conf) = self.conf {
            config.conf_threshold = conf;
        }
        if let Some(iou) = self.iou {
            config.iou_threshold = iou;
        }
    }

    /// 解析 `model.onnx:labels.txt`
    ///
    /// 按最后一个 `:` 切分, 兼容 Windows 盘符.
    pub fn model_pairs(&self) -> Result<Vec<(String, String)>> {
        self.models
            .iter()
            .map(|spec| {
                spec.rsplit_once(':')
                    .filter(|(model, labels)| !model.is_empty() && !labels.is_empty())
                    .map(|(model, labels)| (model.to_string(), labels.to_string()))
                    .ok_or_else(|| {
                        PipelineError::Config(format!("模型参数格式应为 MODEL:LABELS: {}", spec))
                    })
            })
            .collect()
    }
}
