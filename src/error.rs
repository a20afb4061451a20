//! 流水线错误类型
//! Error taxonomy of the inference pipeline

use std::path::PathBuf;

/// 流水线错误
///
/// 读帧失败与流结束不在此列: 二者都按自然结束处理, 播放转入 Stopped.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 输入源无法打开, 控制器保持 Stopped
    #[error("无法打开输入源 `{descriptor}`: {source}")]
    Open {
        descriptor: String,
        #[source]
        source: anyhow::Error,
    },

    /// 直播源(摄像头/网络流)不支持定位
    #[error("输入源 `{0}` 不支持定位")]
    SeekUnsupported(String),

    /// 定位调用失败, 状态不变
    #[error("定位失败: {0}")]
    Seek(#[source] anyhow::Error),

    /// 模型会话创建失败, 该模型不会被注册
    #[error("模型加载失败 `{path}`: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// 单个模型单帧推理失败
    #[error("模型推理失败 `{path}`: {source}")]
    Inference {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// 尚未加载输入源
    #[error("请先加载视频文件或流")]
    NotLoaded,

    #[error("配置无效: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
