// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 模型会话与注册表
///
/// ## InferenceBackend Trait
/// 推理运行时的窄接口: 报告输入形状, 对一个NCHW张量执行推理.
/// - `OrtBackend`: ONNX Runtime 实现 (`onnx` 特性), 文件: `ort_backend.rs`
/// - 测试中可用任意实现替换
///
/// ## ModelSession
/// 模型路径 + 标签 + 输入形状 + 后端句柄, 以及预处理分配的形状组编号.
///
/// ## ModelRegistry
/// 运行时可增删的模型集合, 每次变更递增代数, 预处理据此重新分组.
#[cfg(feature = "onnx")]
pub mod ort_backend;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use ndarray::{Array, IxDyn};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

#[cfg(feature = "onnx")]
pub use ort_backend::OrtBackend;

/// 形状组尚未分配
pub const UNASSIGNED_GROUP: usize = usize::MAX;

/// 模型输入形状 (NCHW 中的 C/H/W)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputShape {
    pub channels: usize,
    pub height: u32,
    pub width: u32,
}

impl InputShape {
    pub fn new(channels: usize, height: u32, width: u32) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// NCHW 维度, batch 固定为 1
    pub fn dims(&self) -> [usize; 4] {
        [1, self.channels, self.height as usize, self.width as usize]
    }
}

/// 推理后端接口
pub trait InferenceBackend: Send {
    fn input_shape(&self) -> InputShape;

    /// 执行推理, 返回第一个输出张量
    fn run(&mut self, input: &Array<f32, IxDyn>) -> anyhow::Result<Array<f32, IxDyn>>;
}

/// 模型会话
pub struct ModelSession {
    path: PathBuf,
    labels: Vec<String>,
    input: InputShape,
    backend: Mutex<Box<dyn InferenceBackend>>,
    shape_group: AtomicUsize,
    retired: AtomicBool,
}

impl ModelSession {
    pub fn new(path: impl Into<PathBuf>, labels: Vec<String>, backend: Box<dyn InferenceBackend>) -> Self {
        let input = backend.input_shape();
        Self {
            path: path.into(),
            labels,
            input,
            backend: Mutex::new(backend),
            shape_group: AtomicUsize::new(UNASSIGNED_GROUP),
            retired: AtomicBool::new(false),
        }
    }

    /// 加载ONNX模型与标签文件, 并执行一次预热
    #[cfg(feature = "onnx")]
    pub fn load(model_path: impl AsRef<Path>, labels_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let load_err = |source: anyhow::Error| PipelineError::ModelLoad {
            path: model_path.to_path_buf(),
            source,
        };

        let labels = read_labels(labels_path.as_ref()).map_err(|e| load_err(e.into()))?;
        let backend = OrtBackend::new(model_path).map_err(load_err)?;
        let session = Self::new(model_path, labels, Box::new(backend));
        session.warm_up()?;

        info!(
            "✅ 模型加载成功: {} | 输入 {}x{} | 标签 {:?}",
            model_path.display(),
            session.input.width,
            session.input.height,
            session.labels
        );
        Ok(session)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn input_shape(&self) -> InputShape {
        self.input
    }

    /// 预处理分配的形状组编号
    ///
    /// 推理按帧携带的 `ShapePlan` 取张量, 这里只是最近一次分配的缓存.
    pub(crate) fn shape_group(&self) -> Option<usize> {
        match self.shape_group.load(Ordering::Acquire) {
            UNASSIGNED_GROUP => None,
            group => Some(group),
        }
    }

    pub(crate) fn assign_shape_group(&self, group: usize) {
        self.shape_group.store(group, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// 预热: 用全零张量跑一次推理
    pub fn warm_up(&self) -> Result<()> {
        let start = Instant::now();
        let zeros = Array::zeros(IxDyn(&self.input.dims()));
        self.run(&zeros).map_err(|e| match e {
            PipelineError::Inference { path, source } => PipelineError::ModelLoad { path, source },
            other => other,
        })?;
        debug!(
            "🔥 模型预热完成: {} ({:.1}ms)",
            self.path.display(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    pub fn run(&self, input: &Array<f32, IxDyn>) -> Result<Array<f32, IxDyn>> {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        backend.run(input).map_err(|source| PipelineError::Inference {
            path: self.path.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("path", &self.path)
            .field("input", &self.input)
            .field("labels", &self.labels)
            .finish()
    }
}

/// 读取标签文件: 每行一个标签, 忽略空行
pub fn read_labels(path: impl AsRef<Path>) -> std::io::Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// 模型注册表
#[derive(Default)]
pub struct ModelRegistry {
    sessions: RwLock<Vec<Arc<ModelSession>>>,
    generation: AtomicU64,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: ModelSession) -> Arc<ModelSession> {
        let session = Arc::new(session);
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.push(Arc::clone(&session));
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!("➕ 注册模型: {} (共 {} 个)", session.path.display(), sessions.len());
        session
    }

    /// 按路径移除模型, 之后的帧不再调度该模型
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|session| {
            let keep = session.path != path;
            if !keep {
                session.retired.store(true, Ordering::Release);
            }
            keep
        });
        let removed = sessions.len() != before;
        if removed {
            self.generation.fetch_add(1, Ordering::AcqRel);
            info!("➖ 移除模型: {} (剩余 {} 个)", path.display(), sessions.len());
        }
        removed
    }

    /// 当前代数与模型列表
    pub fn snapshot(&self) -> (u64, Vec<Arc<ModelSession>>) {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        (self.generation.load(Ordering::Acquire), sessions.clone())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
