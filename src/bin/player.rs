use clap::Parser;
/// YOLO 视频推理播放器 - 无界面版本
///
/// 生产者/消费者双线程流水线, 标注帧写入输出目录或打印检测结果.
///
/// 运行: cargo run --bin player --features onnx,ffmpeg -- -s video.mp4 -m yolov8n.onnx:coco.txt
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use yolo_player::input::{is_image_path, SourceDescriptor};
use yolo_player::{
    gen_time_string, shared_sink, AnnotatedFrame, Args, ModelRegistry, ModelSession, PipelineConfig, PlaybackState,
    Renderer, TransportController,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("yolo_player=info,player=info,ort=warn")),
        )
        .with_thread_names(true)
        .init();

    let args = Args::parse();

    let mut config = PipelineConfig::load(&args.config);
    args.apply(&mut config);
    config.validate()?;
    config.print_summary();

    // ========== 加载模型 ==========
    let registry = Arc::new(ModelRegistry::new());
    for (model, labels) in args.model_pairs()? {
        match ModelSession::load(&model, &labels) {
            Ok(session) => {
                let session = registry.add(session);
                info!(
                    "📦 模型已加载: {} | 输入 {}x{} | {} 个类别",
                    model,
                    session.input_shape().width,
                    session.input_shape().height,
                    session.labels().len()
                );
            }
            Err(e) => error!("❌ {}", e),
        }
    }
    if registry.is_empty() {
        warn!("⚠️  没有可用模型, 只播放不检测");
    }

    let renderer = match args.font.as_deref() {
        Some(path) => Renderer::load_font(path).unwrap_or_else(|e| {
            warn!("⚠️  {:#}, 标签文字不绘制", e);
            Renderer::new()
        }),
        None => Renderer::new(),
    };

    let output_dir = args.output_dir.as_ref().map(PathBuf::from);
    if let Some(dir) = &output_dir {
        std::fs::create_dir_all(dir)?;
    }

    // ========== 渲染回调 ==========
    let done = Arc::new(AtomicBool::new(false));
    let processed = Arc::new(AtomicU64::new(0));
    let sink = {
        let done = Arc::clone(&done);
        let processed = Arc::clone(&processed);
        let max_frames = args.max_frames;
        let session = gen_time_string("");
        shared_sink(move |frame: AnnotatedFrame| {
            if !frame.inferred || done.load(Ordering::Acquire) {
                return;
            }
            report(&frame);
            if let Some(dir) = &output_dir {
                save_frame(dir, &session, &frame);
            }
            let n = processed.fetch_add(1, Ordering::AcqRel) + 1;
            if max_frames > 0 && n >= max_frames {
                done.store(true, Ordering::Release);
            }
        })
    };

    let mut controller = TransportController::with_renderer(config, registry, sink, renderer);

    // 单张图片直接同步推理
    if let SourceDescriptor::Path(path) = SourceDescriptor::parse(&args.source) {
        if path.is_file() && is_image_path(&path) {
            let detections = controller.process_still(&path)?;
            info!("✅ 完成: {} 个目标", detections.len());
            return Ok(());
        }
    }

    controller.load(&args.source)?;
    controller.play()?;

    while controller.state() != PlaybackState::Stopped && !done.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }
    controller.stop();

    info!("✅ 播放结束, 共处理 {} 帧", processed.load(Ordering::Acquire));
    Ok(())
}

fn report(frame: &AnnotatedFrame) {
    if frame.detections.is_empty() {
        return;
    }
    let summary: Vec<String> = frame.detections.iter().map(Renderer::label_text).collect();
    info!(
        "🎯 第 {} 帧 ({} ms): {} | {:.1}ms",
        frame.index,
        frame.timestamp_ms,
        summary.join(", "),
        frame.inference_ms
    );
}

fn save_frame(dir: &Path, session: &str, frame: &AnnotatedFrame) {
    let path = dir.join(format!("{}_{:06}.png", session, frame.index));
    if let Err(e) = frame.image.save(&path) {
        warn!("⚠️  保存失败 {}: {}", path.display(), e);
    }
}
