//! 图片输入源 - 单张图片或图片目录 (按文件名排序, 可定位)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::{is_image_path, CaptureBackend, Frame};

pub struct ImageSequence {
    paths: Vec<PathBuf>,
    position: u64,
    fps: f64,
}

impl ImageSequence {
    pub fn single(path: impl AsRef<Path>) -> Self {
        Self {
            paths: vec![path.as_ref().to_path_buf()],
            position: 0,
            fps: 0.0,
        }
    }

    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("无法读取目录 {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image_path(path))
            .collect();
        paths.sort();
        anyhow::ensure!(!paths.is_empty(), "目录中没有图片: {}", dir.display());

        info!("🖼️  图片序列: {} 张 ({})", paths.len(), dir.display());
        Ok(Self {
            paths,
            position: 0,
            fps: 0.0,
        })
    }

    /// 指定播放帧率 (默认不报告, 由调用方回退)
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }
}

/// 读取图片为BGR帧
pub fn read_image_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("无法读取图片文件: {}", path.display()))?
        .to_rgb8();
    Ok(Frame::from_rgb(&image))
}

impl CaptureBackend for ImageSequence {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.paths.len() as u64)
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.get(self.position as usize) else {
            return Ok(None);
        };
        let frame = read_image_frame(path)?;
        self.position += 1;
        Ok(Some(frame))
    }

    fn seek_to_frame(&mut self, index: u64) -> Result<()> {
        self.position = index.min(self.paths.len() as u64);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("yolo-player-seq-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_directory_sorted_and_seekable() {
        let dir = temp_dir("dir");
        for (i, name) in ["b.png", "a.png", "c.png"].iter().enumerate() {
            let img = RgbImage::from_pixel(4, 3, Rgb([i as u8 * 10, 0, 255]));
            img.save(dir.join(name)).unwrap();
        }
        fs::write(dir.join("notes.txt"), "not an image").unwrap();

        let mut seq = ImageSequence::from_dir(&dir).unwrap();
        assert_eq!(seq.frame_count(), Some(3));

        // a.png 是第二张写入的 (R=10), 转BGR后在第3通道
        let first = seq.read().unwrap().unwrap();
        assert_eq!((first.width, first.height), (4, 3));
        assert_eq!(&first.data[0..3], &[255, 0, 10]);

        seq.seek_to_frame(2).unwrap();
        let last = seq.read().unwrap().unwrap();
        assert_eq!(last.data[2], 20);
        assert!(seq.read().unwrap().is_none());
    }

    #[test]
    fn test_empty_directory_fails() {
        let dir = temp_dir("empty");
        assert!(ImageSequence::from_dir(&dir).is_err());
    }

    #[test]
    fn test_unreadable_image_is_error() {
        let dir = temp_dir("broken");
        let path = dir.join("broken.png");
        fs::write(&path, b"garbage").unwrap();
        let mut seq = ImageSequence::single(&path);
        assert!(seq.read().is_err());
    }
}
