//! 合成输入源 - 确定性内存帧, 用于测试与无设备演示

use super::{CaptureBackend, Frame};

/// 合成输入源
///
/// 第 i 帧: B = i*8, G = x, R = y (取低8位).
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    frames: u64,
    fps: f64,
    position: u64,
    live: bool,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32, frames: u64, fps: f64) -> Self {
        Self {
            width,
            height,
            frames,
            fps,
            position: 0,
            live: false,
        }
    }

    /// 作为直播源 (无时长, 不支持定位)
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    fn render(&self, index: u64) -> Frame {
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        let blue = (index * 8) as u8;
        for y in 0..self.height {
            for x in 0..self.width {
                data.extend_from_slice(&[blue, x as u8, y as u8]);
            }
        }
        Frame::new(self.width, self.height, data)
    }
}

impl CaptureBackend for SyntheticCapture {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        if self.live {
            None
        } else {
            Some(self.frames)
        }
    }

    fn read(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.position >= self.frames {
            return Ok(None);
        }
        let frame = self.render(self.position);
        self.position += 1;
        Ok(Some(frame))
    }

    fn seek_to_frame(&mut self, index: u64) -> anyhow::Result<()> {
        anyhow::ensure!(!self.live, "直播源不支持定位");
        self.position = index.min(self.frames);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}
