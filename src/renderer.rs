//! 检测结果绘制 - 红色边框 + 标签背景 + 文字

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detection::DetectionBox;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: i32 = 2;
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 2;

#[derive(Clone, Default)]
pub struct Renderer {
    font: Option<FontArc>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font(font: FontArc) -> Self {
        Self { font: Some(font) }
    }

    /// 从 TTF/OTF 文件加载标签字体
    pub fn load_font(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("无法读取字体文件: {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes).with_context(|| format!("字体文件无效: {}", path.display()))?;
        Ok(Self::with_font(font))
    }

    pub fn label_text(det: &DetectionBox) -> String {
        if det.track_id > 0 {
            format!("{} {:.2} #{}", det.label, det.confidence, det.track_id)
        } else {
            format!("{} {:.2}", det.label, det.confidence)
        }
    }

    pub fn annotate(&self, image: &mut RgbImage, detections: &[DetectionBox]) {
        for det in detections {
            self.draw_detection(image, det);
        }
    }

    fn draw_detection(&self, image: &mut RgbImage, det: &DetectionBox) {
        let (w, h) = (image.width() as i32, image.height() as i32);
        let x = (det.x.floor() as i32).clamp(0, w - 1);
        let y = (det.y.floor() as i32).clamp(0, h - 1);
        let bw = (det.width.round() as i32).min(w - x);
        let bh = (det.height.round() as i32).min(h - y);
        if bw <= 0 || bh <= 0 {
            return;
        }

        // 边框加粗为2像素, 向内收缩
        for t in 0..BOX_THICKNESS {
            let (iw, ih) = (bw - 2 * t, bh - 2 * t);
            if iw <= 0 || ih <= 0 {
                break;
            }
            let rect = Rect::at(x + t, y + t).of_size(iw as u32, ih as u32);
            draw_hollow_rect_mut(image, rect, BOX_COLOR);
        }

        let Some(font) = self.font.as_ref() else {
            return;
        };

        let label = Self::label_text(det);
        let scale = PxScale::from(LABEL_FONT_SIZE);
        let (tw, th) = text_size(scale, font, &label);
        let label_h = th as i32 + 2 * LABEL_PADDING;
        let label_w = (tw as i32 + 2 * LABEL_PADDING).min(w - x);
        // 优先放在框上方, 空间不够时放在框内顶部
        let label_y = if y >= label_h { y - label_h } else { y };

        if label_w > 0 {
            let rect = Rect::at(x, label_y).of_size(label_w as u32, label_h as u32);
            draw_filled_rect_mut(image, rect, BOX_COLOR);
            draw_text_mut(
                image,
                TEXT_COLOR,
                x + LABEL_PADDING,
                label_y + LABEL_PADDING,
                scale,
                font,
                &label,
            );
        }
    }
}
