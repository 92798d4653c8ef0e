use crate::ai::Detection;
use crate::frame::Frame;
use ab_glyph::{FontVec, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FONT_CANDIDATES: [&str; 3] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
];

const BOX_COLOR: Rgb<u8> = Rgb([255, 56, 56]);
const LABEL_TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const OVERLAY_TEXT: Rgb<u8> = Rgb([0, 255, 0]);

/// Draws detection boxes and the status line onto frames.
///
/// Text needs a TrueType font; without one only the boxes are drawn.
pub struct Annotator {
    font: Option<FontVec>,
    scale: PxScale,
}

impl Annotator {
    pub fn without_text() -> Self {
        Self {
            font: None,
            scale: PxScale::from(18.0),
        }
    }

    /// Loads `font`, or the first system font found when `None`.
    pub fn load(font: Option<&Path>) -> Self {
        let candidates: Vec<PathBuf> = match font {
            Some(p) => vec![p.to_path_buf()],
            None => FONT_CANDIDATES.iter().map(PathBuf::from).collect(),
        };
        for path in candidates {
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            match FontVec::try_from_vec(bytes) {
                Ok(f) => {
                    debug!(font = %path.display(), "overlay font loaded");
                    return Self {
                        font: Some(f),
                        ..Self::without_text()
                    };
                }
                Err(e) => warn!("invalid font {}: {e}", path.display()),
            }
        }
        warn!("no overlay font available, text will not be drawn");
        Self::without_text()
    }

    pub fn has_text(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw_detections(&self, frame: &mut Frame, detections: &[Detection]) {
        for d in detections {
            let b = d.bbox.clamp(frame.width(), frame.height());
            let (w, h) = (b.width().round() as u32, b.height().round() as u32);
            if w == 0 || h == 0 {
                continue;
            }
            let rect = Rect::at(b.x1.round() as i32, b.y1.round() as i32).of_size(w, h);
            draw_hollow_rect_mut(frame, rect, BOX_COLOR);
            if w > 2 && h > 2 {
                let inner = Rect::at(rect.left() + 1, rect.top() + 1).of_size(w - 2, h - 2);
                draw_hollow_rect_mut(frame, inner, BOX_COLOR);
            }
            if let Some(font) = &self.font {
                let text = format!("{} {:.2}", d.label, d.confidence);
                let text_h = self.scale.y.ceil() as u32;
                let text_w = (text.len() as f32 * self.scale.x * 0.55).ceil() as u32;
                let top = (rect.top() - text_h as i32).max(0);
                draw_filled_rect_mut(
                    frame,
                    Rect::at(rect.left(), top).of_size(text_w.max(1), text_h),
                    BOX_COLOR,
                );
                draw_text_mut(frame, LABEL_TEXT, rect.left(), top, self.scale, font, &text);
            }
        }
    }

    pub fn draw_status(&self, frame: &mut Frame, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(frame, OVERLAY_TEXT, 10, 10, PxScale::from(20.0), font, text);
        }
    }
}

pub fn status_line(frame: u64, detections: usize, fps: f64) -> String {
    format!("Frame: {frame} | Detections: {detections} | FPS: {fps:.1}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::BoundingBox;
    use image::RgbImage;

    #[test]
    fn status_line_format() {
        assert_eq!(
            status_line(12, 3, 14.567),
            "Frame: 12 | Detections: 3 | FPS: 14.6"
        );
    }

    #[test]
    fn box_outline_is_drawn() {
        let mut frame = RgbImage::new(32, 32);
        let det = Detection {
            bbox: BoundingBox {
                x1: 4.0,
                y1: 4.0,
                x2: 20.0,
                y2: 20.0,
            },
            confidence: 0.9,
            class_id: 0,
            label: "person".into(),
        };
        Annotator::without_text().draw_detections(&mut frame, &[det]);
        assert_eq!(frame.get_pixel(4, 4), &BOX_COLOR);
        assert_eq!(frame.get_pixel(12, 12), &Rgb([0, 0, 0]));
    }

    #[test]
    fn degenerate_box_is_skipped() {
        let mut frame = RgbImage::new(8, 8);
        let det = Detection {
            bbox: BoundingBox {
                x1: 20.0,
                y1: 20.0,
                x2: 30.0,
                y2: 30.0,
            },
            confidence: 0.5,
            class_id: 0,
            label: "x".into(),
        };
        Annotator::without_text().draw_detections(&mut frame, &[det]);
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn missing_font_disables_text() {
        let a = Annotator::load(Some(Path::new("/nonexistent/font.ttf")));
        assert!(!a.has_text());
    }
}
