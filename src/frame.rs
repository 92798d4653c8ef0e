use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One captured camera image.
pub type Frame = RgbImage;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flip {
    pub horizontal: bool,
    pub vertical: bool,
}

impl Flip {
    pub fn is_identity(self) -> bool {
        !self.horizontal && !self.vertical
    }

    pub fn apply(self, frame: &mut Frame) {
        if self.horizontal {
            imageops::flip_horizontal_in_place(frame);
        }
        if self.vertical {
            imageops::flip_vertical_in_place(frame);
        }
    }
}

/// Byte length of a tightly packed I420 image.
pub fn i420_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let chroma = w.div_ceil(2) * h.div_ceil(2);
    w * h + 2 * chroma
}

/// Converts a planar YUV 4:2:0 buffer (BT.601, limited range) to RGB.
pub fn i420_to_rgb(data: &[u8], width: u32, height: u32) -> Option<Frame> {
    if data.len() < i420_len(width, height) {
        return None;
    }
    let (w, h) = (width as usize, height as usize);
    let cw = w.div_ceil(2);
    let (y_plane, rest) = data.split_at(w * h);
    let (u_plane, v_plane) = rest.split_at(cw * h.div_ceil(2));

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let c = (row / 2) * cw + col / 2;
            let y = y_plane[row * w + col] as f32 - 16.0;
            let u = u_plane[c] as f32 - 128.0;
            let v = v_plane[c] as f32 - 128.0;
            let r = 1.164 * y + 1.596 * v;
            let g = 1.164 * y - 0.392 * u - 0.813 * v;
            let b = 1.164 * y + 2.017 * u;
            rgb.extend([clamp_u8(r), clamp_u8(g), clamp_u8(b)]);
        }
    }
    RgbImage::from_raw(width, height, rgb)
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Builds `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.<ext>`, adding `_N` when the
/// name is already taken.
pub fn timestamped_path(dir: &Path, prefix: &str, ext: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let base = format!("{prefix}_{stamp}");
    let mut path = dir.join(format!("{base}.{ext}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{base}_{n}.{ext}"));
        n += 1;
    }
    path
}
