use serde::{Deserialize, Serialize};
use std::{env, fs, io, path::PathBuf};
use tracing::{debug, warn};

/// Persisted defaults for every `detect` and `selftest` flag.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub model: PathBuf,
    pub labels: Option<PathBuf>,
    pub confidence: f32,
    pub iou: f32,
    pub device: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub output_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub font: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: PathBuf::from("best.onnx"),
            labels: None,
            confidence: 0.25,
            iou: 0.45,
            device: 0,
            width: 640,
            height: 480,
            fps: 30,
            output_dir: PathBuf::from("runs/detect_camera"),
            snapshot_dir: PathBuf::from("runs/screenshots"),
            font: None,
        }
    }
}

pub fn config_path() -> PathBuf {
    env::var_os("PICAM_DETECT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("picam-detect.json"))
}

pub fn load_settings() -> Settings {
    let path = config_path();
    match fs::read(&path) {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(settings) => {
                debug!(path = %path.display(), "loaded settings");
                settings
            }
            Err(e) => {
                warn!("ignoring invalid settings in {}: {e}", path.display());
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

pub fn save_settings(settings: &Settings) -> io::Result<PathBuf> {
    let path = config_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(settings)?;
    fs::write(&path, data)?;
    Ok(path)
}
