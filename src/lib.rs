pub mod ai;
pub mod annotate;
pub mod capture;
pub mod cli;
pub mod config;
pub mod detect;
pub mod display;
pub mod error;
pub mod frame;
pub mod record;
pub mod selftest;

pub use ai::{BoundingBox, Detection, Detector, Labels, YoloDetector};
pub use capture::{open_capture, open_with_fallback, CameraBackend, CaptureSettings, CaptureSource};
pub use cli::{execute, run_cli, Cli, Commands, ConfigAction, DetectArgs};
pub use config::{load_settings, Settings};
pub use detect::{FrameLoop, LoopOptions, RunReport, RunStatistics, StopReason};
pub use display::{Display, Headless, KeyAction};
pub use error::{Error, Result};
pub use frame::{Flip, Frame};
pub use selftest::{probe, SelfTestReport, SelfTestTarget};
