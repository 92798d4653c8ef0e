use crate::ai::{Labels, YoloDetector};
use crate::annotate::Annotator;
use crate::capture::{open_capture, CameraBackend, CaptureSettings};
use crate::config::{config_path, load_settings, save_settings, Settings};
use crate::detect::{FrameLoop, LoopOptions, RunReport};
use crate::display::{Display, Headless};
use crate::error::{Error, Result};
use crate::frame::Flip;
use crate::record::VideoRecorder;
use crate::selftest::{host_summary, run_self_test, SelfTestTarget};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "picam-detect",
    version,
    about = "Real-time camera object detection for the Raspberry Pi"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run live detection on the camera
    Detect(DetectArgs),
    /// Check that the cameras deliver frames
    Selftest {
        /// Backends to try
        #[arg(long, value_enum, default_value_t)]
        backend: SelfTestTarget,
        /// Frames to read from each backend, at least 1
        #[arg(long, default_value_t = 5, value_parser = parse_frame_count)]
        frames: usize,
    },
    /// Inspect or create the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective settings as JSON
    Show,
    /// Write the default settings file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct DetectArgs {
    /// ONNX model path
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Class names, one per line
    #[arg(long)]
    pub labels: Option<PathBuf>,
    /// Confidence threshold 0-1
    #[arg(long, value_parser = parse_confidence)]
    pub conf: Option<f32>,
    /// Record the annotated stream to an MP4 file
    #[arg(long)]
    pub save: bool,
    /// Run time in seconds, 0 runs until stopped
    #[arg(long, default_value_t = 0)]
    pub duration: u64,
    /// Camera backend
    #[arg(long, value_enum)]
    pub backend: Option<CameraBackend>,
    /// Shorthand for `--backend csi`
    #[arg(long)]
    pub picamera: bool,
    /// Mirror frames horizontally
    #[arg(long)]
    pub flip_h: bool,
    /// Mirror frames vertically
    #[arg(long)]
    pub flip_v: bool,
    /// Hide the frame/FPS overlay
    #[arg(long)]
    pub no_fps: bool,
    /// Never open a preview window. Builds without the `preview` feature
    /// are always headless, so q/s keys need that feature.
    #[arg(long)]
    pub headless: bool,
    /// USB camera index
    #[arg(long)]
    pub device: Option<u32>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    #[arg(long)]
    pub fps: Option<u32>,
    /// TrueType font for the overlay text
    #[arg(long)]
    pub font: Option<PathBuf>,
}

fn parse_confidence(s: &str) -> std::result::Result<f32, String> {
    let v: f32 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("{v} is not in 0..=1"))
    }
}

fn parse_frame_count(s: &str) -> std::result::Result<usize, String> {
    match s.parse::<usize>().map_err(|e| format!("{e}"))? {
        0 => Err("at least one frame must be read".into()),
        n => Ok(n),
    }
}

impl DetectArgs {
    pub fn camera_backend(&self) -> CameraBackend {
        if self.picamera {
            CameraBackend::Csi
        } else {
            self.backend.unwrap_or_default()
        }
    }

    pub fn flip(&self) -> Flip {
        Flip {
            horizontal: self.flip_h,
            vertical: self.flip_v,
        }
    }

    pub fn duration_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }

    /// Overlays the flags given on the command line onto `settings`.
    pub fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(v) = &self.model {
            settings.model = v.clone();
        }
        if let Some(v) = &self.labels {
            settings.labels = Some(v.clone());
        }
        if let Some(v) = self.conf {
            settings.confidence = v;
        }
        if let Some(v) = self.device {
            settings.device = v;
        }
        if let Some(v) = self.width {
            settings.width = v;
        }
        if let Some(v) = self.height {
            settings.height = v;
        }
        if let Some(v) = self.fps {
            settings.fps = v;
        }
        if let Some(v) = &self.font {
            settings.font = Some(v.clone());
        }
        settings
    }
}

pub fn run_cli() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    ExitCode::from(execute(cli))
}

/// Runs one command and returns the process exit status.
pub fn execute(cli: Cli) -> u8 {
    match cli.command {
        Commands::Detect(args) => detect(args),
        Commands::Selftest { backend, frames } => selftest(backend, frames),
        Commands::Config { action } => match action {
            ConfigAction::Show => show_config(),
            ConfigAction::Init { force } => init_config(force),
        },
    }
}

fn detect(args: DetectArgs) -> u8 {
    match run_detect(&args) {
        Ok(report) => {
            println!("{report}");
            0
        }
        Err(e) => {
            error!("{e}");
            1
        }
    }
}

fn run_detect(args: &DetectArgs) -> Result<RunReport> {
    let settings = args.apply(load_settings());
    debug!(?settings, "effective settings");
    if !settings.model.exists() {
        return Err(Error::ModelNotFound(settings.model));
    }
    let labels = match &settings.labels {
        Some(path) => Labels::load(path)?,
        None => Labels::default(),
    };
    let detector = YoloDetector::load(&settings.model, labels, settings.iou)?;

    let capture_settings = CaptureSettings {
        device: settings.device,
        width: settings.width,
        height: settings.height,
        fps: settings.fps,
    };
    let capture = open_capture(args.camera_backend(), &capture_settings)?;
    let (width, height) = capture.resolution();

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        warn!("failed to install Ctrl-C handler: {e}");
    }

    let options = LoopOptions {
        confidence: settings.confidence,
        duration: args.duration_limit(),
        flip: args.flip(),
        show_fps: !args.no_fps,
        snapshot_dir: settings.snapshot_dir.clone(),
    };
    let mut frame_loop = FrameLoop::new(capture, Box::new(detector), options)
        .with_annotator(Annotator::load(settings.font.as_deref()))
        .with_display(make_display(args.headless)?)
        .with_stop_flag(stop);
    if args.save {
        let recorder = VideoRecorder::create(&settings.output_dir, width, height, settings.fps)?;
        frame_loop = frame_loop.with_recorder(recorder);
    }
    info!("{}", controls_hint(has_window(args.headless)));
    Ok(frame_loop.run())
}

fn has_window(headless: bool) -> bool {
    cfg!(feature = "preview") && !headless
}

fn controls_hint(window: bool) -> &'static str {
    if window {
        "press q to stop, s to save a snapshot, Ctrl-C to interrupt"
    } else {
        "running headless, stop with Ctrl-C or --duration"
    }
}

#[cfg(feature = "preview")]
fn make_display(headless: bool) -> Result<Box<dyn Display>> {
    if headless {
        return Ok(Box::new(Headless));
    }
    Ok(Box::new(crate::display::PreviewWindow::new("picam-detect")?))
}

#[cfg(not(feature = "preview"))]
fn make_display(headless: bool) -> Result<Box<dyn Display>> {
    if !headless {
        info!("built without the preview feature, running headless");
    }
    Ok(Box::new(Headless))
}

fn selftest(target: SelfTestTarget, frames: usize) -> u8 {
    let settings = load_settings();
    let capture_settings = CaptureSettings {
        device: settings.device,
        width: settings.width,
        height: settings.height,
        fps: settings.fps,
    };
    println!("host: {}", host_summary());
    println!();
    let report = run_self_test(target, &capture_settings, frames);
    println!("{report}");
    report.exit_code()
}

fn show_config() -> u8 {
    match serde_json::to_string_pretty(&load_settings()) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            error!("failed to encode settings: {e}");
            1
        }
    }
}

fn init_config(force: bool) -> u8 {
    let path = config_path();
    if path.exists() && !force {
        error!("{} already exists, pass --force to overwrite", path.display());
        return 1;
    }
    match save_settings(&Settings::default()) {
        Ok(path) => {
            info!(path = %path.display(), "settings written");
            0
        }
        Err(e) => {
            error!("failed to write settings: {e}");
            1
        }
    }
}
