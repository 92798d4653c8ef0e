use crate::capture::{open_backend, CameraBackend, CaptureSettings, CaptureSource};
use crate::error::Result;
use clap::ValueEnum;
use std::fmt;
use sysinfo::System;
use tracing::{info, warn};

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelfTestTarget {
    /// CSI first, then USB
    #[default]
    All,
    Csi,
    Usb,
}

impl SelfTestTarget {
    pub fn backends(self) -> Vec<CameraBackend> {
        match self {
            SelfTestTarget::All => vec![CameraBackend::Csi, CameraBackend::Usb],
            SelfTestTarget::Csi => vec![CameraBackend::Csi],
            SelfTestTarget::Usb => vec![CameraBackend::Usb],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameProbe {
    pub index: usize,
    /// Frame size, `None` when the read failed.
    pub size: Option<(u32, u32)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendReport {
    pub backend: CameraBackend,
    pub requested: usize,
    pub resolution: Option<(u32, u32)>,
    pub frames: Vec<FrameProbe>,
    pub error: Option<String>,
}

impl BackendReport {
    /// True once at least one frame was read and every requested read worked.
    pub fn passed(&self) -> bool {
        self.error.is_none()
            && self.resolution.is_some()
            && !self.frames.is_empty()
            && self.frames.len() == self.requested
            && self.frames.iter().all(|f| f.size.is_some())
    }
}

/// Opens one backend and reads `frames` frames, stopping at the first failure.
pub fn probe<F>(backend: CameraBackend, frames: usize, open: F) -> BackendReport
where
    F: FnOnce() -> Result<Box<dyn CaptureSource>>,
{
    let mut report = BackendReport {
        backend,
        requested: frames,
        resolution: None,
        frames: Vec::with_capacity(frames),
        error: None,
    };
    let mut cam = match open() {
        Ok(c) => c,
        Err(e) => {
            warn!(backend = backend.name(), "{e}");
            report.error = Some(e.to_string());
            return report;
        }
    };
    report.resolution = Some(cam.resolution());
    for index in 1..=frames {
        match cam.read_frame() {
            Ok(Some(frame)) => report.frames.push(FrameProbe {
                index,
                size: Some(frame.dimensions()),
            }),
            Ok(None) => {
                report.frames.push(FrameProbe { index, size: None });
                report.error = Some("stream ended".into());
                break;
            }
            Err(e) => {
                report.frames.push(FrameProbe { index, size: None });
                report.error = Some(e.to_string());
                break;
            }
        }
    }
    cam.close();
    info!(backend = backend.name(), passed = report.passed(), "self-test finished");
    report
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelfTestReport {
    pub backends: Vec<BackendReport>,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        self.backends.iter().any(BackendReport::passed)
    }

    /// CSI wins over USB when both work.
    pub fn recommendation(&self) -> Option<CameraBackend> {
        [CameraBackend::Csi, CameraBackend::Usb]
            .into_iter()
            .find(|b| self.backends.iter().any(|r| r.backend == *b && r.passed()))
    }

    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

pub fn run_self_test(
    target: SelfTestTarget,
    settings: &CaptureSettings,
    frames: usize,
) -> SelfTestReport {
    let backends = target
        .backends()
        .into_iter()
        .map(|b| probe(b, frames, || open_backend(b, settings)))
        .collect();
    SelfTestReport { backends }
}

impl fmt::Display for SelfTestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.backends {
            writeln!(f, "[{}]", r.backend.name())?;
            if let Some((w, h)) = r.resolution {
                writeln!(f, "  resolution: {w}x{h}")?;
            }
            for p in &r.frames {
                match p.size {
                    Some((w, h)) => writeln!(f, "  frame {}: ok ({w}x{h})", p.index)?,
                    None => writeln!(f, "  frame {}: read failed", p.index)?,
                }
            }
            if let Some(e) = &r.error {
                writeln!(f, "  error: {e}")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "{}", "-".repeat(50))?;
        for r in &self.backends {
            let status = if r.passed() { "OK" } else { "FAILED" };
            writeln!(f, "  {:<6} {status}", r.backend.name())?;
        }
        writeln!(f)?;
        match self.recommendation() {
            Some(CameraBackend::Csi) => write!(f, "use --backend csi (libcamera)"),
            Some(CameraBackend::Usb) => write!(f, "use --backend usb"),
            None => {
                writeln!(f, "no camera could be read, check:")?;
                writeln!(f, "  1. the camera cable or USB plug is seated")?;
                writeln!(f, "  2. the camera is enabled and not used by another program")?;
                write!(f, "  3. `rpicam-hello --list-cameras` lists the sensor")
            }
        }
    }
}

/// One-line description of the host for diagnostics.
pub fn host_summary() -> String {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_all();
    format!(
        "{} {} | {} cpus | {} MiB memory",
        System::name().unwrap_or_else(|| "unknown".into()),
        System::os_version().unwrap_or_default(),
        sys.cpus().len(),
        sys.total_memory() / (1024 * 1024)
    )
}
