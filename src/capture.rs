use crate::error::{Error, Result};
use crate::frame::{i420_len, i420_to_rgb, Frame};
use clap::ValueEnum;
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    Camera,
};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

/// Tools from the libcamera app suite that can stream raw frames to stdout.
const CSI_TOOLS: [&str; 2] = ["rpicam-vid", "libcamera-vid"];

#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// USB/V4L2 camera through the generic capture library
    #[default]
    Usb,
    /// Raspberry Pi CSI camera through libcamera
    Csi,
}

impl CameraBackend {
    pub fn name(self) -> &'static str {
        match self {
            CameraBackend::Usb => "usb",
            CameraBackend::Csi => "csi",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub device: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: 0,
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

pub trait CaptureSource {
    fn backend(&self) -> CameraBackend;

    fn resolution(&self) -> (u32, u32);

    /// Next frame, or `None` once the stream has ended.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Releases the device. Calling it twice is harmless.
    fn close(&mut self);
}

/// Opens the preferred backend, falling back once from CSI to USB.
pub fn open_capture(
    backend: CameraBackend,
    settings: &CaptureSettings,
) -> Result<Box<dyn CaptureSource>> {
    open_with_fallback(
        backend,
        || open_backend(CameraBackend::Csi, settings),
        || open_backend(CameraBackend::Usb, settings),
    )
}

/// Selection policy behind [`open_capture`]. `open_usb` runs at most once,
/// and `open_csi` only when `backend` is CSI.
pub fn open_with_fallback<C, U>(
    backend: CameraBackend,
    open_csi: C,
    open_usb: U,
) -> Result<Box<dyn CaptureSource>>
where
    C: FnOnce() -> Result<Box<dyn CaptureSource>>,
    U: FnOnce() -> Result<Box<dyn CaptureSource>>,
{
    if backend == CameraBackend::Csi {
        match open_csi() {
            Ok(cam) => return Ok(cam),
            Err(e) => {
                warn!("{e}");
                warn!("falling back to the usb camera");
            }
        }
    }
    open_usb()
}

/// Opens exactly one backend without fallback.
pub fn open_backend(
    backend: CameraBackend,
    settings: &CaptureSettings,
) -> Result<Box<dyn CaptureSource>> {
    match backend {
        CameraBackend::Csi => Ok(Box::new(CsiCamera::open(settings)?)),
        CameraBackend::Usb => Ok(Box::new(GenericCamera::open(settings)?)),
    }
}

pub struct GenericCamera {
    cam: Option<Camera>,
    resolution: (u32, u32),
}

impl GenericCamera {
    pub fn open(settings: &CaptureSettings) -> Result<Self> {
        let index = CameraIndex::Index(settings.device);
        let mut cam = None;
        for fmt in [FrameFormat::RAWRGB, FrameFormat::MJPEG, FrameFormat::YUYV] {
            let req = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                CameraFormat::new_from(settings.width, settings.height, fmt, settings.fps),
            ));
            match Camera::new(index.clone(), req) {
                Ok(c) => {
                    cam = Some(c);
                    break;
                }
                Err(e) => debug!(?fmt, "camera format rejected: {e}"),
            }
        }
        let fallback = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let mut cam = match cam {
            Some(c) => c,
            None => Camera::new(index, fallback).map_err(|e| open_error(CameraBackend::Usb, e))?,
        };
        cam.open_stream()
            .map_err(|e| open_error(CameraBackend::Usb, e))?;
        let res = cam.resolution();
        let resolution = (res.width(), res.height());
        info!(
            width = resolution.0,
            height = resolution.1,
            fps = cam.frame_rate(),
            "usb camera opened"
        );
        debug!(format = ?cam.camera_format(), "camera stream opened");
        Ok(Self {
            cam: Some(cam),
            resolution,
        })
    }
}

fn open_error(backend: CameraBackend, e: impl std::fmt::Display) -> Error {
    Error::CameraOpen {
        backend: backend.name(),
        reason: e.to_string(),
    }
}

impl CaptureSource for GenericCamera {
    fn backend(&self) -> CameraBackend {
        CameraBackend::Usb
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(cam) = self.cam.as_mut() else {
            return Ok(None);
        };
        let buffer = cam.frame().map_err(|e| Error::FrameRead(e.to_string()))?;
        let img = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| Error::FrameRead(e.to_string()))?;
        Ok(Some(img))
    }

    fn close(&mut self) {
        if let Some(mut cam) = self.cam.take() {
            if let Err(e) = cam.stop_stream() {
                warn!("failed to stop camera stream: {e}");
            }
            debug!("usb camera released");
        }
    }
}

impl Drop for GenericCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Finds the first libcamera streaming tool on `PATH`.
pub fn find_csi_tool() -> Option<PathBuf> {
    CSI_TOOLS.iter().find_map(|tool| which::which(tool).ok())
}

/// Rejects sizes whose I420 rows the libcamera apps would pad, since frames
/// are read back as tightly packed planes.
pub fn check_csi_resolution(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width % 64 != 0 || height % 2 != 0 {
        return Err(open_error(
            CameraBackend::Csi,
            format!("{width}x{height} unsupported, width must be a multiple of 64 and height even"),
        ));
    }
    Ok(())
}

/// Puts a helper process in its own process group so a Ctrl-C on the
/// terminal reaches only us, and the loop can stop it in order.
pub(crate) fn own_process_group(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// CSI camera streamed as raw I420 frames from a libcamera app.
pub struct CsiCamera {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    width: u32,
    height: u32,
    buf: Vec<u8>,
    pending: Option<Frame>,
}

impl CsiCamera {
    pub fn open(settings: &CaptureSettings) -> Result<Self> {
        check_csi_resolution(settings.width, settings.height)?;
        let tool = find_csi_tool().ok_or_else(|| Error::CameraOpen {
            backend: CameraBackend::Csi.name(),
            reason: format!("none of {CSI_TOOLS:?} found on PATH"),
        })?;
        let mut child = own_process_group(&mut Command::new(&tool))
            .args(["-t", "0", "-n", "--codec", "yuv420", "-o", "-"])
            .args(["--width", &settings.width.to_string()])
            .args(["--height", &settings.height.to_string()])
            .args(["--framerate", &settings.fps.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| open_error(CameraBackend::Csi, e))?;
        debug!(tool = %tool.display(), pid = child.id(), "libcamera started");
        let stdout = child.stdout.take();
        let mut cam = Self {
            child: Some(child),
            stdout,
            width: settings.width,
            height: settings.height,
            buf: vec![0; i420_len(settings.width, settings.height)],
            pending: None,
        };
        // The stream only counts as started once a frame has arrived.
        match cam.read_raw() {
            Ok(Some(frame)) => cam.pending = Some(frame),
            Ok(None) => {
                cam.close();
                return Err(open_error(CameraBackend::Csi, "stream ended before first frame"));
            }
            Err(e) => {
                cam.close();
                return Err(open_error(CameraBackend::Csi, e));
            }
        }
        info!(
            width = settings.width,
            height = settings.height,
            "csi camera opened"
        );
        Ok(cam)
    }

    fn read_raw(&mut self) -> Result<Option<Frame>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };
        match stdout.read_exact(&mut self.buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::FrameRead(e.to_string())),
        }
        i420_to_rgb(&self.buf, self.width, self.height)
            .map(Some)
            .ok_or_else(|| Error::FrameRead("short yuv420 frame".into()))
    }
}

impl CaptureSource for CsiCamera {
    fn backend(&self) -> CameraBackend {
        CameraBackend::Csi
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.read_raw()
    }

    fn close(&mut self) {
        self.stdout = None;
        self.pending = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("libcamera already exited: {e}");
            }
            match child.wait() {
                Ok(status) => debug!(%status, "csi camera stopped"),
                Err(e) => warn!("failed to reap libcamera: {e}"),
            }
        }
    }
}

impl Drop for CsiCamera {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names() {
        assert_eq!(CameraBackend::Usb.name(), "usb");
        assert_eq!(CameraBackend::Csi.name(), "csi");
        assert_eq!(CameraBackend::default(), CameraBackend::Usb);
    }

    #[test]
    fn default_capture_is_vga() {
        let s = CaptureSettings::default();
        assert_eq!((s.width, s.height, s.fps), (640, 480, 30));
    }

    #[test]
    fn csi_accepts_unpadded_sizes() {
        assert!(check_csi_resolution(640, 480).is_ok());
        assert!(check_csi_resolution(1280, 720).is_ok());
        assert!(check_csi_resolution(1920, 1080).is_ok());
    }

    #[test]
    fn csi_rejects_padded_or_odd_sizes() {
        for (w, h) in [(1000, 750), (800, 600), (640, 481), (0, 480)] {
            match check_csi_resolution(w, h) {
                Err(Error::CameraOpen { backend, reason }) => {
                    assert_eq!(backend, "csi");
                    assert!(reason.contains(&format!("{w}x{h}")));
                }
                other => panic!("{w}x{h} accepted: {other:?}"),
            }
        }
    }

    #[test]
    fn csi_open_rejects_size_before_spawning() {
        let settings = CaptureSettings {
            width: 1000,
            ..CaptureSettings::default()
        };
        let err = CsiCamera::open(&settings).err().unwrap();
        assert!(err.to_string().contains("multiple of 64"));
    }

    #[cfg(unix)]
    mod path_lookup {
        use super::super::find_csi_tool;
        use serial_test::serial;
        use std::ffi::OsString;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        struct PathGuard(Option<OsString>);

        impl PathGuard {
            fn set(dir: &Path) -> Self {
                let old = std::env::var_os("PATH");
                std::env::set_var("PATH", dir);
                PathGuard(old)
            }
        }

        impl Drop for PathGuard {
            fn drop(&mut self) {
                match self.0.take() {
                    Some(p) => std::env::set_var("PATH", p),
                    None => std::env::remove_var("PATH"),
                }
            }
        }

        fn write_tool(dir: &Path, name: &str, mode: u32) {
            let path = dir.join(name);
            fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        }

        #[test]
        #[serial]
        fn non_executable_tool_is_skipped() {
            let dir = tempfile::tempdir().unwrap();
            write_tool(dir.path(), "rpicam-vid", 0o644);
            let _path = PathGuard::set(dir.path());
            assert_eq!(find_csi_tool(), None);
        }

        #[test]
        #[serial]
        fn executable_tool_is_found_newest_name_first() {
            let dir = tempfile::tempdir().unwrap();
            write_tool(dir.path(), "libcamera-vid", 0o755);
            let _path = PathGuard::set(dir.path());
            assert_eq!(find_csi_tool(), Some(dir.path().join("libcamera-vid")));
            write_tool(dir.path(), "rpicam-vid", 0o755);
            assert_eq!(find_csi_tool(), Some(dir.path().join("rpicam-vid")));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[serial_test::serial]
    fn helper_runs_in_its_own_process_group() {
        let mut child = own_process_group(&mut Command::new("sleep"))
            .arg("5")
            .spawn()
            .unwrap();
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", child.id())).unwrap();
        // pid (comm) state ppid pgrp ...
        let after_comm = &stat[stat.rfind(')').unwrap() + 2..];
        let pgrp: u32 = after_comm.split(' ').nth(2).unwrap().parse().unwrap();
        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(pgrp, child.id());
    }
}
