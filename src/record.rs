use crate::capture::own_process_group;
use crate::error::{Error, Result};
use crate::frame::{timestamped_path, Frame};
use image::{imageops, ImageFormat};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info, warn};

/// MP4 writer backed by an `ffmpeg` child fed raw RGB frames on stdin.
pub struct VideoRecorder {
    path: PathBuf,
    width: u32,
    height: u32,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    frames: u64,
}

impl VideoRecorder {
    pub fn create(dir: &Path, width: u32, height: u32, fps: u32) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = timestamped_path(dir, "camera_detected", "mp4");
        let size = format!("{width}x{height}");
        let rate = fps.max(1).to_string();
        let mut child = own_process_group(&mut Command::new("ffmpeg"))
            .args(["-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &size, "-r", &rate])
            .args(["-i", "pipe:0"])
            .args(["-c:v", "mpeg4", "-q:v", "5", "-pix_fmt", "yuv420p"])
            .arg(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Recorder(format!("failed to spawn ffmpeg: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Recorder("ffmpeg stdin unavailable".into()))?;
        info!(path = %path.display(), "recording video");
        Ok(Self {
            path,
            width,
            height,
            child: Some(child),
            stdin: Some(BufWriter::new(stdin)),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(Error::Recorder("recorder already finished".into()));
        };
        if frame.dimensions() == (self.width, self.height) {
            stdin.write_all(frame.as_raw())?;
        } else {
            let resized = imageops::resize(
                frame,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );
            stdin.write_all(resized.as_raw())?;
        }
        self.frames += 1;
        Ok(())
    }

    /// Closes the pipe and waits for ffmpeg to finalise the file.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.flush() {
                warn!("failed to flush video pipe: {e}");
            }
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        debug!(frames = self.frames, %status, "ffmpeg exited");
        if status.success() {
            Ok(())
        } else {
            Err(Error::Recorder(format!("ffmpeg exited with {status}")))
        }
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("{e}");
        }
    }
}

/// Writes `frame` as `<dir>/screenshot_<timestamp>.jpg`.
pub fn save_snapshot(dir: &Path, frame: &Frame) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = timestamped_path(dir, "screenshot", "jpg");
    frame.save_with_format(&path, ImageFormat::Jpeg)?;
    Ok(path)
}
