use crate::ai::Detector;
use crate::annotate::{status_line, Annotator};
use crate::capture::CaptureSource;
use crate::display::{Display, Headless, KeyAction};
use crate::frame::Flip;
use crate::record::{save_snapshot, VideoRecorder};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunStatistics {
    pub frames: u64,
    pub detections: u64,
    pub elapsed: Duration,
}

impl RunStatistics {
    pub fn record(&mut self, detections: usize) {
        self.frames += 1;
        self.detections += detections as u64;
    }

    pub fn average_detections(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.detections as f64 / self.frames as f64
        }
    }

    pub fn average_fps(&self) -> f64 {
        fps(self.frames, self.elapsed)
    }
}

fn fps(frames: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        frames as f64 / secs
    } else {
        0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    UserQuit,
    DurationElapsed,
    EndOfStream,
    ReadFailed,
    Interrupted,
    DetectionFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::UserQuit => "stopped by user",
            StopReason::DurationElapsed => "duration reached",
            StopReason::EndOfStream => "camera stream ended",
            StopReason::ReadFailed => "frame read failed",
            StopReason::Interrupted => "interrupted",
            StopReason::DetectionFailed => "detection failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct LoopOptions {
    pub confidence: f32,
    /// `None` runs until another stop condition.
    pub duration: Option<Duration>,
    pub flip: Flip,
    pub show_fps: bool,
    pub snapshot_dir: PathBuf,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            duration: None,
            flip: Flip::default(),
            show_fps: true,
            snapshot_dir: PathBuf::from("runs/screenshots"),
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub stats: RunStatistics,
    pub reason: StopReason,
    pub video: Option<PathBuf>,
    pub snapshots: Vec<PathBuf>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(50);
        writeln!(f, "{rule}")?;
        writeln!(f, "[stats] {}", self.reason)?;
        writeln!(f, "  frames:                 {}", self.stats.frames)?;
        writeln!(f, "  total detections:       {}", self.stats.detections)?;
        writeln!(
            f,
            "  avg detections/frame:   {:.2}",
            self.stats.average_detections()
        )?;
        writeln!(f, "  avg FPS:                {:.1}", self.stats.average_fps())?;
        writeln!(
            f,
            "  elapsed:                {:.1}s",
            self.stats.elapsed.as_secs_f64()
        )?;
        if let Some(video) = &self.video {
            writeln!(f, "  video:                  {}", video.display())?;
        }
        write!(f, "{rule}")
    }
}

/// Capture → flip → detect → annotate → display/record, until stopped.
pub struct FrameLoop {
    capture: Box<dyn CaptureSource>,
    detector: Box<dyn Detector>,
    display: Box<dyn Display>,
    recorder: Option<VideoRecorder>,
    annotator: Annotator,
    stop: Arc<AtomicBool>,
    options: LoopOptions,
}

impl FrameLoop {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        detector: Box<dyn Detector>,
        options: LoopOptions,
    ) -> Self {
        Self {
            capture,
            detector,
            display: Box::new(Headless),
            recorder: None,
            annotator: Annotator::without_text(),
            stop: Arc::new(AtomicBool::new(false)),
            options,
        }
    }

    pub fn with_display(mut self, display: Box<dyn Display>) -> Self {
        self.display = display;
        self
    }

    pub fn with_recorder(mut self, recorder: VideoRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    /// Flag polled once per frame; setting it ends the run.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn run(mut self) -> RunReport {
        let video = self.recorder.as_ref().map(|r| r.path().to_path_buf());
        let mut stats = RunStatistics::default();
        let mut snapshots = Vec::new();
        let start = Instant::now();
        info!(
            backend = self.capture.backend().name(),
            confidence = self.options.confidence,
            "detection started"
        );

        let reason = self.iterate(start, &mut stats, &mut snapshots);
        stats.elapsed = start.elapsed();
        info!(%reason, frames = stats.frames, "detection stopped");

        self.shutdown();
        RunReport {
            stats,
            reason,
            video,
            snapshots,
        }
    }

    fn iterate(
        &mut self,
        start: Instant,
        stats: &mut RunStatistics,
        snapshots: &mut Vec<PathBuf>,
    ) -> StopReason {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return StopReason::Interrupted;
            }
            let mut frame = match self.capture.read_frame() {
                Ok(Some(f)) => f,
                Ok(None) => return StopReason::EndOfStream,
                Err(e) => {
                    warn!("{e}");
                    return StopReason::ReadFailed;
                }
            };
            self.options.flip.apply(&mut frame);

            let detections = match self.detector.detect(&frame, self.options.confidence) {
                Ok(d) => d,
                Err(e) => {
                    error!("{e}");
                    return StopReason::DetectionFailed;
                }
            };
            stats.record(detections.len());
            trace!(frame = stats.frames, detections = detections.len(), "frame processed");

            self.annotator.draw_detections(&mut frame, &detections);
            if self.options.show_fps {
                let current = fps(stats.frames, start.elapsed());
                let line = status_line(stats.frames, detections.len(), current);
                self.annotator.draw_status(&mut frame, &line);
            }

            let key = match self.display.show(&frame) {
                Ok(k) => k,
                Err(e) => {
                    warn!("failed to show frame: {e}");
                    None
                }
            };

            let write_err = self.recorder.as_mut().and_then(|r| r.write(&frame).err());
            if let Some(e) = write_err {
                error!("{e}, recording stopped");
                if let Some(mut r) = self.recorder.take() {
                    if let Err(e) = r.finish() {
                        warn!("{e}");
                    }
                }
            }

            match key {
                Some(KeyAction::Quit) => return StopReason::UserQuit,
                Some(KeyAction::Snapshot) => {
                    match save_snapshot(&self.options.snapshot_dir, &frame) {
                        Ok(path) => {
                            info!(path = %path.display(), "snapshot saved");
                            snapshots.push(path);
                        }
                        Err(e) => error!("failed to save snapshot: {e}"),
                    }
                }
                None => {}
            }

            if let Some(limit) = self.options.duration {
                if start.elapsed() >= limit {
                    return StopReason::DurationElapsed;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.capture.close();
        if let Some(mut recorder) = self.recorder.take() {
            debug!(frames = recorder.frames(), "finalising video");
            if let Err(e) = recorder.finish() {
                error!("{e}");
            }
        }
        self.display.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_is_zero_without_frames() {
        let stats = RunStatistics::default();
        assert_eq!(stats.average_detections(), 0.0);
        assert_eq!(stats.average_fps(), 0.0);
    }

    #[test]
    fn average_divides_total_by_frames() {
        let mut stats = RunStatistics::default();
        stats.record(3);
        stats.record(0);
        stats.record(4);
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.detections, 7);
        assert!((stats.average_detections() - 7.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn report_lists_video_only_when_recording() {
        let mut report = RunReport {
            stats: RunStatistics {
                frames: 4,
                detections: 2,
                elapsed: Duration::from_secs(2),
            },
            reason: StopReason::UserQuit,
            video: None,
            snapshots: Vec::new(),
        };
        let text = report.to_string();
        assert!(text.contains("avg detections/frame:   0.50"));
        assert!(text.contains("avg FPS:                2.0"));
        assert!(!text.contains("video:"));
        report.video = Some(PathBuf::from("runs/out.mp4"));
        assert!(report.to_string().contains("runs/out.mp4"));
    }
}
