use image::RgbImage;
use picam_detect::capture::CaptureSource;
use picam_detect::selftest::{probe, SelfTestReport, SelfTestTarget};
use picam_detect::{CameraBackend, Error, Frame};

struct CountingCamera {
    remaining: usize,
}

impl CaptureSource for CountingCamera {
    fn backend(&self) -> CameraBackend {
        CameraBackend::Usb
    }

    fn resolution(&self) -> (u32, u32) {
        (8, 6)
    }

    fn read_frame(&mut self) -> picam_detect::Result<Option<Frame>> {
        if self.remaining == 0 {
            return Err(Error::FrameRead("timeout".into()));
        }
        self.remaining -= 1;
        Ok(Some(RgbImage::new(8, 6)))
    }

    fn close(&mut self) {}
}

fn unopenable() -> picam_detect::Result<Box<dyn CaptureSource>> {
    Err(Error::CameraOpen {
        backend: "usb",
        reason: "no such device".into(),
    })
}

#[test]
fn unopenable_device_fails_with_nonzero_exit() {
    let report = SelfTestReport {
        backends: vec![probe(CameraBackend::Usb, 5, unopenable)],
    };
    assert!(!report.passed());
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.recommendation(), None);
    let text = report.to_string();
    assert!(text.contains("FAILED"));
    assert!(text.contains("no such device"));
}

#[test]
fn working_device_reads_all_frames() {
    let r = probe(CameraBackend::Usb, 5, || {
        Ok(Box::new(CountingCamera { remaining: 10 }))
    });
    assert!(r.passed());
    assert_eq!(r.resolution, Some((8, 6)));
    assert_eq!(r.frames.len(), 5);
    assert!(r.frames.iter().all(|f| f.size == Some((8, 6))));
}

#[test]
fn probe_stops_at_first_failed_read() {
    let r = probe(CameraBackend::Csi, 5, || {
        Ok(Box::new(CountingCamera { remaining: 2 }))
    });
    assert!(!r.passed());
    assert_eq!(r.frames.len(), 3);
    assert_eq!(r.frames[2].size, None);
    assert_eq!(r.error.as_deref(), Some("failed to read frame: timeout"));
}

#[test]
fn csi_is_recommended_over_usb() {
    let working = || -> picam_detect::Result<Box<dyn CaptureSource>> {
        Ok(Box::new(CountingCamera { remaining: 5 }))
    };
    let report = SelfTestReport {
        backends: vec![
            probe(CameraBackend::Csi, 3, working),
            probe(CameraBackend::Usb, 3, working),
        ],
    };
    assert_eq!(report.recommendation(), Some(CameraBackend::Csi));
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn usb_is_recommended_when_csi_fails() {
    let report = SelfTestReport {
        backends: vec![
            probe(CameraBackend::Csi, 3, unopenable),
            probe(CameraBackend::Usb, 3, || {
                Ok(Box::new(CountingCamera { remaining: 5 }))
            }),
        ],
    };
    assert!(report.passed());
    assert_eq!(report.recommendation(), Some(CameraBackend::Usb));
    assert!(report.to_string().contains("--backend usb"));
}

#[test]
fn targets_are_ordered_csi_first() {
    assert_eq!(
        SelfTestTarget::All.backends(),
        vec![CameraBackend::Csi, CameraBackend::Usb]
    );
    assert_eq!(SelfTestTarget::Usb.backends(), vec![CameraBackend::Usb]);
}

#[test]
fn zero_frames_never_passes() {
    let r = probe(CameraBackend::Usb, 0, || {
        Ok(Box::new(CountingCamera { remaining: 0 }))
    });
    assert!(r.frames.is_empty());
    assert!(!r.passed());
    let report = SelfTestReport { backends: vec![r] };
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.recommendation(), None);
}
