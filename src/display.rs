use crate::error::Result;
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAction {
    Quit,
    Snapshot,
}

impl KeyAction {
    pub fn from_key(key: i32) -> Option<Self> {
        match u8::try_from(key & 0xff).ok().map(char::from) {
            Some('q') | Some('Q') => Some(KeyAction::Quit),
            Some('s') | Some('S') => Some(KeyAction::Snapshot),
            _ => None,
        }
    }
}

pub trait Display {
    /// Presents `frame` and returns the key action pressed meanwhile.
    fn show(&mut self, frame: &Frame) -> Result<Option<KeyAction>>;

    fn close(&mut self);
}

/// No window; stopping relies on Ctrl-C or the duration limit.
#[derive(Debug, Default)]
pub struct Headless;

impl Display for Headless {
    fn show(&mut self, _frame: &Frame) -> Result<Option<KeyAction>> {
        Ok(None)
    }

    fn close(&mut self) {}
}

#[cfg(feature = "preview")]
pub use window::PreviewWindow;

#[cfg(feature = "preview")]
mod window {
    use super::{Display, KeyAction};
    use crate::error::Result;
    use crate::frame::Frame;
    use opencv::{core::Mat, highgui, imgproc, prelude::*};
    use tracing::{debug, warn};

    pub struct PreviewWindow {
        name: String,
        open: bool,
    }

    impl PreviewWindow {
        pub fn new(name: &str) -> Result<Self> {
            highgui::named_window(name, highgui::WINDOW_AUTOSIZE)?;
            debug!(window = name, "preview window created");
            Ok(Self {
                name: name.to_string(),
                open: true,
            })
        }
    }

    impl Display for PreviewWindow {
        fn show(&mut self, frame: &Frame) -> Result<Option<KeyAction>> {
            let rgb = Mat::from_slice(frame.as_raw())?
                .reshape(3, frame.height() as i32)?
                .try_clone()?;
            let mut bgr = Mat::default();
            imgproc::cvt_color_def(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR)?;
            highgui::imshow(&self.name, &bgr)?;
            let key = highgui::wait_key(1)?;
            Ok(KeyAction::from_key(key))
        }

        fn close(&mut self) {
            if std::mem::take(&mut self.open) {
                if let Err(e) = highgui::destroy_all_windows() {
                    warn!("failed to close preview window: {e}");
                }
            }
        }
    }

    impl Drop for PreviewWindow {
        fn drop(&mut self) {
            self.close();
        }
    }
}
