//! Data Logging
//!
//! Stores received samples, persists them as capture files and plays
//! them back.

mod format;
mod playback;
mod store;
mod window;

pub use format::{
    default_capture_path, encode_capture, parse_capture, read_capture, write_capture, write_csv,
    Capture, CaptureError, CaptureHeader, CaptureWarning, LoadReport, LogFormat, CAPTURE_MAGIC,
    CAPTURE_VERSION,
};
pub use playback::{scaled_delay, ReplayEngine, ReplayError, ReplayStatus, MAX_SPEED, MIN_SPEED};
pub use store::DataStore;
pub use window::{
    rescale_mark, scale_max, window_range, Viewport, DEFAULT_WINDOW_SIZE, SCROLL_STEP,
};
