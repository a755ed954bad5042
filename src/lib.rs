//! Live hand landmark preview for webcams and phone cameras.
//!
//! The crate is built around [`video::VideoStream`], a small frame buffer that decouples camera
//! capture from the (much slower) detection and display loop in [`pipeline`]. The buffer holds at
//! most 2 frames and evicts the oldest one whenever a new frame arrives, so the processing loop
//! always works on one of the two most recent captures instead of a growing backlog.
//!
//! Hand detection itself is abstracted behind [`hand::Detector`]. [`hand::LandmarkNetwork`] runs a
//! MediaPipe-style hand landmark model through `tract`; [`hand::NullDetector`] does nothing and is
//! used when no model is configured.
//!
//! # Environment Variables
//!
//! * `HANDCAM_WEBCAM_NAME`: Forces the device to use for [`Webcam`]s opened without an explicit
//!   device index or name. If unset, the first device that supports a compatible image format will
//!   be used.
//! * `HANDCAM_JPEG_BACKEND`: Configures the JPEG decoder to use. Allowed values are:
//!   * `image`: uses the [image] crate (default).
//!   * `zune-jpeg`: uses the [zune-jpeg] crate.
//! * `HANDCAM_HAND_MODEL`: Path to a hand landmark `.onnx` model. If unset, the binaries fall back
//!   to [`hand::NullDetector`] and only show the camera image.
//! * `HANDCAM_DROIDCAM_ADDR`: `ip:port` of a DroidCam server. When set, `droidcam_hands` connects
//!   over HTTP instead of probing local camera indices.
//!
//! [image]: https://github.com/image-rs/image
//! [zune-jpeg]: https://github.com/etemesi254/zune-jpeg
//! [`Webcam`]: video::webcam::Webcam

use log::LevelFilter;

pub mod gui;
pub mod hand;
pub mod image;
pub mod pipeline;
pub mod termination;
pub mod timer;
pub mod video;

pub use gui::run;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_CRATE_NAME")), log_level)
        .filter(Some("wgpu"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and `handcam` will log at *trace*
/// level. Otherwise, they will log at *debug* level.
///
/// `wgpu` will always log at *warn* level. `RUST_LOG` is applied on top of these defaults.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
