//! Camera access and frame buffering.
//!
//! - [`CameraSource`] abstracts over devices that produce [`Image`]s: V4L2 [`webcam::Webcam`]s and
//!   HTTP MJPEG streams ([`httpcam::HttpStream`]) such as the one served by the DroidCam app.
//! - [`locate`] probes camera indices until one yields a frame.
//! - [`VideoStream`] runs a camera on a background thread and buffers the freshest frames.

pub mod httpcam;
mod locator;
mod stream;
pub mod webcam;

use std::{fmt, time::Instant};

use crate::image::{Image, Resolution};

pub use locator::*;
pub use stream::*;

/// A device that produces camera images.
pub trait CameraSource: Send {
    /// Reads the next raw frame from the device.
    ///
    /// This may block until the device delivers a frame, but has to give up with an error after a
    /// bounded time: [`VideoStream::stop`] waits for an in-progress read to return. An error means
    /// that this particular read failed; the device may still deliver frames on later calls.
    fn read(&mut self) -> anyhow::Result<Image>;

    /// Returns a description of the opened device and its negotiated format.
    fn info(&self) -> CameraInfo;
}

impl<C: CameraSource + ?Sized> CameraSource for Box<C> {
    fn read(&mut self) -> anyhow::Result<Image> {
        (**self).read()
    }

    fn info(&self) -> CameraInfo {
        (**self).info()
    }
}

/// Describes an opened camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraInfo {
    pub name: String,
    pub resolution: Resolution,
    /// Frame rate reported by the device, if it reports one.
    pub fps: Option<f32>,
}

impl fmt::Display for CameraInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.name, self.resolution)?;
        match self.fps {
            Some(fps) => write!(f, " @ {fps:.1}Hz"),
            None => Ok(()),
        }
    }
}

/// A camera image captured by a [`VideoStream`].
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Image,
    /// Number of frames the stream had captured before this one.
    ///
    /// Sequence numbers are assigned to every successfully read frame, including frames that are
    /// later evicted from the buffer, so gaps indicate dropped frames.
    pub sequence: u64,
    pub captured_at: Instant,
}
