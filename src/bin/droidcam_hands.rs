//! Hand landmark preview for a remote DroidCam phone camera, falling back to the first working
//! local camera.
//!
//! The DroidCam address is taken from `HANDCAM_DROIDCAM_ADDR` or the first argument (`ip` or
//! `ip:port`). Without one, camera indices 0 through 9 are probed.

use std::{thread, time::Duration};

use anyhow::bail;
use handcam::{
    gui,
    hand::{Detector, HandsOptions, LandmarkNetwork, NullDetector},
    image::Resolution,
    pipeline::ProcessingLoop,
    video::{
        httpcam::{self, HttpStream},
        locate,
        webcam::{Webcam, WebcamOptions},
        CameraSource, VideoStream,
    },
};

const WINDOW_TITLE: &str = "Hand Recognition (Optimized)";

const WARM_UP: Duration = Duration::from_secs(1);

fn main() {
    handcam::init_logger!();
    handcam::run(run);
}

fn open_camera() -> anyhow::Result<Box<dyn CameraSource>> {
    let addr = std::env::var("HANDCAM_DROIDCAM_ADDR")
        .ok()
        .or_else(|| std::env::args().nth(1));
    if let Some(addr) = addr {
        let addr = httpcam::parse_addr(&addr)?;
        return Ok(Box::new(HttpStream::connect(addr)?));
    }

    let Some(index) = locate(|index| Webcam::open_index(index, WebcamOptions::default())) else {
        bail!("could not find any working camera");
    };
    let options = WebcamOptions::default()
        .resolution(Resolution::RES_720P)
        .fps(60)
        .buffers(1);
    Ok(Box::new(Webcam::open_index(index, options)?))
}

fn run() -> anyhow::Result<()> {
    let camera = open_camera()?;
    let stream = VideoStream::start(camera)?;
    thread::sleep(WARM_UP);

    let hands = HandsOptions::default().min_tracking_confidence(0.5);
    let detector: Box<dyn Detector> = match LandmarkNetwork::from_env(hands)? {
        Some(network) => Box::new(network),
        None => Box::new(NullDetector),
    };

    let stats = ProcessingLoop::new(detector, gui::Window::new(WINDOW_TITLE)).run(stream);
    log::debug!("{stats:?}");

    gui::destroy_all_windows().ok();
    Ok(())
}
