//! Live hand landmark preview for the local webcam at `/dev/video0`.
//!
//! Set `HANDCAM_HAND_MODEL` to a hand landmark `.onnx` model to enable detection. Press `q` in the
//! preview window to quit.

use handcam::{
    gui,
    hand::{Detector, DrawingSpec, HandsOptions, LandmarkNetwork, NullDetector},
    image::Resolution,
    pipeline::{LoopOptions, ProcessingLoop},
    video::{
        webcam::{Webcam, WebcamOptions},
        VideoStream,
    },
};

const WINDOW_TITLE: &str = "Hand Recognition";

fn main() {
    handcam::init_logger!();
    handcam::run(run);
}

fn run() -> anyhow::Result<()> {
    let options = WebcamOptions::default()
        .resolution(Resolution::RES_720P)
        .fps(60)
        .buffers(1);
    let webcam = Webcam::open_index(0, options)?;
    let stream = VideoStream::start(webcam)?;

    let hands = HandsOptions::default().min_tracking_confidence(0.7);
    let detector: Box<dyn Detector> = match LandmarkNetwork::from_env(hands)? {
        Some(network) => Box::new(network),
        None => {
            log::warn!("no hand model configured, showing the camera image only");
            Box::new(NullDetector)
        }
    };

    let options = LoopOptions::default()
        .landmark_spec(DrawingSpec::PLAIN_LANDMARKS)
        .connection_spec(DrawingSpec::PLAIN_CONNECTIONS);
    let stats = ProcessingLoop::new(detector, gui::Window::new(WINDOW_TITLE))
        .with_options(options)
        .run(stream);
    log::debug!("{stats:?}");

    gui::destroy_all_windows().ok();
    Ok(())
}
