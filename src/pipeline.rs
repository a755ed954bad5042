//! The frame processing loop.
//!
//! [`ProcessingLoop`] pulls frames from a [`VideoStream`], runs a [`Detector`] on them, draws the
//! detected hands and an FPS counter, and shows the result in a [`Preview`] until the user quits.
//! Errors and panics while processing a single frame are logged and do not end the loop.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};

use anyhow::anyhow;

use crate::{
    hand::{draw_landmarks, Detector, DrawingSpec},
    image::{draw, ChannelOrder, Color, Image},
    timer::{FpsCounter, Timer},
    video::{Frame, VideoStream},
};

/// A key press or window event reported by a [`Preview`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    /// The preview window was closed by the user.
    Closed,
}

/// Displays processed frames and reports user input.
pub trait Preview {
    /// Displays `image`, replacing the previously shown one.
    fn show(&mut self, image: &Image) -> anyhow::Result<()>;

    /// Waits up to `timeout` for a key press.
    fn poll_key(&mut self, timeout: Duration) -> Option<Key>;

    /// Closes the preview.
    fn close(&mut self);
}

impl<P: Preview + ?Sized> Preview for &mut P {
    fn show(&mut self, image: &Image) -> anyhow::Result<()> {
        (**self).show(image)
    }

    fn poll_key(&mut self, timeout: Duration) -> Option<Key> {
        (**self).poll_key(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Options of a [`ProcessingLoop`].
#[derive(Debug, Clone)]
pub struct LoopOptions {
    mirror: bool,
    quit_key: char,
    landmark_spec: DrawingSpec,
    connection_spec: DrawingSpec,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            mirror: true,
            quit_key: 'q',
            landmark_spec: DrawingSpec::LANDMARKS,
            connection_spec: DrawingSpec::CONNECTIONS,
        }
    }
}

impl LoopOptions {
    /// Flips every frame horizontally before processing, so that the preview acts like a mirror.
    ///
    /// Enabled by default.
    pub fn mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    /// Sets the key that ends the loop. Defaults to `q`.
    pub fn quit_key(mut self, key: char) -> Self {
        self.quit_key = key;
        self
    }

    pub fn landmark_spec(mut self, spec: DrawingSpec) -> Self {
        self.landmark_spec = spec;
        self
    }

    pub fn connection_spec(mut self, spec: DrawingSpec) -> Self {
        self.connection_spec = spec;
        self
    }
}

/// Summary of a finished [`ProcessingLoop::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Number of frames taken from the stream.
    pub frames: u64,
    /// Number of frames whose processing failed.
    pub errors: u64,
}

const KEY_POLL_TIMEOUT: Duration = Duration::from_millis(1);

const FPS_POS: (i32, i32) = (10, 30);

pub struct ProcessingLoop<D, P> {
    detector: D,
    preview: P,
    options: LoopOptions,
    fps: FpsCounter,
    t_detect: Timer,
    t_draw: Timer,
    t_show: Timer,
}

impl<D: Detector, P: Preview> ProcessingLoop<D, P> {
    pub fn new(detector: D, preview: P) -> Self {
        Self {
            detector,
            preview,
            options: LoopOptions::default(),
            fps: FpsCounter::new("processing"),
            t_detect: Timer::new("detect"),
            t_draw: Timer::new("draw"),
            t_show: Timer::new("show"),
        }
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    /// Processes frames from `stream` until the quit key is pressed, the preview is closed, or the
    /// stream ends.
    ///
    /// The stream is stopped and the preview closed before this returns.
    pub fn run(mut self, stream: VideoStream) -> LoopStats {
        log::info!("starting main loop");
        let mut stats = LoopStats::default();

        loop {
            let Some(frame) = stream.read() else {
                log::warn!("video stream ended");
                break;
            };
            stats.frames += 1;

            if let Err(e) = self.process(frame) {
                log::error!("error processing frame: {e:#}");
                stats.errors += 1;
            }

            match self.preview.poll_key(KEY_POLL_TIMEOUT) {
                Some(Key::Char(c)) if c == self.options.quit_key => {
                    log::info!("quit key pressed");
                    break;
                }
                Some(Key::Closed) => {
                    log::info!("preview window closed");
                    break;
                }
                _ => {}
            }
        }

        stream.stop();
        self.preview.close();
        log::info!(
            "processed {} frames ({} failed)",
            stats.frames,
            stats.errors
        );
        stats
    }

    fn process(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.fps
            .tick_with([&self.t_detect, &self.t_draw, &self.t_show]);

        let mut image = frame.image;
        image.convert_order(self.detector.input_order());
        if self.options.mirror {
            image.flip_horizontal_in_place();
        }

        let detector = &mut self.detector;
        let hands = self
            .t_detect
            .time(|| catch_unwind(AssertUnwindSafe(|| detector.process(&image))))
            .map_err(|payload| anyhow!("detector panicked: {}", panic_message(&*payload)))??;

        self.t_draw.time(|| {
            image.convert_order(ChannelOrder::Rgb);
            for hand in &hands {
                draw_landmarks(
                    &mut image,
                    hand,
                    &self.options.landmark_spec,
                    &self.options.connection_spec,
                );
            }

            let fps = format!("FPS: {}", self.fps.fps() as u32);
            draw::text(&mut image, FPS_POS.0, FPS_POS.1, &fps)
                .color(Color::GREEN)
                .large()
                .align_baseline_left();
        });

        self.t_show.time(|| self.preview.show(&image))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use anyhow::bail;

    use crate::{
        hand::{Hand, Handedness, Landmark, LandmarkSet, NUM_LANDMARKS},
        image::Resolution,
        video::{CameraInfo, CameraSource},
    };

    use super::*;

    /// Produces copies of one image forever.
    struct Repeat {
        image: Image,
        released: Arc<AtomicBool>,
    }

    impl CameraSource for Repeat {
        fn read(&mut self) -> anyhow::Result<Image> {
            Ok(self.image.clone())
        }

        fn info(&self) -> CameraInfo {
            CameraInfo {
                name: "repeat".into(),
                resolution: self.image.resolution(),
                fps: None,
            }
        }
    }

    impl Drop for Repeat {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn stream(image: Image) -> (VideoStream, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let source = Repeat {
            image,
            released: released.clone(),
        };
        (VideoStream::start(source).unwrap(), released)
    }

    #[derive(Default)]
    struct FakePreview {
        shown: Vec<Image>,
        keys: VecDeque<Option<Key>>,
        closed: bool,
    }

    impl FakePreview {
        fn quit_after(polls: usize) -> Self {
            let mut keys = VecDeque::new();
            keys.extend((1..polls).map(|_| None));
            keys.push_back(Some(Key::Char('q')));
            Self {
                keys,
                ..Default::default()
            }
        }
    }

    impl Preview for FakePreview {
        fn show(&mut self, image: &Image) -> anyhow::Result<()> {
            self.shown.push(image.clone());
            Ok(())
        }

        fn poll_key(&mut self, _timeout: Duration) -> Option<Key> {
            // Quit once the script runs out, so a broken test cannot hang.
            self.keys.pop_front().unwrap_or(Some(Key::Char('q')))
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[derive(Default)]
    struct ScriptedDetector {
        calls: usize,
        fail_on: Vec<usize>,
        panic_on: Vec<usize>,
        order: ChannelOrder,
        result: LandmarkSet,
        seen: Vec<Image>,
    }

    impl Detector for ScriptedDetector {
        fn input_order(&self) -> ChannelOrder {
            self.order
        }

        fn process(&mut self, image: &Image) -> anyhow::Result<LandmarkSet> {
            let call = self.calls;
            self.calls += 1;
            self.seen.push(image.clone());
            if self.fail_on.contains(&call) {
                bail!("detector failure on call {call}");
            }
            if self.panic_on.contains(&call) {
                panic!("detector panic on call {call}");
            }
            Ok(self.result.clone())
        }
    }

    fn count(image: &Image, color: Color) -> usize {
        image.data().chunks(4).filter(|pix| *pix == color.0).count()
    }

    #[test]
    fn survives_failing_frames() {
        let (stream, released) = stream(Image::new(16, 16));
        let mut detector = ScriptedDetector {
            fail_on: vec![1],
            panic_on: vec![3],
            ..Default::default()
        };
        let mut preview = FakePreview::quit_after(6);

        let stats = ProcessingLoop::new(&mut detector, &mut preview).run(stream);

        assert_eq!(stats, LoopStats { frames: 6, errors: 2 });
        assert_eq!(detector.calls, 6);
        assert_eq!(preview.shown.len(), 4);
        assert!(preview.closed);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn quits_when_window_closed() {
        let (stream, _released) = stream(Image::new(16, 16));
        let mut preview = FakePreview {
            keys: [None, Some(Key::Char('x')), Some(Key::Closed)].into(),
            ..Default::default()
        };
        let stats = ProcessingLoop::new(crate::hand::NullDetector, &mut preview).run(stream);
        assert_eq!(stats.frames, 3);
        assert_eq!(preview.shown.len(), 3);
    }

    #[test]
    fn mirrors_and_converts_channel_order() {
        let mut image = Image::new(4, 1);
        image.set(0, 0, Color::RED);
        let (stream, _released) = stream(image);
        let mut detector = ScriptedDetector {
            order: ChannelOrder::Bgr,
            ..Default::default()
        };
        let mut preview = FakePreview::quit_after(1);

        ProcessingLoop::new(&mut detector, &mut preview).run(stream);

        let seen = &detector.seen[0];
        assert_eq!(seen.order(), ChannelOrder::Bgr);
        assert_eq!(seen.get(3, 0), Color::BLUE);
        assert_eq!(seen.get(0, 0), Color::NULL);

        let shown = &preview.shown[0];
        assert_eq!(shown.order(), ChannelOrder::Rgb);
        assert_eq!(shown.get(3, 0), Color::RED);
    }

    #[test]
    fn mirroring_can_be_disabled() {
        let mut image = Image::new(4, 1);
        image.set(0, 0, Color::RED);
        let (stream, _released) = stream(image);
        let mut preview = FakePreview::quit_after(1);

        ProcessingLoop::new(crate::hand::NullDetector, &mut preview)
            .with_options(LoopOptions::default().mirror(false))
            .run(stream);

        assert_eq!(preview.shown[0].get(0, 0), Color::RED);
    }

    /// Detects one hand with its landmarks spread over a 5x5 grid.
    fn grid_hand_detector() -> ScriptedDetector {
        let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
        for (i, lm) in landmarks.iter_mut().enumerate() {
            let (col, row) = (i % 5, i / 5);
            *lm = Landmark::new(0.1 + col as f32 * 0.2, 0.2 + row as f32 * 0.15, 0.0);
        }
        ScriptedDetector {
            result: [Hand::new(landmarks, Handedness::Left, 0.9)]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn draws_hands_and_fps() {
        let detector = grid_hand_detector();
        let (stream, _released) = stream(Image::new(200, 100));
        let mut preview = FakePreview::quit_after(1);

        ProcessingLoop::new(detector, &mut preview).run(stream);

        let shown = &preview.shown[0];
        assert_eq!(shown.resolution(), Resolution::new(200, 100));
        assert!(count(shown, DrawingSpec::LANDMARKS.color) > 0);
        assert!(count(shown, DrawingSpec::CONNECTIONS.color) > 0);
        // "FPS: 0" in the top left corner.
        assert!(count(shown, Color::GREEN) > 0);
        assert_eq!(shown.get(199, 0), Color::NULL);
    }

    #[test]
    fn draws_with_configured_styles() {
        let (stream, _released) = stream(Image::new(200, 100));
        let mut preview = FakePreview::quit_after(1);
        let options = LoopOptions::default()
            .landmark_spec(DrawingSpec::PLAIN_LANDMARKS)
            .connection_spec(DrawingSpec::PLAIN_CONNECTIONS);

        ProcessingLoop::new(grid_hand_detector(), &mut preview)
            .with_options(options)
            .run(stream);

        let shown = &preview.shown[0];
        assert!(count(shown, DrawingSpec::PLAIN_LANDMARKS.color) > 0);
        assert!(count(shown, DrawingSpec::PLAIN_CONNECTIONS.color) > 0);
        assert_eq!(count(shown, DrawingSpec::LANDMARKS.color), 0);
        assert_eq!(count(shown, DrawingSpec::CONNECTIONS.color), 0);
    }

    #[test]
    fn panic_messages() {
        let payload = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");
        let payload = catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 1");
    }
}
