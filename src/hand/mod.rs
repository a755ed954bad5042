//! Hand landmark data, detectors and rendering.
//!
//! A [`Detector`] turns an [`Image`] into a [`LandmarkSet`]: zero or more [`Hand`]s with 21
//! landmarks each, positioned relative to the image size. [`draw_landmarks`] renders a hand
//! together with the [`CONNECTIONS`] between its landmarks.

mod draw;
mod network;

use std::fmt;

use crate::image::{ChannelOrder, Image, Rect, Resolution};

pub use draw::*;
pub use network::*;

/// Number of landmarks predicted for every hand.
pub const NUM_LANDMARKS: usize = 21;

/// A single landmark position.
///
/// `x` and `y` are normalized to the image size: `(0, 0)` is the top left corner, `(1, 1)` the
/// bottom right corner. `z` is the depth relative to the wrist, using roughly the same scale as `x`
/// (smaller values are closer to the camera).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Returns whether the landmark lies within the image.
    pub fn is_visible(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }

    /// Converts the normalized position to pixel coordinates in an image of size `res`.
    pub fn to_pixel(&self, res: Resolution) -> [f32; 2] {
        [self.x * res.width() as f32, self.y * res.height() as f32]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
}

impl fmt::Display for Handedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Handedness::Left => "left",
            Handedness::Right => "right",
        })
    }
}

/// A hand found in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Hand {
    landmarks: [Landmark; NUM_LANDMARKS],
    handedness: Handedness,
    score: f32,
}

impl Hand {
    pub fn new(landmarks: [Landmark; NUM_LANDMARKS], handedness: Handedness, score: f32) -> Self {
        Self {
            landmarks,
            handedness,
            score,
        }
    }

    /// Returns all landmarks, in [`LandmarkIdx`] order.
    pub fn landmarks(&self) -> &[Landmark; NUM_LANDMARKS] {
        &self.landmarks
    }

    pub fn landmark(&self, idx: LandmarkIdx) -> Landmark {
        self.landmarks[idx as usize]
    }

    pub fn handedness(&self) -> Handedness {
        self.handedness
    }

    /// Returns the detector's confidence that this is a hand, between 0.0 and 1.0.
    pub fn score(&self) -> f32 {
        self.score
    }

    /// Computes the smallest rectangle containing all landmarks, in pixels of an image of size
    /// `res`.
    pub fn bounding_rect(&self, res: Resolution) -> Rect {
        // There are always 21 landmarks, so this cannot be `None`.
        Rect::bounding(self.landmarks.iter().map(|lm| lm.to_pixel(res)))
            .unwrap_or(Rect::from_top_left(0.0, 0.0, 0.0, 0.0))
    }
}

/// The hands a [`Detector`] found in one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkSet {
    hands: Vec<Hand>,
}

impl LandmarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hand: Hand) {
        self.hands.push(hand);
    }

    pub fn hands(&self) -> &[Hand] {
        &self.hands
    }

    pub fn len(&self) -> usize {
        self.hands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hands.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Hand> {
        self.hands.iter()
    }
}

impl FromIterator<Hand> for LandmarkSet {
    fn from_iter<T: IntoIterator<Item = Hand>>(iter: T) -> Self {
        Self {
            hands: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a LandmarkSet {
    type Item = &'a Hand;
    type IntoIter = std::slice::Iter<'a, Hand>;

    fn into_iter(self) -> Self::IntoIter {
        self.hands.iter()
    }
}

/// Names for the hand pose landmarks.
///
/// # Terminology
///
/// - **CMC**: [Carpometacarpal joint], the lowest joint of the thumb, located near the wrist.
/// - **MCP**: [Metacarpophalangeal joint], the lower joint forming the knuckles near the palm of
///   the hand.
/// - **PIP**: Proximal Interphalangeal joint, the joint between the MCP and DIP.
/// - **DIP**: Distal Interphalangeal joint, the highest joint of a finger.
/// - **Tip**: This landmark is just placed on the tip of the finger, above the DIP.
///
/// [Carpometacarpal joint]: https://en.wikipedia.org/wiki/Carpometacarpal_joint
/// [Metacarpophalangeal joint]: https://en.wikipedia.org/wiki/Metacarpophalangeal_joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkIdx {
    Wrist,
    ThumbCmc,
    ThumbMcp,
    ThumbIp,
    ThumbTip,
    IndexFingerMcp,
    IndexFingerPip,
    IndexFingerDip,
    IndexFingerTip,
    MiddleFingerMcp,
    MiddleFingerPip,
    MiddleFingerDip,
    MiddleFingerTip,
    RingFingerMcp,
    RingFingerPip,
    RingFingerDip,
    RingFingerTip,
    PinkyMcp,
    PinkyPip,
    PinkyDip,
    PinkyTip,
}

/// The 21 edges between hand landmarks that make up the hand skeleton.
pub const CONNECTIONS: &[(LandmarkIdx, LandmarkIdx)] = {
    use LandmarkIdx::*;
    &[
        // Thumb:
        (Wrist, ThumbCmc),
        (ThumbCmc, ThumbMcp),
        (ThumbMcp, ThumbIp),
        (ThumbIp, ThumbTip),
        // Palm:
        (Wrist, IndexFingerMcp),
        (IndexFingerMcp, MiddleFingerMcp),
        (MiddleFingerMcp, RingFingerMcp),
        (RingFingerMcp, PinkyMcp),
        (Wrist, PinkyMcp),
        // Index:
        (IndexFingerMcp, IndexFingerPip),
        (IndexFingerPip, IndexFingerDip),
        (IndexFingerDip, IndexFingerTip),
        // Middle:
        (MiddleFingerMcp, MiddleFingerPip),
        (MiddleFingerPip, MiddleFingerDip),
        (MiddleFingerDip, MiddleFingerTip),
        // Ring:
        (RingFingerMcp, RingFingerPip),
        (RingFingerPip, RingFingerDip),
        (RingFingerDip, RingFingerTip),
        // Pinky:
        (PinkyMcp, PinkyPip),
        (PinkyPip, PinkyDip),
        (PinkyDip, PinkyTip),
    ]
};

/// Configuration of a hand [`Detector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandsOptions {
    static_image_mode: bool,
    max_num_hands: usize,
    min_detection_confidence: f32,
    min_tracking_confidence: f32,
}

impl Default for HandsOptions {
    fn default() -> Self {
        Self {
            static_image_mode: false,
            max_num_hands: 2,
            min_detection_confidence: 0.7,
            min_tracking_confidence: 0.5,
        }
    }
}

impl HandsOptions {
    /// Treats every image as unrelated to the previous one, running full detection every time.
    ///
    /// By default, hands found in one frame are tracked into the next one, which is faster for
    /// video.
    pub fn static_image_mode(mut self, enabled: bool) -> Self {
        self.static_image_mode = enabled;
        self
    }

    /// Sets the maximum number of hands to report per image.
    pub fn max_num_hands(mut self, count: usize) -> Self {
        self.max_num_hands = count;
        self
    }

    /// Sets the minimum score for a newly detected hand to be reported.
    pub fn min_detection_confidence(mut self, confidence: f32) -> Self {
        self.min_detection_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Sets the minimum score for a tracked hand to be kept.
    ///
    /// Hands whose score drops below this value are re-detected in the next frame.
    pub fn min_tracking_confidence(mut self, confidence: f32) -> Self {
        self.min_tracking_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn is_static_image_mode(&self) -> bool {
        self.static_image_mode
    }

    pub fn get_max_num_hands(&self) -> usize {
        self.max_num_hands
    }

    pub fn get_min_detection_confidence(&self) -> f32 {
        self.min_detection_confidence
    }

    pub fn get_min_tracking_confidence(&self) -> f32 {
        self.min_tracking_confidence
    }
}

/// Finds hands in images.
///
/// Detectors may keep state between calls (for example, to track hands across video frames), so
/// they should be fed consecutive frames of a single video.
pub trait Detector {
    /// The channel order this detector expects its input image to be in.
    fn input_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    /// Finds all hands in `image`.
    fn process(&mut self, image: &Image) -> anyhow::Result<LandmarkSet>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn input_order(&self) -> ChannelOrder {
        (**self).input_order()
    }

    fn process(&mut self, image: &Image) -> anyhow::Result<LandmarkSet> {
        (**self).process(image)
    }
}

impl<D: Detector + ?Sized> Detector for &mut D {
    fn input_order(&self) -> ChannelOrder {
        (**self).input_order()
    }

    fn process(&mut self, image: &Image) -> anyhow::Result<LandmarkSet> {
        (**self).process(image)
    }
}

/// A [`Detector`] that never finds any hands.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn process(&mut self, _image: &Image) -> anyhow::Result<LandmarkSet> {
        Ok(LandmarkSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) fn hand_at(x: f32, y: f32, size: f32) -> Hand {
        let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
        for (i, lm) in landmarks.iter_mut().enumerate() {
            let t = i as f32 / (NUM_LANDMARKS - 1) as f32;
            *lm = Landmark::new(x + t * size, y + (1.0 - t) * size, 0.0);
        }
        Hand::new(landmarks, Handedness::Right, 0.9)
    }

    #[test]
    fn connections_form_hand_skeleton() {
        assert_eq!(CONNECTIONS.len(), 21);
        for lm in 0..NUM_LANDMARKS {
            assert!(
                CONNECTIONS
                    .iter()
                    .any(|(a, b)| *a as usize == lm || *b as usize == lm),
                "landmark {lm} is not connected"
            );
        }
        assert!(CONNECTIONS.contains(&(LandmarkIdx::Wrist, LandmarkIdx::PinkyMcp)));
        assert_eq!(LandmarkIdx::PinkyTip as usize, NUM_LANDMARKS - 1);
    }

    #[test]
    fn default_options() {
        let opts = HandsOptions::default();
        assert!(!opts.is_static_image_mode());
        assert_eq!(opts.get_max_num_hands(), 2);
        assert_eq!(opts.get_min_detection_confidence(), 0.7);
        assert_eq!(opts.get_min_tracking_confidence(), 0.5);

        let opts = opts.min_tracking_confidence(0.7).min_detection_confidence(2.0);
        assert_eq!(opts.get_min_tracking_confidence(), 0.7);
        assert_eq!(opts.get_min_detection_confidence(), 1.0);
    }

    #[test]
    fn hand_bounding_rect() {
        let hand = hand_at(0.25, 0.5, 0.25);
        let rect = hand.bounding_rect(Resolution::new(200, 100));
        assert_eq!(rect, Rect::from_top_left(50.0, 50.0, 50.0, 25.0));
        assert_eq!(hand.landmark(LandmarkIdx::Wrist), Landmark::new(0.25, 0.75, 0.0));
    }

    #[test]
    fn null_detector_finds_nothing() {
        let mut detector = NullDetector;
        let boxed: &mut dyn Detector = &mut detector;
        assert_eq!(boxed.input_order(), ChannelOrder::Rgb);
        assert!(boxed.process(&Image::new(8, 8)).unwrap().is_empty());
    }
}
