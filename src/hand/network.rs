//! Hand landmark estimation with a MediaPipe-style ONNX model.

use std::{env, mem, path::Path, sync::Arc};

use anyhow::{bail, Context};
use tract_onnx::prelude::{
    tvec, Framework, Graph, InferenceModelExt, SimplePlan, TValue, Tensor, TypedFact, TypedOp,
};

use crate::image::{ChannelOrder, Image, Rect, Resolution};

use super::{Detector, Hand, Handedness, HandsOptions, Landmark, LandmarkSet, NUM_LANDMARKS};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const ENV_VAR_HAND_MODEL: &str = "HANDCAM_HAND_MODEL";

/// Results overlapping an already accepted hand by at least this much are discarded.
const IOU_THRESH: f32 = 0.3;

/// Landmark bounding box -> tracking region grow factor.
const ROI_GROW: f32 = 1.5;

/// Describes in what order the network expects its input image data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputLayout {
    /// `(N, C, H, W)`
    Nchw,
    /// `(N, H, W, C)`
    Nhwc,
}

impl InputLayout {
    /// Determines the layout and the side length of a square RGB input.
    fn from_shape(shape: &[usize]) -> anyhow::Result<(Self, usize)> {
        match *shape {
            [1, 3, h, w] if h == w => Ok((Self::Nchw, w)),
            [1, h, w, 3] if h == w => Ok((Self::Nhwc, w)),
            _ => bail!("unsupported hand landmark model input shape {shape:?}"),
        }
    }
}

/// A [`Detector`] running a hand landmark network.
///
/// The network expects a square crop containing one hand and outputs 21 landmarks, a hand presence
/// score and the handedness. Without a separate palm detector, new hands are searched for in fixed
/// square regions of the frame (center, left and right). Once found, a hand is tracked in the next
/// frame by cropping a region around its previous landmarks.
pub struct LandmarkNetwork {
    model: Model,
    layout: InputLayout,
    input_size: usize,
    options: HandsOptions,
    /// Regions of interest derived from the hands found in the previous frame.
    tracked: Vec<Rect>,
}

impl LandmarkNetwork {
    /// Loads the model from the path in the `HANDCAM_HAND_MODEL` environment variable.
    ///
    /// Returns `Ok(None)` if the variable is not set.
    pub fn from_env(options: HandsOptions) -> anyhow::Result<Option<Self>> {
        match env::var_os(ENV_VAR_HAND_MODEL) {
            Some(path) => {
                log::debug!("`{ENV_VAR_HAND_MODEL}` is set to '{}'", path.to_string_lossy());
                Self::load(path, options).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Loads a hand landmark model from an ONNX file.
    pub fn load<P: AsRef<Path>>(path: P, options: HandsOptions) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => bail!("neural network file must have `.onnx` extension"),
        }
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read model '{}'", path.display()))?;
        let this = Self::from_onnx(&data, options)?;
        log::info!(
            "loaded hand landmark model '{}' ({} {:?} input)",
            path.display(),
            this.input_resolution(),
            this.layout,
        );
        Ok(this)
    }

    /// Loads a hand landmark model from in-memory ONNX data.
    pub fn from_onnx(data: &[u8], options: HandsOptions) -> anyhow::Result<Self> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*data)?
            .into_optimized()?;

        let fact = graph.input_fact(0)?;
        let Some(shape) = fact.shape.as_concrete() else {
            bail!("hand landmark model has a symbolic input shape");
        };
        let (layout, input_size) = InputLayout::from_shape(shape)?;
        if graph.outputs.len() < 3 {
            bail!(
                "hand landmark model has {} outputs, expected at least 3",
                graph.outputs.len()
            );
        }

        Ok(Self {
            model: SimplePlan::new(graph)?,
            layout,
            input_size,
            options,
            tracked: Vec::new(),
        })
    }

    /// Returns the expected input resolution of the network.
    pub fn input_resolution(&self) -> Resolution {
        Resolution::new(self.input_size as u32, self.input_size as u32)
    }

    /// Runs the network on the square `roi` of `image`.
    fn estimate(&self, image: &Image, roi: Rect) -> anyhow::Result<Hand> {
        let size = self.input_size;
        let data = sample_region(image, roi, size, self.layout);
        let shape = match self.layout {
            InputLayout::Nchw => [1, 3, size, size],
            InputLayout::Nhwc => [1, size, size, 3],
        };
        let input = Tensor::from_shape(&shape, &data)?;
        let outputs = self.model.run(tvec![TValue::from_const(Arc::new(input))])?;

        let landmarks = outputs[0].as_slice::<f32>()?;
        let presence = outputs[1].as_slice::<f32>()?;
        let handedness = outputs[2].as_slice::<f32>()?;
        let (Some(&presence), Some(&handedness)) = (presence.first(), handedness.first()) else {
            bail!("hand landmark model produced empty outputs");
        };
        log::trace!("presence={presence:.2}, handedness={handedness:.2}");

        let landmarks = map_landmarks(landmarks, roi, size, image.resolution())?;
        let handedness = if handedness > 0.5 {
            Handedness::Right
        } else {
            Handedness::Left
        };
        Ok(Hand::new(landmarks, handedness, presence))
    }
}

impl Detector for LandmarkNetwork {
    fn process(&mut self, image: &Image) -> anyhow::Result<LandmarkSet> {
        let res = image.resolution();
        let max = self.options.get_max_num_hands();
        let mut accepted = Accepted::default();

        if !self.options.is_static_image_mode() {
            for roi in mem::take(&mut self.tracked) {
                if accepted.len() >= max {
                    break;
                }
                let hand = self.estimate(image, roi)?;
                if hand.score() >= self.options.get_min_tracking_confidence() {
                    accepted.offer(hand, res);
                } else {
                    log::trace!("lost track of hand (score {:.2})", hand.score());
                }
            }
        }

        if accepted.len() < max {
            for roi in detection_regions(res) {
                if accepted.len() >= max {
                    break;
                }
                let hand = self.estimate(image, roi)?;
                if hand.score() >= self.options.get_min_detection_confidence() {
                    accepted.offer(hand, res);
                }
            }
        }

        if !self.options.is_static_image_mode() {
            self.tracked = accepted.rects.iter().map(|rect| tracking_roi(*rect)).collect();
        }
        Ok(accepted.hands.into_iter().collect())
    }
}

/// Hands accepted for the current frame, with their bounding rectangles in pixels.
#[derive(Default)]
struct Accepted {
    hands: Vec<Hand>,
    rects: Vec<Rect>,
}

impl Accepted {
    fn len(&self) -> usize {
        self.hands.len()
    }

    /// Accepts `hand` unless it overlaps one that was already accepted.
    fn offer(&mut self, hand: Hand, res: Resolution) -> bool {
        let rect = hand.bounding_rect(res);
        if overlaps(&self.rects, &rect) {
            log::trace!("discarding hand overlapping an accepted one");
            return false;
        }
        self.hands.push(hand);
        self.rects.push(rect);
        true
    }
}

fn overlaps(accepted: &[Rect], candidate: &Rect) -> bool {
    accepted.iter().any(|rect| rect.iou(candidate) >= IOU_THRESH)
}

/// The square region to search for a hand next frame, given its current landmark bounding box.
fn tracking_roi(bounding: Rect) -> Rect {
    bounding.to_square().grow_rel(ROI_GROW)
}

/// Square regions scanned for new hands: the center of the frame, then its left and right edge.
fn detection_regions(res: Resolution) -> Vec<Rect> {
    let (w, h) = (res.width() as f32, res.height() as f32);
    let side = w.min(h);
    let mut regions = vec![Rect::from_center(w / 2.0, h / 2.0, side, side)];
    for x in [0.0, w - side] {
        let rect = Rect::from_top_left(x, (h - side) / 2.0, side, side);
        if !regions.contains(&rect) {
            regions.push(rect);
        }
    }
    regions
}

/// Crops `roi` out of `image` and scales it to a `size`x`size` network input with values in
/// `0.0..=1.0`, using nearest-neighbor sampling.
///
/// Parts of the region outside of the image are filled with black.
fn sample_region(image: &Image, roi: Rect, size: usize, layout: InputLayout) -> Vec<f32> {
    let mut data = vec![0.0; size * size * 3];
    let scale_x = roi.width() / size as f32;
    let scale_y = roi.height() / size as f32;
    let (r, b) = match image.order() {
        ChannelOrder::Rgb => (0, 2),
        ChannelOrder::Bgr => (2, 0),
    };

    for py in 0..size {
        let y = (roi.y() + (py as f32 + 0.5) * scale_y).floor();
        if y < 0.0 || y >= image.height() as f32 {
            continue;
        }
        for px in 0..size {
            let x = (roi.x() + (px as f32 + 0.5) * scale_x).floor();
            if x < 0.0 || x >= image.width() as f32 {
                continue;
            }
            let color = image.get(x as u32, y as u32);
            for (c, channel) in [r, 1, b].into_iter().enumerate() {
                let index = match layout {
                    InputLayout::Nchw => (c * size + py) * size + px,
                    InputLayout::Nhwc => (py * size + px) * 3 + c,
                };
                data[index] = color[channel] as f32 / 255.0;
            }
        }
    }

    data
}

/// Converts landmarks from network input pixels inside `roi` to normalized image coordinates.
fn map_landmarks(
    raw: &[f32],
    roi: Rect,
    input_size: usize,
    res: Resolution,
) -> anyhow::Result<[Landmark; NUM_LANDMARKS]> {
    if raw.len() < NUM_LANDMARKS * 3 {
        bail!(
            "hand landmark model produced {} values, expected {}",
            raw.len(),
            NUM_LANDMARKS * 3
        );
    }

    let scale = roi.width() / input_size as f32;
    let (w, h) = (res.width() as f32, res.height() as f32);
    let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
    for (lm, coords) in landmarks.iter_mut().zip(raw.chunks_exact(3)) {
        *lm = Landmark::new(
            (roi.x() + coords[0] * scale) / w,
            (roi.y() + coords[1] * scale) / h,
            coords[2] * scale / w,
        );
    }
    Ok(landmarks)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::hand::tests::hand_at;
    use crate::image::Color;

    use super::*;

    #[test]
    fn input_layouts() {
        assert_eq!(
            InputLayout::from_shape(&[1, 3, 224, 224]).unwrap(),
            (InputLayout::Nchw, 224)
        );
        assert_eq!(
            InputLayout::from_shape(&[1, 256, 256, 3]).unwrap(),
            (InputLayout::Nhwc, 256)
        );
        assert!(InputLayout::from_shape(&[1, 3, 224, 160]).is_err());
        assert!(InputLayout::from_shape(&[224, 224]).is_err());
    }

    #[test]
    fn regions_cover_frame() {
        let regions = detection_regions(Resolution::RES_720P);
        assert_eq!(
            regions,
            [
                Rect::from_top_left(280.0, 0.0, 720.0, 720.0),
                Rect::from_top_left(0.0, 0.0, 720.0, 720.0),
                Rect::from_top_left(560.0, 0.0, 720.0, 720.0),
            ]
        );

        // Square frames only need a single region.
        assert_eq!(detection_regions(Resolution::new(100, 100)).len(), 1);
    }

    #[test]
    fn tracking_roi_grows_around_hand() {
        let roi = tracking_roi(Rect::from_top_left(10.0, 20.0, 40.0, 20.0));
        assert_relative_eq!(roi.width(), 60.0);
        assert_relative_eq!(roi.height(), 60.0);
        assert_eq!(roi.center(), [30.0, 30.0]);
    }

    #[test]
    fn overlapping_hands_are_deduplicated() {
        let res = Resolution::new(100, 100);
        let mut accepted = Accepted::default();
        assert!(accepted.offer(hand_at(0.1, 0.1, 0.4), res));
        // Mostly the same area.
        assert!(!accepted.offer(hand_at(0.15, 0.1, 0.4), res));
        // Somewhere else entirely.
        assert!(accepted.offer(hand_at(0.6, 0.6, 0.3), res));
        assert_eq!(accepted.len(), 2);
    }

    #[test]
    fn sampling_crops_and_pads() {
        let mut image = Image::new(4, 4);
        image.clear(Color::RED);
        image.set(3, 3, Color::BLUE);

        // Region extends past the bottom right corner by 4 pixels.
        let roi = Rect::from_top_left(2.0, 2.0, 4.0, 4.0);
        let data = sample_region(&image, roi, 2, InputLayout::Nhwc);
        assert_eq!(data.len(), 12);
        // Top left sample at (3, 3) is blue.
        assert_eq!(&data[0..3], &[0.0, 0.0, 1.0]);
        // Everything else is outside the image.
        assert!(data[3..].iter().all(|&v| v == 0.0));

        let data = sample_region(&image, image.rect(), 2, InputLayout::Nchw);
        // Red plane first, one value per pixel.
        assert_eq!(&data[0..4], &[1.0, 1.0, 1.0, 0.0]);
        assert_eq!(&data[8..12], &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn sampling_honors_channel_order() {
        let mut image = Image::new(1, 1);
        image.set(0, 0, Color::RED);
        image.convert_order(ChannelOrder::Bgr);
        let data = sample_region(&image, image.rect(), 1, InputLayout::Nhwc);
        assert_eq!(data, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn landmarks_are_mapped_to_image() {
        let mut raw = vec![0.0; 63];
        raw[0] = 112.0;
        raw[1] = 224.0;
        raw[2] = 22.4;
        let roi = Rect::from_top_left(100.0, 50.0, 100.0, 100.0);
        let landmarks = map_landmarks(&raw, roi, 224, Resolution::new(400, 200)).unwrap();
        assert_relative_eq!(landmarks[0].x, 150.0 / 400.0, epsilon = 1e-6);
        assert_relative_eq!(landmarks[0].y, 150.0 / 200.0, epsilon = 1e-6);
        assert_relative_eq!(landmarks[0].z, 10.0 / 400.0, epsilon = 1e-6);
        assert_relative_eq!(landmarks[1].x, 100.0 / 400.0, epsilon = 1e-6);

        assert!(map_landmarks(&raw[..30], roi, 224, Resolution::new(400, 200)).is_err());
    }
}
