use crate::image::{draw, Color, Image};

use super::{Hand, CONNECTIONS};

/// Style used to render landmarks or the connections between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawingSpec {
    pub color: Color,
    pub thickness: u32,
    pub circle_radius: u32,
}

impl DrawingSpec {
    /// Style of landmark markers used by the processing loop: purple circles.
    pub const LANDMARKS: Self = Self {
        color: Color::from_rgb8(76, 22, 121),
        thickness: 2,
        circle_radius: 4,
    };

    /// Style of the lines connecting landmarks used by the processing loop.
    pub const CONNECTIONS: Self = Self {
        color: Color::from_rgb8(250, 44, 250),
        thickness: 2,
        circle_radius: 2,
    };

    /// MediaPipe's stock landmark style: small red circles.
    pub const PLAIN_LANDMARKS: Self = Self {
        color: Color::from_rgb8(255, 0, 0),
        thickness: 2,
        circle_radius: 2,
    };

    /// MediaPipe's stock connection style: light gray lines.
    pub const PLAIN_CONNECTIONS: Self = Self {
        color: Color::from_rgb8(224, 224, 224),
        thickness: 2,
        circle_radius: 2,
    };
}

/// Draws the skeleton of `hand` onto `image`.
///
/// Connections are drawn first so that the landmark markers end up on top of them. Landmarks that
/// lie outside of the image are skipped, together with their connections.
pub fn draw_landmarks(
    image: &mut Image,
    hand: &Hand,
    landmark_spec: &DrawingSpec,
    connection_spec: &DrawingSpec,
) {
    let res = image.resolution();
    let pixel = |idx: usize| {
        let lm = hand.landmarks()[idx];
        lm.is_visible().then(|| {
            let [x, y] = lm.to_pixel(res);
            (x as i32, y as i32)
        })
    };

    for &(a, b) in CONNECTIONS {
        if let (Some((ax, ay)), Some((bx, by))) = (pixel(a as usize), pixel(b as usize)) {
            draw::line(image, ax, ay, bx, by)
                .color(connection_spec.color)
                .stroke_width(connection_spec.thickness);
        }
    }

    for idx in 0..hand.landmarks().len() {
        if let Some((x, y)) = pixel(idx) {
            draw::circle(image, x, y, landmark_spec.circle_radius)
                .color(landmark_spec.color)
                .stroke_width(landmark_spec.thickness);
        }
    }
}
