//! Draw detections onto frames.
//!
use std::path::Path;

use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::nn::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_SCALE: Scale = Scale { x: 16.0, y: 16.0 };

/// Draws bounding boxes and their labels.
///
/// Without a font only the boxes are drawn.
pub struct Annotator {
    font: Option<Font<'static>>,
}

impl Annotator {
    pub fn new(font: Option<Font<'static>>) -> Self {
        Self { font }
    }

    /// Load the label font from a TrueType file, falling back to boxes only.
    pub fn from_font_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let font = match std::fs::read(path) {
            Ok(data) => Font::try_from_vec(data),
            Err(err) => {
                log::warn!("Could not read font {}: {err}", path.display());
                None
            }
        };
        if font.is_none() {
            log::warn!("No usable label font, drawing boxes only");
        }

        Self::new(font)
    }

    #[cfg(test)]
    fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, frame: &mut RgbImage, detections: &[Detection]) {
        for detection in detections {
            let [x_tl, y_tl, x_br, y_br] = detection.bbox;
            let width = (x_br - x_tl).max(1) as u32;
            let height = (y_br - y_tl).max(1) as u32;

            // Two pixel wide outline
            draw_hollow_rect_mut(frame, Rect::at(x_tl, y_tl).of_size(width, height), BOX_COLOR);
            if width > 2 && height > 2 {
                draw_hollow_rect_mut(
                    frame,
                    Rect::at(x_tl + 1, y_tl + 1).of_size(width - 2, height - 2),
                    BOX_COLOR,
                );
            }

            if let Some(font) = &self.font {
                draw_text_mut(
                    frame,
                    BOX_COLOR,
                    x_tl,
                    (y_tl - LABEL_SCALE.y as i32 - 2).max(0),
                    LABEL_SCALE,
                    font,
                    &label_text(detection),
                );
            }
        }
    }
}

/// Text drawn next to a bounding box, e.g. `person: 87.50%`.
pub fn label_text(detection: &Detection) -> String {
    format!("{}: {:.2}%", detection.label, detection.confidence * 100.0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn detection(bbox: [i32; 4]) -> Detection {
        Detection {
            bbox,
            class_id: 0,
            label: "person",
            confidence: 0.875,
        }
    }

    #[test]
    fn test_label_text() {
        assert_eq!(label_text(&detection([0, 0, 1, 1])), "person: 87.50%");
    }

    #[test]
    fn test_draws_box_outline_only() {
        let mut frame = RgbImage::new(100, 100);
        Annotator::new(None).draw(&mut frame, &[detection([10, 20, 50, 60])]);

        assert_eq!(frame[(10, 20)], BOX_COLOR);
        assert_eq!(frame[(49, 59)], BOX_COLOR);
        assert_eq!(frame[(11, 30)], BOX_COLOR);
        assert_eq!(frame[(30, 40)], Rgb([0, 0, 0]));
    }

    #[test]
    fn test_boxes_outside_frame_are_clipped() {
        let mut frame = RgbImage::new(32, 32);
        Annotator::new(None).draw(
            &mut frame,
            &[detection([20, 20, 80, 80]), detection([5, 5, 5, 5])],
        );

        assert_eq!(frame[(20, 31)], BOX_COLOR);
    }

    #[test]
    fn test_missing_font_file_draws_boxes_only() {
        let annotator = Annotator::from_font_file("/nonexistent/font.ttf");
        assert!(!annotator.has_font());
    }
}
