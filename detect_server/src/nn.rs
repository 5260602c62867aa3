//! Object detection with a YOLOv8 network exported to ONNX.
//!
use std::path::Path;

use anyhow::{bail, Result};
use image::RgbImage;
use ndarray::{s, Ix2};
use tract_onnx::prelude::*;

use crate::labels::{class_name, NUM_CLASSES};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Side length of the square network input.
const INPUT_SIZE: u32 = 640;

/// One object found on a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Corners `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]` in frame pixels.
    pub bbox: [i32; 4],
    pub class_id: usize,
    pub label: &'static str,
    /// Confidence score in `[0, 1]`.
    pub confidence: f32,
}

/// Anything that turns a frame into a list of detections.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>>;
}

pub struct YoloModel {
    model: NnModel,
    max_iou: f32,
    min_confidence: f32,
}

impl YoloModel {
    pub fn new(path: impl AsRef<Path>, min_confidence: f32, max_iou: f32) -> Result<Self> {
        let path = path.as_ref();
        let input_fact = InferenceFact::dt_shape(
            f32::datum_type(),
            tvec!(1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize),
        );
        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        log::info!("Loaded detection model from {}", path.display());

        Ok(Self {
            model,
            max_iou,
            min_confidence,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            INPUT_SIZE,
            INPUT_SIZE,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }
}

impl Detector for YoloModel {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.preproc(frame);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;
        let (width, height) = frame.dimensions();

        postproc_yolo(
            &raw_nn_out[0],
            width,
            height,
            self.min_confidence,
            self.max_iou,
        )
    }
}

/// Decode the raw `[1, 4 + classes, anchors]` output of a YOLOv8 head.
///
/// Every anchor column holds the box center, width and height in network input pixels followed
/// by one score per class. The best class of each anchor is kept if it beats `min_confidence`,
/// boxes are scaled back to the frame of size `width` x `height` and finally thinned out with
/// non-maximum suppression.
pub fn postproc_yolo(
    output: &Tensor,
    width: u32,
    height: u32,
    min_confidence: f32,
    max_iou: f32,
) -> Result<Vec<Detection>> {
    let raw = output.to_array_view::<f32>()?;
    if raw.ndim() != 3 {
        bail!("unexpected output shape {:?}", raw.shape());
    }
    let preds = raw.slice(s![0, .., ..]).into_dimensionality::<Ix2>()?;
    if preds.nrows() < 4 + NUM_CLASSES {
        bail!("output has {} rows, expected {}", preds.nrows(), 4 + NUM_CLASSES);
    }

    let scale_x = width as f32 / INPUT_SIZE as f32;
    let scale_y = height as f32 / INPUT_SIZE as f32;
    let (max_x, max_y) = (width as f32, height as f32);

    let mut candidates: Vec<Candidate> = (0..preds.ncols())
        .filter_map(|anchor| {
            let (class_id, confidence) = (0..NUM_CLASSES)
                .map(|class_id| (class_id, preds[[4 + class_id, anchor]]))
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if !(confidence > min_confidence) {
                return None;
            }

            let (cx, cy) = (preds[[0, anchor]], preds[[1, anchor]]);
            let (w, h) = (preds[[2, anchor]], preds[[3, anchor]]);
            let bbox = [
                ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
                ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
            ];

            Some(Candidate {
                confidence,
                class_id,
                bbox,
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let detections = non_maximum_suppression(candidates, max_iou)
        .into_iter()
        .map(|candidate| Detection {
            bbox: candidate.bbox.map(|v| v.round() as i32),
            class_id: candidate.class_id,
            label: class_name(candidate.class_id),
            confidence: candidate.confidence,
        })
        .collect();

    Ok(detections)
}

#[derive(Clone, Debug)]
struct Candidate {
    confidence: f32,
    class_id: usize,
    bbox: [f32; 4],
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident bounding box and iterate over all other bounding boxes in the
/// order of sinking confidence. Grow the vector of selected bounding boxes by adding only those
/// candidates which do not overlap more than `max_iou` with an already chosen box of the same
/// class.
fn non_maximum_suppression(
    mut sorted_candidates: Vec<Candidate>,
    max_iou: f32,
) -> Vec<Candidate> {
    let mut selected: Vec<Candidate> = vec![];
    'candidates: loop {
        // Get next most confident candidate from the back of ascending-sorted vector.
        match sorted_candidates.pop() {
            Some(candidate) => {
                for chosen in selected.iter() {
                    if chosen.class_id == candidate.class_id
                        && iou(&candidate.bbox, &chosen.bbox) > max_iou
                    {
                        continue 'candidates;
                    }
                }

                selected.push(candidate)
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the top left corner of the overlap box ends up below and to
    // the right of its bottom right corner and the area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bottom-right point lies above/to the left of the top-left point, the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

#[cfg(test)]
mod test {
    use super::*;

    /// Build a raw head output with the given `(cx, cy, w, h, class_id, score)` anchors.
    fn head_output(anchors: &[(f32, f32, f32, f32, usize, f32)]) -> Tensor {
        let rows = 4 + NUM_CLASSES;
        tract_ndarray::Array3::from_shape_fn((1, rows, anchors.len()), |(_, row, col)| {
            let (cx, cy, w, h, class_id, score) = anchors[col];
            match row {
                0 => cx,
                1 => cy,
                2 => w,
                3 => h,
                r if r - 4 == class_id => score,
                _ => 0.0,
            }
        })
        .into()
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1.0e-4);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);

        let half = iou(&a, &[5.0, 0.0, 15.0, 10.0]);
        assert!((half - 1.0 / 3.0).abs() < 1.0e-4);
    }

    #[test]
    fn test_bbox_area_of_ill_defined_box_is_zero() {
        assert_eq!(bbox_area(&[10.0, 10.0, 5.0, 20.0]), 0.0);
        assert_eq!(bbox_area(&[0.0, 0.0, 4.0, 5.0]), 20.0);
    }

    #[test]
    fn test_postproc_scales_filters_and_suppresses() -> Result<()> {
        let output = head_output(&[
            // Two overlapping persons, only the more confident survives
            (320.0, 320.0, 64.0, 64.0, 0, 0.9),
            (322.0, 320.0, 64.0, 64.0, 0, 0.8),
            // Same place, other class, is kept
            (320.0, 320.0, 64.0, 64.0, 16, 0.7),
            // Below threshold
            (100.0, 100.0, 10.0, 10.0, 2, 0.1),
        ]);

        let detections = postproc_yolo(&output, 1280, 640, 0.25, 0.45)?;
        assert_eq!(detections.len(), 2);

        assert_eq!(detections[0].label, "person");
        assert_eq!(detections[0].bbox, [576, 288, 704, 352]);
        assert!((detections[0].confidence - 0.9).abs() < 1.0e-6);

        assert_eq!(detections[1].label, "dog");
        assert_eq!(detections[1].class_id, 16);

        Ok(())
    }

    #[test]
    fn test_postproc_clamps_to_frame() -> Result<()> {
        let output = head_output(&[(0.0, 630.0, 40.0, 40.0, 0, 0.6)]);
        let detections = postproc_yolo(&output, 640, 640, 0.25, 0.45)?;

        assert_eq!(detections[0].bbox, [0, 610, 20, 640]);
        Ok(())
    }

    #[test]
    fn test_postproc_rejects_wrong_shape() {
        let output: Tensor = tract_ndarray::Array2::<f32>::zeros((4, 4)).into();
        assert!(postproc_yolo(&output, 640, 480, 0.25, 0.45).is_err());
    }

    #[test]
    fn test_yolo_model_if_available() -> Result<()> {
        let path = Path::new("yolov8n.onnx");
        if !path.exists() {
            println!("Skipping, no model file at {}", path.display());
            return Ok(());
        }

        let model = YoloModel::new(path, 0.25, 0.45)?;
        let frame = RgbImage::new(640, 480);
        let detections = model.detect(&frame)?;
        println!("Detections on blank frame: {detections:?}");

        Ok(())
    }
}
