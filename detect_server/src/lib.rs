//! Live object detection on a webcam stream, served to the browser with running statistics.
pub mod annotate;
pub mod camera;
pub mod endpoints;
pub mod labels;
pub mod meter;
pub mod nn;
pub mod pipeline;
pub mod stats;
