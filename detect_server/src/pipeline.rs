//! Capture, detect, annotate and encode frames for the video stream.
//!
use std::{io, sync::Arc};

use anyhow::Result;
use bytes::Bytes;
use image::RgbImage;
use tokio::sync::mpsc::{self, Sender};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    annotate::Annotator,
    camera::CameraOpener,
    nn::Detector,
    stats::{DetectedObject, DetectionStats},
};

/// Encoded frames buffered between the capture worker and the HTTP body.
const FRAME_BUFFER: usize = 2;

pub type FrameStream = ReceiverStream<Result<Bytes, io::Error>>;

/// Processes camera frames for one or more video streams.
pub struct Pipeline {
    detector: Arc<dyn Detector>,
    annotator: Annotator,
    stats: Arc<DetectionStats>,
    jpeg_quality: i32,
}

impl Pipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        annotator: Annotator,
        stats: Arc<DetectionStats>,
        jpeg_quality: i32,
    ) -> Self {
        Self {
            detector,
            annotator,
            stats,
            jpeg_quality,
        }
    }

    /// Run one frame through the pipeline and return it as a multipart stream item.
    ///
    /// Detection only runs while it is enabled; frames are streamed either way.
    pub fn process_frame(&self, mut frame: RgbImage) -> Result<Bytes> {
        if self.stats.is_detecting() {
            let detections = self.detector.detect(&frame)?;
            log::debug!("{} detections on frame", detections.len());

            self.annotator.draw(&mut frame, &detections);
            self.stats
                .record_frame(detections.iter().map(DetectedObject::from).collect());
        }
        self.stats.tick_frame();

        let buf =
            turbojpeg::compress_image(&frame, self.jpeg_quality, turbojpeg::Subsamp::Sub2x2)?;
        Ok(as_jpeg_stream_item(&buf))
    }

    /// Open a fresh capture and stream processed frames until the camera stops delivering or the
    /// receiving end is dropped.
    pub fn frame_stream(self: &Arc<Self>, opener: CameraOpener) -> FrameStream {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let pipeline = Arc::clone(self);
        tokio::task::spawn_blocking(move || pipeline.run_capture(opener, tx));

        ReceiverStream::new(rx)
    }

    fn run_capture(&self, opener: CameraOpener, tx: Sender<Result<Bytes, io::Error>>) {
        let mut capture = match opener() {
            Ok(capture) => capture,
            Err(err) => {
                log::error!("Could not open camera: {err:#}");
                return;
            }
        };
        self.stats.stream_started();

        let mut frames = 0_u64;
        while let Some(frame) = capture() {
            match self.process_frame(frame) {
                Ok(item) => {
                    if tx.blocking_send(Ok(item)).is_err() {
                        log::info!("Client disconnected, releasing camera");
                        break;
                    }
                    frames += 1;
                }
                Err(err) => {
                    log::error!("Failed to process frame: {err:#}");
                    // Aborts the response body
                    tx.blocking_send(Err(io::Error::new(io::ErrorKind::Other, err.to_string())))
                        .ok();
                    break;
                }
            }
        }

        self.stats.stream_ended();
        log::info!("Video stream ended after {frames} frames");
    }
}

/// Wrap an encoded JPEG into a part of a `multipart/x-mixed-replace; boundary=frame` body.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::from(
        [
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}
