//! Detection server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    annotate::Annotator,
    camera::{parse_frame_interval, parse_resolution, v4l2_opener, CameraConfig},
    endpoints::router,
    meter::spawn_meter_logger,
    nn::YoloModel,
    pipeline::Pipeline,
    stats::DetectionStats,
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the dashboard on
    #[clap(long, default_value = "127.0.0.1:5000")]
    server_address: String,

    /// YOLOv8 model exported to ONNX
    #[clap(long, default_value = "yolov8n.onnx")]
    model: PathBuf,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Capture resolution as WIDTHxHEIGHT, highest supported if unset
    #[clap(long, value_parser = parse_resolution)]
    resolution: Option<(u32, u32)>,

    /// Capture frame interval as NUM/DEN seconds, e.g. 1/30, fastest supported if unset
    #[clap(long, value_parser = parse_frame_interval)]
    frame_interval: Option<(u32, u32)>,

    /// Minimum confidence of a detection
    #[clap(long, default_value_t = 0.25)]
    min_confidence: f32,

    /// Maximum overlap of two boxes of the same class before the weaker one is dropped
    #[clap(long, default_value_t = 0.45)]
    max_iou: f32,

    /// Quality of the streamed JPEG frames
    #[clap(long, default_value_t = 80, value_parser = clap::value_parser!(i32).range(1..=100))]
    jpeg_quality: i32,

    /// TrueType font for box labels
    #[clap(long, default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf")]
    font: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let detector = Arc::new(YoloModel::new(&args.model, args.min_confidence, args.max_iou)?);
    let stats = Arc::new(DetectionStats::new());
    let pipeline = Arc::new(Pipeline::new(
        detector,
        Annotator::from_font_file(&args.font),
        Arc::clone(&stats),
        args.jpeg_quality,
    ));
    let camera_opener = v4l2_opener(CameraConfig {
        device: args.device,
        resolution: args.resolution,
        frame_interval: args.frame_interval,
    });

    spawn_meter_logger(Arc::clone(&stats), Duration::from_secs(5));

    let app = router(stats, pipeline, camera_opener);

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving dashboard on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
