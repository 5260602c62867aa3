//! Camera access.
//!
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use rscam::{Camera, Config};
use simple_error::simple_error;

/// Capture format requested from the device, decoded with turbojpeg.
const FORMAT: &[u8] = b"MJPG";

/// Returns the next decoded frame, `None` once the device stops delivering.
pub type CaptureFn = Box<dyn FnMut() -> Option<RgbImage> + Send>;

/// Opens a fresh capture handle, once per video stream.
pub type CameraOpener = Arc<dyn Fn() -> Result<CaptureFn> + Send + Sync>;

/// Camera settings, unset values are negotiated with the device.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub device: String,
    pub resolution: Option<(u32, u32)>,
    /// Frame interval as `(numerator, denominator)` seconds.
    pub frame_interval: Option<(u32, u32)>,
}

/// Opener for a V4L2 device on a Linux machine.
pub fn v4l2_opener(config: CameraConfig) -> CameraOpener {
    Arc::new(move || {
        get_capture_fn_linux(&config.device, config.resolution, config.frame_interval)
    })
}

/// Get a capture function to a video device on a Linux machine.
pub fn get_capture_fn_linux(
    device_name: &str,
    resolution: Option<(u32, u32)>,
    frame_interval: Option<(u32, u32)>,
) -> Result<CaptureFn> {
    let mut cam = Camera::new(device_name)?;
    log_supported_formats(&cam);

    let resolution = resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam, FORMAT))?;

    let frame_interval = frame_interval
        .map(Ok)
        .unwrap_or_else(|| get_max_frame_rate(&cam, FORMAT, resolution))?;

    cam.start(&Config {
        interval: frame_interval,
        resolution,
        format: FORMAT,
        ..Default::default()
    })?;

    log::info!(
        "Opened camera {} at {}x{}, interval {}/{} s",
        device_name,
        resolution.0,
        resolution.1,
        frame_interval.0,
        frame_interval.1
    );

    let callback = move || {
        let frame = match cam.capture() {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("Error capturing frame: {err}");
                return None;
            }
        };
        match turbojpeg::decompress_image::<image::Rgb<u8>>(&frame[..]) {
            Ok(image) => Some(image),
            Err(err) => {
                log::error!("Error decoding frame: {err}");
                None
            }
        }
    };
    Ok(Box::new(callback))
}

/// Parse a resolution given as `WIDTHxHEIGHT`.
pub fn parse_resolution(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value:?}"))?;
    let width: u32 = width.trim().parse().map_err(|e| format!("bad width: {e}"))?;
    let height: u32 = height.trim().parse().map_err(|e| format!("bad height: {e}"))?;
    if width == 0 || height == 0 {
        return Err("resolution must not be zero".into());
    }

    Ok((width, height))
}

/// Parse a frame interval given as `NUM/DEN` seconds, e.g. `1/30` for 30 frames per second.
pub fn parse_frame_interval(value: &str) -> Result<(u32, u32), String> {
    let (numerator, denominator) = value
        .split_once('/')
        .ok_or_else(|| format!("expected NUM/DEN, got {value:?}"))?;
    let numerator: u32 = numerator.trim().parse().map_err(|e| format!("bad numerator: {e}"))?;
    let denominator: u32 = denominator
        .trim()
        .parse()
        .map_err(|e| format!("bad denominator: {e}"))?;
    if numerator == 0 || denominator == 0 {
        return Err("frame interval must not be zero".into());
    }

    Ok((numerator, denominator))
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32)> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(cam: &Camera, format: &[u8], resolution: (u32, u32)) -> Result<(u32, u32)> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame intervals: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) seconds, the shortest one is the fastest
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .filter(|(_, denominator)| *denominator > 0)
            .min_by(|a, b| (a.0 as f64 / a.1 as f64).total_cmp(&(b.0 as f64 / b.1 as f64)))
            .copied(),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

fn log_supported_formats(cam: &Camera) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!("Supported formats: {:?}, using MJPG", formats);
}
