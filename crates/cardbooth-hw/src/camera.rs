//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{Backend, DeviceCandidate, FrameSource};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// `EBUSY` from errno.h.
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no working camera found after {attempts} candidate(s)")]
    NoDeviceFound { attempts: usize },
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layout delivered by the driver after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG, one compressed image per buffer.
    Mjpeg,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb24,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpeg)
        } else if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(Self::Rgb24)
        } else {
            None
        }
    }
}

/// Device path for a V4L2 index.
pub fn device_path(index: u32) -> String {
    format!("/dev/video{index}")
}

/// V4L2 camera device handle.
///
/// The device is closed when the handle is dropped.
pub struct Camera {
    /// Streaming buffers, queued on the first read and kept until drop.
    /// Declared before `device` so STREAMOFF runs before the node closes.
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub candidate: DeviceCandidate,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    sequence: u32,
}

impl Camera {
    /// Open the device named by `candidate` and negotiate `width`×`height`
    /// using the candidate's backend strategy.
    pub fn open(candidate: DeviceCandidate, width: u32, height: u32) -> Result<Self, CameraError> {
        let path = device_path(candidate.index);
        let device = open_capture_node(&path)?;
        let (negotiated, pixel_format) = negotiate(&device, candidate.backend, width, height)?;

        tracing::debug!(
            device = %path,
            backend = %candidate.backend,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            stream: None,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: path,
            candidate,
            fourcc: negotiated.fourcc,
            pixel_format,
            sequence: 0,
        })
    }

    /// Capture a single frame converted to packed RGB.
    ///
    /// The mmap stream is started on the first call and stays running, so
    /// later reads dequeue from a live stream. A failed dequeue tears the
    /// stream down and the next call starts a fresh one.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream =
                MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
            tracing::debug!(device = %self.device_path, "mmap stream started");
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::CaptureFailed("mmap stream unavailable".into()));
        };

        let (pixel_format, width, height) = (self.pixel_format, self.width, self.height);
        let dequeued = stream
            .next()
            .map(|(buf, meta)| (decode_buffer(pixel_format, width, height, buf), meta.sequence));
        let (decoded, sequence) = match dequeued {
            Ok(next) => next,
            Err(e) => {
                self.stream = None;
                let reason = format!("failed to dequeue buffer: {e}");
                return Err(CameraError::CaptureFailed(reason));
            }
        };

        let (data, width, height) = decoded?;
        self.sequence = sequence;
        Frame::from_rgb(data, width, height, sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = device_path(i);
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// Convert one dequeued buffer to packed RGB.
fn decode_buffer(
    format: PixelFormat,
    width: u32,
    height: u32,
    buf: &[u8],
) -> Result<(Vec<u8>, u32, u32), CameraError> {
    match format {
        PixelFormat::Mjpeg => frame::mjpeg_to_rgb(buf)
            .map_err(|e| CameraError::CaptureFailed(format!("MJPEG decode failed: {e}"))),
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
            .map(|rgb| (rgb, width, height))
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        PixelFormat::Rgb24 => {
            let expected = width as usize * height as usize * 3;
            if buf.len() < expected {
                return Err(CameraError::CaptureFailed(format!(
                    "RGB3 buffer too short: expected {expected}, got {}",
                    buf.len()
                )));
            }
            Ok((buf[..expected].to_vec(), width, height))
        }
    }
}

/// Open a V4L2 node and check that it can capture video.
fn open_capture_node(path: &str) -> Result<Device, CameraError> {
    if !Path::new(path).exists() {
        return Err(CameraError::DeviceNotFound(path.to_string()));
    }

    let device = Device::with_path(path).map_err(|e| match e.raw_os_error() {
        Some(EBUSY) => CameraError::DeviceBusy,
        _ => CameraError::DeviceNotFound(format!("{path}: {e}")),
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("{path}: capability query failed: {e}")))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }
    tracing::trace!(
        device = path,
        driver = %caps.driver,
        card = %caps.card,
        "capture node opened"
    );
    Ok(device)
}

/// Apply a backend's format request. `Native` keeps the driver's current
/// pixel format and only asks for the resolution.
fn negotiate(
    device: &Device,
    backend: Backend,
    width: u32,
    height: u32,
) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut requested = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading current format: {e}")))?;
    if let Some(fourcc) = backend.fourcc() {
        requested.fourcc = FourCC::new(fourcc);
    }
    requested.width = width;
    requested.height = height;

    let negotiated = device
        .set_format(&requested)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("{backend}: {e}")))?;

    if backend.fourcc().is_some_and(|f| FourCC::new(f) != negotiated.fourcc) {
        return Err(CameraError::FormatNegotiationFailed(format!(
            "{backend} requested, driver chose {}",
            negotiated.fourcc
        )));
    }
    let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "driver format {} is not MJPG, YUYV or RGB3",
            negotiated.fourcc
        ))
    })?;
    Ok((negotiated, pixel_format))
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.device_path, self.candidate.backend)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stream = None;
        tracing::debug!(
            device = %self.device_path,
            last_sequence = self.sequence,
            "camera released"
        );
    }
}
