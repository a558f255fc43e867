//! V4L2 camera session via the `v4l` crate.
//!
//! A session owns the device exclusively between `acquire` and
//! `release`. Orientation changes restart the stream, throttled so an
//! event burst (rotation animation, viewport resizes) causes at most
//! one restart per window.

use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

use crate::frame::{self, Frame};

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("session not acquired")]
    NotAcquired,
}

/// Physical orientation of the kiosk display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
}

/// Corrective rotation for the rendering surface when the negotiated
/// stream dimensions disagree with the expected orientation. Applied to
/// the preview only; raw frames are never rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayTransform {
    None,
    Rotate90,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
}

/// Limits stream restarts to one per throttle window.
///
/// Orientation and resize events arrive in bursts; restarting the
/// stream on each one starves capture. Only the first event in a
/// window wins.
#[derive(Debug)]
pub struct RestartThrottle {
    window: Duration,
    last_restart: Option<Instant>,
}

impl RestartThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_restart: None,
        }
    }

    /// Whether a restart is allowed at `now`; records it if so.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last_restart {
            Some(prev) if now.duration_since(prev) < self.window => false,
            _ => {
                self.last_restart = Some(now);
                true
            }
        }
    }
}

impl Default for RestartThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

struct OpenStream {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// Exclusive handle on the video input device for one scan session.
pub struct CameraSession {
    device_path: String,
    stream: Option<OpenStream>,
    orientation: Orientation,
    throttle: RestartThrottle,
    restart_count: u32,
}

impl CameraSession {
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            stream: None,
            orientation: Orientation::Landscape,
            throttle: RestartThrottle::default(),
            restart_count: 0,
        }
    }

    /// Acquire the device and negotiate a capture format.
    ///
    /// Safe to call when already acquired (no-op).
    pub fn acquire(&mut self) -> Result<(), CameraError> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.stream = Some(open_stream(&self.device_path)?);
        Ok(())
    }

    /// Whether the device is currently held and ready for capture.
    pub fn is_ready(&self) -> bool {
        self.stream.is_some()
    }

    /// Release the device. Idempotent; safe to call from any cleanup
    /// path, including after a failed acquire.
    pub fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(device = %self.device_path, "camera released");
        }
    }

    /// Record an orientation event. Restarts the stream when the
    /// orientation actually changed and the throttle window allows it.
    /// Returns true if a restart happened.
    pub fn set_orientation(&mut self, orientation: Orientation) -> Result<bool, CameraError> {
        let changed = orientation != self.orientation;
        self.orientation = orientation;
        if !changed || self.stream.is_none() {
            return Ok(false);
        }
        if !self.throttle.allow(Instant::now()) {
            tracing::debug!("orientation restart suppressed by throttle");
            return Ok(false);
        }
        tracing::info!(?orientation, "restarting stream for orientation change");
        self.stream = None;
        self.stream = Some(open_stream(&self.device_path)?);
        self.restart_count += 1;
        Ok(true)
    }

    /// Number of stream restarts this session has performed.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Corrective transform for the rendering surface, derived from the
    /// negotiated dimensions versus the expected orientation.
    pub fn display_transform(&self) -> DisplayTransform {
        let Some(stream) = &self.stream else {
            return DisplayTransform::None;
        };
        let stream_landscape = stream.width >= stream.height;
        let expect_landscape = self.orientation == Orientation::Landscape;
        if stream_landscape == expect_landscape {
            DisplayTransform::None
        } else {
            DisplayTransform::Rotate90
        }
    }

    /// Start a capture batch. The mmap stream stays on across frames;
    /// starting one per dequeue would pay STREAMON/STREAMOFF per tick.
    ///
    /// Dequeues block until the driver delivers a buffer, so callers on
    /// an async runtime must drive the batch from a dedicated thread.
    pub fn start_capture(&mut self) -> Result<ActiveCapture<'_>, CameraError> {
        let stream = self.stream.as_ref().ok_or(CameraError::NotAcquired)?;
        let mmap = MmapStream::with_buffers(&stream.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        Ok(ActiveCapture {
            mmap,
            width: stream.width,
            height: stream.height,
            pixel_format: stream.pixel_format,
        })
    }

    /// Capture a single frame. Diagnostics convenience; scan paths hold
    /// an [`ActiveCapture`] instead.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.start_capture()?.next_frame()
    }
}

/// One running capture batch on an acquired session.
pub struct ActiveCapture<'a> {
    mmap: MmapStream<'a>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl ActiveCapture<'_> {
    /// Dequeue the next frame, converting to grayscale if needed.
    /// Blocks until the driver delivers a buffer.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .mmap
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = buf_to_grayscale(buf, self.width, self.height, self.pixel_format)?;

        Ok(Frame {
            data: gray,
            width: self.width,
            height: self.height,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_stream(device_path: &str) -> Result<OpenStream, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::Unavailable(device_path.to_string()));
    }

    let device = Device::with_path(device_path).map_err(|e| {
        if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
            CameraError::DeviceBusy
        } else {
            CameraError::Unavailable(format!("{device_path}: {e}"))
        }
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::Unavailable(format!("failed to query capabilities: {e}")))?;

    if !caps
        .capabilities
        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
    {
        return Err(CameraError::Unavailable(format!(
            "{device_path}: no video capture capability"
        )));
    }

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;

    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = 640;
    fmt.height = 480;

    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

    let fourcc = negotiated.fourcc;
    let pixel_format = if fourcc == FourCC::new(b"GREY") {
        PixelFormat::Grey
    } else if fourcc == FourCC::new(b"YUYV") {
        PixelFormat::Yuyv
    } else {
        return Err(CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format: {fourcc:?} (need YUYV or GREY)"
        )));
    };

    tracing::info!(
        device = device_path,
        driver = %caps.driver,
        width = negotiated.width,
        height = negotiated.height,
        fourcc = ?fourcc,
        "camera stream opened"
    );

    Ok(OpenStream {
        device,
        width: negotiated.width,
        height: negotiated.height,
        pixel_format,
    })
}

fn buf_to_grayscale(
    buf: &[u8],
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
) -> Result<Vec<u8>, CameraError> {
    let pixels = (width * height) as usize;
    match pixel_format {
        PixelFormat::Grey => {
            if buf.len() < pixels {
                return Err(CameraError::CaptureFailed(format!(
                    "GREY buffer too short: expected {pixels}, got {}",
                    buf.len()
                )));
            }
            Ok(buf[..pixels].to_vec())
        }
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
    }
}
