//! ponto-hw — camera session ownership and frame capture.
//!
//! One [`CameraSession`] owns the video device for the lifetime of a
//! scan: acquisition, orientation-aware restarts, and idempotent
//! release.

pub mod camera;
pub mod frame;

pub use camera::{
    ActiveCapture, CameraError, CameraSession, DisplayTransform, Orientation, RestartThrottle,
};
pub use frame::Frame;
