//! cardbooth-hw: camera discovery and frame capture.
//!
//! Provides V4L2 camera access, RGB frames, and the candidate/warm-up
//! ladder used to find a camera that actually delivers usable images.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use source::{
    discover, Backend, DeviceCandidate, DeviceOpener, DiscoveryConfig, FrameSource, V4lOpener,
};
