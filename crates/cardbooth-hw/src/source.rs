//! Frame sources and the camera discovery ladder.
//!
//! Many driver/backend combinations open successfully and then deliver
//! black or garbage frames. Discovery therefore walks an ordered list of
//! `(index, backend)` candidates and only accepts one after a warm-up read
//! clears a brightness threshold.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Anything that can hand out consecutive frames.
///
/// The owner of a source is its only reader; the device is released when
/// the source is dropped.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Short human-readable identifier for logs.
    fn describe(&self) -> String {
        "frame source".to_string()
    }
}

/// Format negotiation strategy used when opening a V4L2 node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Request motion JPEG.
    Mjpeg,
    /// Request YUYV 4:2:2.
    Yuyv,
    /// Keep whatever format the driver reports, only set the resolution.
    Native,
}

impl Backend {
    /// Default preference order, most preferred first.
    pub const DEFAULT_ORDER: [Backend; 3] = [Backend::Mjpeg, Backend::Yuyv, Backend::Native];

    pub(crate) fn fourcc(self) -> Option<&'static [u8; 4]> {
        match self {
            Backend::Mjpeg => Some(b"MJPG"),
            Backend::Yuyv => Some(b"YUYV"),
            Backend::Native => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Mjpeg => "mjpeg",
            Backend::Yuyv => "yuyv",
            Backend::Native => "native",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" => Ok(Backend::Mjpeg),
            "yuyv" => Ok(Backend::Yuyv),
            "native" | "default" => Ok(Backend::Native),
            other => Err(format!("unknown camera backend: {other}")),
        }
    }
}

/// One `(index, backend)` pair tried during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub index: u32,
    pub backend: Backend,
}

/// Discovery parameters.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Device indices `0..device_count` are probed.
    pub device_count: u32,
    /// Backends tried for each index, in order.
    pub backends: Vec<Backend>,
    pub width: u32,
    pub height: u32,
    /// Maximum reads per candidate before it is rejected.
    pub warmup_attempts: usize,
    /// Mean RGB brightness a warm-up frame must exceed.
    pub min_brightness: f32,
    /// Pause between warm-up reads.
    pub warmup_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            device_count: 2,
            backends: Backend::DEFAULT_ORDER.to_vec(),
            width: 1280,
            height: 720,
            warmup_attempts: 15,
            min_brightness: 10.0,
            warmup_interval: Duration::from_millis(100),
        }
    }
}

impl DiscoveryConfig {
    /// Index-major cross product of indices and backends.
    pub fn candidates(&self) -> Vec<DeviceCandidate> {
        (0..self.device_count)
            .flat_map(|index| {
                self.backends
                    .iter()
                    .map(move |&backend| DeviceCandidate { index, backend })
            })
            .collect()
    }
}

/// Opens a candidate into a live source. Injected so the ladder can be
/// driven without hardware.
pub trait DeviceOpener {
    type Device: FrameSource;

    fn open(
        &mut self,
        candidate: DeviceCandidate,
        width: u32,
        height: u32,
    ) -> Result<Self::Device, CameraError>;
}

/// Opens real V4L2 devices.
pub struct V4lOpener;

impl DeviceOpener for V4lOpener {
    type Device = Camera;

    fn open(
        &mut self,
        candidate: DeviceCandidate,
        width: u32,
        height: u32,
    ) -> Result<Camera, CameraError> {
        Camera::open(candidate, width, height)
    }
}

/// Walk the candidate list and return the first device whose warm-up
/// produces a frame brighter than the threshold.
///
/// Rejected devices are dropped (closed) before the next candidate is
/// opened. Fails with [`CameraError::NoDeviceFound`] only after every
/// candidate has been tried.
pub fn discover<O: DeviceOpener>(
    opener: &mut O,
    config: &DiscoveryConfig,
) -> Result<(DeviceCandidate, O::Device), CameraError> {
    let candidates = config.candidates();

    for (attempt, candidate) in candidates.iter().copied().enumerate() {
        tracing::debug!(
            attempt = attempt + 1,
            index = candidate.index,
            backend = %candidate.backend,
            "probing camera candidate"
        );

        let mut device = match opener.open(candidate, config.width, config.height) {
            Ok(device) => device,
            Err(e) => {
                tracing::debug!(
                    index = candidate.index,
                    backend = %candidate.backend,
                    error = %e,
                    "candidate failed to open"
                );
                continue;
            }
        };

        if warm_up(&mut device, config) {
            tracing::info!(
                index = candidate.index,
                backend = %candidate.backend,
                source = %device.describe(),
                "camera selected"
            );
            return Ok((candidate, device));
        }

        tracing::warn!(
            index = candidate.index,
            backend = %candidate.backend,
            attempts = config.warmup_attempts,
            "candidate returned only dark or unreadable frames; closing"
        );
        drop(device);
    }

    Err(CameraError::NoDeviceFound {
        attempts: candidates.len(),
    })
}

/// Read up to `warmup_attempts` frames, succeeding on the first one whose
/// mean brightness exceeds the threshold.
fn warm_up<S: FrameSource>(device: &mut S, config: &DiscoveryConfig) -> bool {
    for read in 0..config.warmup_attempts {
        match device.read_frame() {
            Ok(frame) => {
                let brightness = frame.mean_brightness();
                if brightness > config.min_brightness {
                    tracing::debug!(read = read + 1, brightness, "warm-up frame accepted");
                    return true;
                }
                tracing::trace!(read = read + 1, brightness, "warm-up frame too dark");
            }
            Err(e) => tracing::trace!(read = read + 1, error = %e, "warm-up read failed"),
        }
        if !config.warmup_interval.is_zero() {
            std::thread::sleep(config.warmup_interval);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Source producing frames of a fixed brightness; `None` means every
    /// read fails.
    struct FakeSource {
        level: Option<u8>,
        bright_after: usize,
        reads: usize,
    }

    impl FrameSource for FakeSource {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            self.reads += 1;
            let Some(level) = self.level else {
                return Err(CameraError::CaptureFailed("fake read failure".into()));
            };
            let value = if self.reads > self.bright_after { level } else { 0 };
            let frame = Frame::from_rgb(vec![value; 4 * 4 * 3], 4, 4, self.reads as u32);
            Ok(frame.unwrap())
        }
    }

    struct FakeOpener {
        /// Candidate that yields bright frames, and after how many dark reads.
        good: Option<(DeviceCandidate, usize)>,
        unopenable: Vec<DeviceCandidate>,
        tried: Rc<RefCell<Vec<DeviceCandidate>>>,
    }

    impl FakeOpener {
        fn new(good: Option<(DeviceCandidate, usize)>) -> Self {
            Self {
                good,
                unopenable: Vec::new(),
                tried: Rc::new(RefCell::new(Vec::new())),
            }
        }
    }

    impl DeviceOpener for FakeOpener {
        type Device = FakeSource;

        fn open(
            &mut self,
            candidate: DeviceCandidate,
            _width: u32,
            _height: u32,
        ) -> Result<FakeSource, CameraError> {
            self.tried.borrow_mut().push(candidate);
            if self.unopenable.contains(&candidate) {
                return Err(CameraError::DeviceNotFound(format!("{candidate:?}")));
            }
            match self.good {
                Some((good, dark_reads)) if good == candidate => Ok(FakeSource {
                    level: Some(120),
                    bright_after: dark_reads,
                    reads: 0,
                }),
                _ => Ok(FakeSource {
                    level: Some(0),
                    bright_after: 0,
                    reads: 0,
                }),
            }
        }
    }

    fn config(
        device_count: u32,
        backends: Vec<Backend>,
        warmup_attempts: usize,
    ) -> DiscoveryConfig {
        DiscoveryConfig {
            device_count,
            backends,
            warmup_attempts,
            warmup_interval: Duration::ZERO,
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_candidates_are_index_major() {
        let cfg = config(2, vec![Backend::Mjpeg, Backend::Native], 1);
        let c = cfg.candidates();
        assert_eq!(
            c,
            vec![
                DeviceCandidate {
                    index: 0,
                    backend: Backend::Mjpeg,
                },
                DeviceCandidate {
                    index: 0,
                    backend: Backend::Native,
                },
                DeviceCandidate {
                    index: 1,
                    backend: Backend::Mjpeg,
                },
                DeviceCandidate {
                    index: 1,
                    backend: Backend::Native,
                },
            ]
        );
    }

    #[test]
    fn test_discover_selects_only_working_candidate_and_stops() {
        // 2 indices × 3 backends, only index 1 / third backend clears the
        // threshold, and only after 9 dark reads.
        let cfg = config(2, Backend::DEFAULT_ORDER.to_vec(), 10);
        let good = DeviceCandidate {
            index: 1,
            backend: Backend::DEFAULT_ORDER[2],
        };
        let mut opener = FakeOpener::new(Some((good, 9)));
        let tried = Rc::clone(&opener.tried);

        let (selected, device) = discover(&mut opener, &cfg).unwrap();
        assert_eq!(selected, good);
        assert_eq!(device.reads, 10);
        // Good candidate is the last in the matrix; all six tried exactly once.
        assert_eq!(tried.borrow().len(), 6);
        assert_eq!(*tried.borrow().last().unwrap(), good);
    }

    #[test]
    fn test_discover_does_not_try_later_candidates() {
        let cfg = config(2, Backend::DEFAULT_ORDER.to_vec(), 10);
        let good = DeviceCandidate {
            index: 1,
            backend: Backend::Mjpeg,
        };
        let mut opener = FakeOpener::new(Some((good, 0)));
        let tried = Rc::clone(&opener.tried);

        let (selected, _) = discover(&mut opener, &cfg).unwrap();
        assert_eq!(selected, good);
        assert_eq!(tried.borrow().len(), 4);
    }

    #[test]
    fn test_discover_rejects_candidate_that_warms_up_too_late() {
        let cfg = config(1, vec![Backend::Yuyv], 10);
        let good = DeviceCandidate {
            index: 0,
            backend: Backend::Yuyv,
        };
        // Bright only from the 11th read on, beyond the warm-up budget.
        let mut opener = FakeOpener::new(Some((good, 10)));
        let result = discover(&mut opener, &cfg);
        assert!(matches!(
            result,
            Err(CameraError::NoDeviceFound { attempts: 1 })
        ));
    }

    #[test]
    fn test_discover_skips_unopenable_candidates() {
        let cfg = config(1, vec![Backend::Mjpeg, Backend::Yuyv], 3);
        let good = DeviceCandidate {
            index: 0,
            backend: Backend::Yuyv,
        };
        let mut opener = FakeOpener::new(Some((good, 0)));
        opener.unopenable.push(DeviceCandidate {
            index: 0,
            backend: Backend::Mjpeg,
        });

        let (selected, _) = discover(&mut opener, &cfg).unwrap();
        assert_eq!(selected, good);
    }

    #[test]
    fn test_discover_exhausts_matrix() {
        let cfg = config(3, Backend::DEFAULT_ORDER.to_vec(), 2);
        let mut opener = FakeOpener::new(None);
        let tried = Rc::clone(&opener.tried);
        let result = discover(&mut opener, &cfg);
        assert!(matches!(
            result,
            Err(CameraError::NoDeviceFound { attempts: 9 })
        ));
        assert_eq!(tried.borrow().len(), 9);
    }

    #[test]
    fn test_warm_up_tolerates_read_failures() {
        let cfg = config(1, vec![Backend::Native], 5);
        let mut failing = FakeSource {
            level: None,
            bright_after: 0,
            reads: 0,
        };
        assert!(!warm_up(&mut failing, &cfg));
        assert_eq!(failing.reads, 5);
    }

    #[test]
    fn test_backend_parse_and_display() {
        assert_eq!("MJPG".parse::<Backend>().unwrap(), Backend::Mjpeg);
        assert_eq!(" yuyv ".parse::<Backend>().unwrap(), Backend::Yuyv);
        assert_eq!("default".parse::<Backend>().unwrap(), Backend::Native);
        assert!("dshow".parse::<Backend>().is_err());
        assert_eq!(Backend::Native.to_string(), "native");
    }
}
