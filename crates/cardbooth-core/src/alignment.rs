//! Face alignment gate and capture debounce.
//!
//! The gate answers one question per frame: is a face centred inside the
//! tight inner zone of the on-screen guide circle? The tracker turns a run
//! of positive answers into a single capture trigger.

use crate::detector::FaceLocator;
use crate::types::{AlignmentResult, BoundingBox};
use cardbooth_hw::Frame;

/// Faces smaller than this (either side, in pixels) are ignored.
pub const MIN_FACE_SIZE: f32 = 100.0;

/// Consecutive aligned frames required before capture (~1 s at 30 fps).
pub const DEFAULT_DEBOUNCE_THRESHOLD: u32 = 30;

/// Guide circle and tolerance for a frame of the given size.
///
/// Radius is `min(w, h) / 3`; a face qualifies when its centre is strictly
/// closer than `radius / 3` to the frame centre. Integer division matches
/// the on-screen guide.
pub fn guide_geometry(width: u32, height: u32) -> (u32, u32) {
    let radius = width.min(height) / 3;
    (radius, radius / 3)
}

/// Distance of a face centre from the frame centre.
fn center_distance(face: &BoundingBox, width: u32, height: u32) -> f32 {
    let (fx, fy) = face.center();
    let cx = (width / 2) as f32;
    let cy = (height / 2) as f32;
    ((fx - cx).powi(2) + (fy - cy).powi(2)).sqrt()
}

/// Classify already-located faces for a frame of the given size.
pub fn classify_faces(faces: &[BoundingBox], width: u32, height: u32) -> AlignmentResult {
    let (_, tolerance) = guide_geometry(width, height);

    let mut closest: Option<(f32, (f32, f32))> = None;
    for face in faces {
        if face.width < MIN_FACE_SIZE || face.height < MIN_FACE_SIZE {
            continue;
        }
        let dist = center_distance(face, width, height);
        if dist < tolerance as f32 {
            return AlignmentResult {
                aligned: true,
                face_center: Some(face.center()),
            };
        }
        if closest.map_or(true, |(best, _)| dist < best) {
            closest = Some((dist, face.center()));
        }
    }

    AlignmentResult {
        aligned: false,
        face_center: closest.map(|(_, c)| c),
    }
}

/// Per-frame alignment check backed by a face locator.
pub struct AlignmentGate<L> {
    locator: L,
}

impl<L: FaceLocator> AlignmentGate<L> {
    pub fn new(locator: L) -> Self {
        Self { locator }
    }

    /// Mirror the frame, locate faces on its grayscale derivative and
    /// decide whether any face is centred.
    ///
    /// Holds no state between calls. A locator failure counts as "not
    /// aligned".
    pub fn evaluate(&mut self, frame: &Frame) -> AlignmentResult {
        let mirrored = frame.mirrored();
        let gray = mirrored.to_grayscale();

        match self.locator.locate(&gray, mirrored.width, mirrored.height) {
            Ok(faces) => classify_faces(&faces, mirrored.width, mirrored.height),
            Err(e) => {
                tracing::debug!(error = %e, seq = frame.sequence, "face locator failed");
                AlignmentResult::default()
            }
        }
    }
}

/// Alignment sub-state while a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentPhase {
    Searching,
    Aligning(u32),
}

/// Debounces per-frame verdicts into one-shot capture triggers.
#[derive(Debug, Clone)]
pub struct AlignmentTracker {
    threshold: u32,
    consecutive: u32,
}

impl AlignmentTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Record one frame's verdict. Returns `true` exactly when this frame
    /// completes a run of `threshold` aligned frames; the count is then
    /// back at zero.
    pub fn observe(&mut self, aligned: bool) -> bool {
        if !aligned {
            self.consecutive = 0;
            return false;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            return true;
        }
        false
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn phase(&self) -> AlignmentPhase {
        match self.consecutive {
            0 => AlignmentPhase::Searching,
            n => AlignmentPhase::Aligning(n),
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

impl Default for AlignmentTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_THRESHOLD)
    }
}
