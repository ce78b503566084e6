//! cardbooth-core: alignment gating, player selection and card compositing.
//!
//! Face location runs SCRFD via ONNX Runtime on CPU. Everything after the
//! capture trigger (selection, stat derivation, compositing) is plain file
//! and image work with no device access.

pub mod alignment;
pub mod background;
pub mod catalog;
pub mod compositor;
pub mod detector;
pub mod selector;
pub mod stats;
pub mod template;
pub mod types;

pub use alignment::{AlignmentGate, AlignmentPhase, AlignmentTracker};
pub use background::{BackgroundError, BackgroundRemover, CommandRemover};
pub use catalog::{Catalog, CatalogError, Gender, PlayerProfile};
pub use compositor::{CardAsset, CardCompositor, CompositionError, CompositorConfig};
pub use detector::{DetectorError, FaceLocator, ScrfdLocator};
pub use selector::{PlayerSelector, SelectError};
pub use stats::{Attribute, StatBlock, Variant};
pub use types::{AlignmentResult, BoundingBox};
