//! Card compositing pipeline.
//!
//! Photo → background removal (degrades to the raw photo) → scale to the
//! garment → subject behind garment on a transparent canvas → fixed-name
//! composite PNG → template fill → single overwritten card file.

use crate::background::BackgroundRemover;
use crate::catalog::PlayerProfile;
use crate::stats::StatBlock;
use crate::template::{escape_markup, Substitutions, TemplateError};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cutout width as a fraction of the garment width.
pub const CUTOUT_WIDTH_FRACTION: f32 = 0.55;
/// Vertical position of the neck opening, as a fraction of garment height.
pub const NECK_Y_FRACTION: f32 = 0.15;
/// Where the chin sits in a head-and-shoulders cutout, as a fraction of its height.
pub const CHIN_Y_FRACTION: f32 = 0.6;

/// File name of the composite image inside the work directory.
pub const COMPOSITE_FILE: &str = "card_composite.png";

/// Card slot tokens, in slot order.
pub const SLOT_TOKENS: [&str; 6] = ["PAC", "SHO", "PAS", "DRI", "DEF", "PHY"];

#[derive(Error, Debug)]
pub enum CompositionError {
    #[error("card template not found: {0}")]
    TemplateMissing(PathBuf),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("cannot read photo {path}: {source}")]
    Photo {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Paths used by the compositor.
#[derive(Debug, Clone)]
pub struct CompositorConfig {
    /// Markup template containing the card placeholders.
    pub template_path: PathBuf,
    /// Garment overlay (RGBA PNG with a transparent neck opening).
    pub garment_path: PathBuf,
    /// Scratch directory for the composite image.
    pub work_dir: PathBuf,
    /// The single "current card" output file.
    pub output_path: PathBuf,
}

/// A finished card.
#[derive(Debug, Clone, Serialize)]
pub struct CardAsset {
    pub output_path: PathBuf,
    pub source_photo_path: PathBuf,
    pub composite_path: PathBuf,
    pub profile: PlayerProfile,
    pub stats: StatBlock,
    /// False when background removal failed and the raw photo was used.
    pub background_removed: bool,
    /// False when the garment overlay was unavailable.
    pub garment_applied: bool,
}

pub struct CardCompositor<R> {
    config: CompositorConfig,
    remover: R,
}

impl<R: BackgroundRemover> CardCompositor<R> {
    pub fn new(config: CompositorConfig, remover: R) -> Self {
        Self { config, remover }
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    /// Run the full pipeline and overwrite the current card.
    ///
    /// Only a missing template, an unreadable photo or I/O failures are
    /// fatal. The previous card is untouched unless the new one is fully
    /// written.
    pub fn compose(
        &self,
        photo_path: &Path,
        profile: &PlayerProfile,
        stats: &StatBlock,
    ) -> Result<CardAsset, CompositionError> {
        let photo = image::open(photo_path).map_err(|source| CompositionError::Photo {
            path: photo_path.to_path_buf(),
            source,
        })?;

        let (cutout, background_removed) = match self.remover.remove_background(&photo) {
            Ok(cutout) => (cutout, true),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    photo = %photo_path.display(),
                    "background removal failed; using raw photo"
                );
                (photo.to_rgba8(), false)
            }
        };

        let garment = match image::open(&self.config.garment_path) {
            Ok(g) => Some(g.to_rgba8()),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    garment = %self.config.garment_path.display(),
                    "garment overlay unavailable; composing cutout alone"
                );
                None
            }
        };
        let garment_applied = garment.is_some();

        let composite = layer_subject(&cutout, garment.as_ref());

        std::fs::create_dir_all(&self.config.work_dir)?;
        let composite_path = self.config.work_dir.join(COMPOSITE_FILE);
        composite.save(&composite_path)?;

        let template = match std::fs::read_to_string(&self.config.template_path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let path = self.config.template_path.clone();
                return Err(CompositionError::TemplateMissing(path));
            }
            Err(e) => return Err(e.into()),
        };
        let card = card_substitutions(profile, stats, &composite_path).apply(&template)?;

        write_replacing(&self.config.output_path, card.as_bytes())?;

        tracing::info!(
            output = %self.config.output_path.display(),
            player = %profile.name,
            overall = stats.overall(),
            background_removed,
            garment_applied,
            "card composed"
        );

        Ok(CardAsset {
            output_path: self.config.output_path.clone(),
            source_photo_path: photo_path.to_path_buf(),
            composite_path,
            profile: profile.clone(),
            stats: stats.clone(),
            background_removed,
            garment_applied,
        })
    }
}

/// Scale the cutout to the garment and layer it behind the garment.
///
/// Without a garment the cutout is returned at its own size.
pub fn layer_subject(cutout: &RgbaImage, garment: Option<&RgbaImage>) -> RgbaImage {
    let Some(garment) = garment else {
        return cutout.clone();
    };
    let (gw, gh) = garment.dimensions();
    let (cw, ch) = cutout.dimensions();

    let mut canvas = RgbaImage::new(gw, gh);
    if cw > 0 && ch > 0 {
        let target_w = ((gw as f32 * CUTOUT_WIDTH_FRACTION).round() as u32).max(1);
        let target_h = ((ch as f32 * target_w as f32 / cw as f32).round() as u32).max(1);
        let scaled = imageops::resize(cutout, target_w, target_h, FilterType::Lanczos3);

        let (x, y) = subject_offset(gw, gh, target_w, target_h);
        imageops::overlay(&mut canvas, &scaled, x, y);
    }
    imageops::overlay(&mut canvas, garment, 0, 0);
    canvas
}

/// Top-left position of the scaled cutout: centred horizontally, chin on
/// the neck opening. May be negative (cropped at the canvas edge).
pub fn subject_offset(garment_w: u32, garment_h: u32, cutout_w: u32, cutout_h: u32) -> (i64, i64) {
    let x = (garment_w as i64 - cutout_w as i64) / 2;
    let neck_y = (garment_h as f32 * NECK_Y_FRACTION).round() as i64;
    let chin_y = (cutout_h as f32 * CHIN_Y_FRACTION).round() as i64;
    (x, neck_y - chin_y)
}

/// Placeholder values for a card.
pub fn card_substitutions(
    profile: &PlayerProfile,
    stats: &StatBlock,
    image_path: &Path,
) -> Substitutions {
    let image_path = image_path.display().to_string();
    let mut subs = Substitutions::new()
        .required("NAME", escape_markup(&profile.name.to_uppercase()))
        .required("POSITION", escape_markup(&profile.position))
        .required("OVR", stats.overall().to_string())
        .required("IMAGE_PATH", escape_markup(&image_path));

    for (token, (attr, value)) in SLOT_TOKENS.iter().zip(stats.slots()) {
        subs = subs
            .required(token, value.to_string())
            .optional(&format!("{token}_LABEL"), attr.code());
    }
    subs
}

/// Write via a sibling temp file and rename so readers never see a
/// partial card.
fn write_replacing(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
