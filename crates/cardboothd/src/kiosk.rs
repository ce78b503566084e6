//! Card generation state shared by the capture consumer and the bus
//! interface.

use cardbooth_core::{
    BackgroundRemover, CardAsset, CardCompositor, CompositionError, Gender, PlayerSelector,
    SelectError,
};
use cardbooth_hw::Frame;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KioskError {
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Composition(#[from] CompositionError),
    #[error("failed to save capture: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame buffer does not match its dimensions")]
    InvalidFrame,
}

pub struct Kiosk<R> {
    selector: Mutex<PlayerSelector>,
    compositor: CardCompositor<R>,
    capture_dir: PathBuf,
    gender: Mutex<Option<Gender>>,
    current: Mutex<Option<CardAsset>>,
    /// Held for a whole generation so cards never interleave on the
    /// shared work files. Camera captures that find it held are dropped.
    generating: Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: BackgroundRemover> Kiosk<R> {
    pub fn new(
        selector: PlayerSelector,
        compositor: CardCompositor<R>,
        capture_dir: PathBuf,
    ) -> Self {
        Self {
            selector: Mutex::new(selector),
            compositor,
            capture_dir,
            gender: Mutex::new(None),
            current: Mutex::new(None),
            generating: Mutex::new(()),
        }
    }

    pub fn gender(&self) -> Option<Gender> {
        *lock(&self.gender)
    }

    /// Partition used for camera-triggered cards.
    pub fn set_gender(&self, gender: Option<Gender>) {
        tracing::info!(gender = ?gender, "gender tag updated");
        *lock(&self.gender) = gender;
    }

    pub fn current_card(&self) -> Option<CardAsset> {
        lock(&self.current).clone()
    }

    pub fn output_path(&self) -> &Path {
        &self.compositor.config().output_path
    }

    /// Save a captured frame, mirrored to match the on-screen preview, as
    /// `photo_YYYYmmdd_HHMMSS_<seq>.jpg` in the capture directory.
    pub fn save_capture(&self, frame: &Frame) -> Result<PathBuf, KioskError> {
        std::fs::create_dir_all(&self.capture_dir)?;
        let name = format!(
            "{}_{:06}.jpg",
            chrono::Local::now().format("photo_%Y%m%d_%H%M%S"),
            frame.sequence
        );
        let path = self.capture_dir.join(name);
        let image = frame
            .mirrored()
            .to_rgb_image()
            .ok_or(KioskError::InvalidFrame)?;
        image.save(&path)?;
        tracing::info!(
            path = %path.display(),
            seq = frame.sequence,
            "capture saved"
        );
        Ok(path)
    }

    /// Select a player, derive stats and compose a card from `photo`.
    ///
    /// Waits for any generation already in progress.
    pub fn generate(&self, photo: &Path, gender: Option<Gender>) -> Result<CardAsset, KioskError> {
        let _guard = lock(&self.generating);
        self.generate_locked(photo, gender)
    }

    fn generate_locked(
        &self,
        photo: &Path,
        gender: Option<Gender>,
    ) -> Result<CardAsset, KioskError> {
        let (profile, stats) = {
            let mut selector = lock(&self.selector);
            let profile = selector.select(gender)?;
            let stats = selector.derive_stats(&profile.base_stats);
            (profile, stats)
        };

        let asset = self.compositor.compose(photo, &profile, &stats)?;
        *lock(&self.current) = Some(asset.clone());
        Ok(asset)
    }

    /// Capture-event path: save the frame, then generate with the current
    /// gender tag.
    ///
    /// Returns `Ok(None)` without saving anything when a card is already
    /// being generated; the subject is still looking at that one.
    pub fn handle_capture(&self, frame: &Frame) -> Result<Option<CardAsset>, KioskError> {
        let _guard = match self.generating.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!(
                    seq = frame.sequence,
                    "generation in progress; capture skipped"
                );
                return Ok(None);
            }
        };
        let photo = self.save_capture(frame)?;
        self.generate_locked(&photo, self.gender()).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardbooth_core::catalog::{default_base_stats, Catalog};
    use cardbooth_core::{BackgroundError, CompositorConfig};
    use image::{DynamicImage, RgbaImage};
    use std::sync::{Arc, Barrier};

    struct PassThrough;

    /// Parks inside background removal until the test releases it.
    struct Parked {
        entered: Arc<Barrier>,
        release: Arc<Barrier>,
    }

    impl BackgroundRemover for Parked {
        fn remove_background(&self, image: &DynamicImage) -> Result<RgbaImage, BackgroundError> {
            self.entered.wait();
            self.release.wait();
            Ok(image.to_rgba8())
        }
    }

    impl BackgroundRemover for PassThrough {
        fn remove_background(&self, image: &DynamicImage) -> Result<RgbaImage, BackgroundError> {
            Ok(image.to_rgba8())
        }
    }

    const TEMPLATE: &str = concat!(
        "{{NAME}}|{{POSITION}}|{{OVR}}|",
        "{{PAC}} {{SHO}} {{PAS}} {{DRI}} {{DEF}} {{PHY}}|{{IMAGE_PATH}}",
    );

    fn kiosk(dir: &Path) -> Kiosk<PassThrough> {
        kiosk_with(dir, PassThrough)
    }

    fn kiosk_with<R: BackgroundRemover>(dir: &Path, remover: R) -> Kiosk<R> {
        let mut catalog = Catalog::default();
        catalog.append(Gender::Female, "Solo Keeper", "ST", default_base_stats()).unwrap();
        std::fs::write(dir.join("card.tmpl"), TEMPLATE).unwrap();

        let compositor = CardCompositor::new(
            CompositorConfig {
                template_path: dir.join("card.tmpl"),
                garment_path: dir.join("missing-jersey.png"),
                work_dir: dir.join("work"),
                output_path: dir.join("current.svg"),
            },
            remover,
        );
        let selector = PlayerSelector::seeded(catalog, 1);
        Kiosk::new(selector, compositor, dir.join("captures"))
    }

    fn frame() -> Frame {
        frame_seq(42)
    }

    fn frame_seq(sequence: u32) -> Frame {
        Frame::from_rgb(vec![90; 8 * 6 * 3], 8, 6, sequence).unwrap()
    }

    fn saved_photos(dir: &Path) -> usize {
        std::fs::read_dir(dir.join("captures")).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_handle_capture_saves_photo_and_composes() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk(dir.path());
        kiosk.set_gender(Some(Gender::Female));

        let asset = kiosk.handle_capture(&frame()).unwrap().unwrap();
        let name = asset.source_photo_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("photo_"), "{name}");
        assert!(name.ends_with("_000042.jpg"), "{name}");
        let captures = dir.path().join("captures");
        assert!(asset.source_photo_path.starts_with(captures));
        assert!(asset.source_photo_path.exists());

        let card = std::fs::read_to_string(kiosk.output_path()).unwrap();
        assert!(card.starts_with("SOLO KEEPER|ST|"));
        assert_eq!(kiosk.current_card().unwrap().output_path, asset.output_path);
    }

    #[test]
    fn test_empty_partition_leaves_no_current_card() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk(dir.path());
        kiosk.set_gender(Some(Gender::Male));

        let err = kiosk.handle_capture(&frame()).unwrap_err();
        assert!(matches!(err, KioskError::Select(SelectError::EmptyPool(_))));
        assert!(kiosk.current_card().is_none());
    }

    #[test]
    fn test_generate_with_unset_gender_uses_any_partition() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk(dir.path());
        let photo = kiosk.save_capture(&frame()).unwrap();
        let asset = kiosk.generate(&photo, None).unwrap();
        assert_eq!(asset.profile.name, "Solo Keeper");
    }

    #[test]
    fn test_missing_template_surfaces_composition_error() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk(dir.path());
        std::fs::remove_file(dir.path().join("card.tmpl")).unwrap();
        let photo = kiosk.save_capture(&frame()).unwrap();
        assert!(matches!(
            kiosk.generate(&photo, None),
            Err(KioskError::Composition(CompositionError::TemplateMissing(_)))
        ));
    }

    #[test]
    fn test_capture_during_generation_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let kiosk = Arc::new(kiosk_with(
            dir.path(),
            Parked {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            },
        ));

        let first = {
            let kiosk = Arc::clone(&kiosk);
            std::thread::spawn(move || kiosk.handle_capture(&frame_seq(30)))
        };
        entered.wait();

        assert!(kiosk.handle_capture(&frame_seq(60)).unwrap().is_none());
        assert_eq!(saved_photos(dir.path()), 1);

        release.wait();
        let asset = first.join().unwrap().unwrap().unwrap();
        let photo = asset.source_photo_path.to_string_lossy().into_owned();
        assert!(photo.ends_with("_000030.jpg"), "{photo}");
        let current = kiosk.current_card().unwrap();
        assert_eq!(current.source_photo_path, asset.source_photo_path);
    }

    #[test]
    fn test_captures_in_the_same_second_get_distinct_photos() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk(dir.path());
        let a = kiosk.save_capture(&frame_seq(30)).unwrap();
        let b = kiosk.save_capture(&frame_seq(60)).unwrap();
        assert_ne!(a, b);
        assert_eq!(saved_photos(dir.path()), 2);
    }

    #[test]
    fn test_saved_capture_is_mirrored_like_the_preview() {
        let dir = tempfile::tempdir().unwrap();
        let kiosk = kiosk(dir.path());
        // Left half black, right half white.
        let (w, h) = (16u32, 8u32);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for _ in 0..h {
            for x in 0..w {
                let v = if x < w / 2 { 0 } else { 255 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let path = kiosk.save_capture(&Frame::from_rgb(data, w, h, 7).unwrap()).unwrap();

        let saved = image::open(&path).unwrap().to_rgb8();
        let (left, right) = (saved.get_pixel(1, 4)[0], saved.get_pixel(w - 2, 4)[0]);
        assert!(left > 200, "left edge should be the old right half: {left}");
        assert!(right < 50, "right edge should be the old left half: {right}");
    }
}
