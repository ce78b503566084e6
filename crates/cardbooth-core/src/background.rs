//! Background removal seam.
//!
//! Segmentation itself is an external service; this module only defines
//! the call boundary and a subprocess-backed implementation.

use image::{DynamicImage, RgbaImage};
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("background removal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background removal image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("background removal command failed: {0}")]
    CommandFailed(String),
}

/// Produces a cut-out of the subject with a transparent background.
pub trait BackgroundRemover {
    fn remove_background(&self, image: &DynamicImage) -> Result<RgbaImage, BackgroundError>;
}

/// Runs an external program as `<program> <args...> <input> <output>`.
///
/// Input and output use fixed file names in the work directory, so
/// consecutive runs overwrite each other.
#[derive(Debug, Clone)]
pub struct CommandRemover {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl CommandRemover {
    pub const INPUT_FILE: &'static str = "cutout_input.png";
    pub const OUTPUT_FILE: &'static str = "cutout.png";

    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            work_dir: work_dir.into(),
        }
    }

    /// Build from a whitespace-separated command line, e.g. `"rembg i"`.
    pub fn from_command_line(command: &str, work_dir: impl Into<PathBuf>) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), work_dir))
    }
}

impl BackgroundRemover for CommandRemover {
    fn remove_background(&self, image: &DynamicImage) -> Result<RgbaImage, BackgroundError> {
        std::fs::create_dir_all(&self.work_dir)?;
        let input = self.work_dir.join(Self::INPUT_FILE);
        let output = self.work_dir.join(Self::OUTPUT_FILE);
        image.save(&input)?;
        if output.exists() {
            std::fs::remove_file(&output)?;
        }

        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(&input)
            .arg(&output)
            .output()?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(BackgroundError::CommandFailed(format!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                stderr.trim()
            )));
        }

        Ok(image::open(&output)?.to_rgba8())
    }
}

/// `None` means background removal is disabled; every call fails and the
/// compositor falls back to the raw photo.
impl<R: BackgroundRemover> BackgroundRemover for Option<R> {
    fn remove_background(&self, image: &DynamicImage) -> Result<RgbaImage, BackgroundError> {
        match self {
            Some(remover) => remover.remove_background(image),
            None => Err(BackgroundError::CommandFailed(
                "background removal disabled".into(),
            )),
        }
    }
}
