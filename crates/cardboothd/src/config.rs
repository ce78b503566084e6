use crate::session::SessionConfig;
use cardbooth_core::CompositorConfig;
use cardbooth_hw::{Backend, DiscoveryConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Which message bus the kiosk interface is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
    Disabled,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera indices `0..device_count` are probed.
    pub device_count: u32,
    /// Backend order tried for each index, most preferred first.
    pub backends: Vec<Backend>,
    pub width: u32,
    pub height: u32,
    /// Reads per candidate before it is rejected as dark.
    pub warmup_attempts: usize,
    pub min_brightness: f32,
    pub warmup_interval_ms: u64,
    /// Acquisition loop period.
    pub frame_interval_ms: u64,
    /// Consecutive aligned frames before a capture.
    pub debounce_threshold: u32,
    pub stop_timeout_ms: u64,
    /// Directory containing the SCRFD model.
    pub model_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub template_path: PathBuf,
    pub garment_path: PathBuf,
    /// Scratch files: cutouts and the composite image.
    pub work_dir: PathBuf,
    /// The single current-card output file.
    pub output_path: PathBuf,
    /// Saved capture photos.
    pub capture_dir: PathBuf,
    /// External background-removal command; empty disables it.
    pub background_command: String,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `CARDBOOTH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = match var("CARDBOOTH_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let share = match var("XDG_DATA_HOME") {
                    Some(xdg) => PathBuf::from(xdg),
                    None => {
                        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    }
                };
                share.join("cardbooth")
            }
        };
        let path = |key: &str, default: &str| match var(key) {
            Some(p) => PathBuf::from(p),
            None => data_dir.join(default),
        };

        Self {
            device_count: parse_or(&var, "CARDBOOTH_DEVICE_COUNT", 2),
            backends: var("CARDBOOTH_BACKENDS")
                .map(|v| parse_backends(&v))
                .unwrap_or_else(|| Backend::DEFAULT_ORDER.to_vec()),
            width: parse_or(&var, "CARDBOOTH_WIDTH", 1280),
            height: parse_or(&var, "CARDBOOTH_HEIGHT", 720),
            warmup_attempts: parse_or(&var, "CARDBOOTH_WARMUP_ATTEMPTS", 15),
            min_brightness: parse_or(&var, "CARDBOOTH_MIN_BRIGHTNESS", 10.0),
            warmup_interval_ms: parse_or(&var, "CARDBOOTH_WARMUP_INTERVAL_MS", 100),
            frame_interval_ms: parse_or(&var, "CARDBOOTH_FRAME_INTERVAL_MS", 30),
            debounce_threshold: parse_or(&var, "CARDBOOTH_DEBOUNCE_FRAMES", 30),
            stop_timeout_ms: parse_or(&var, "CARDBOOTH_STOP_TIMEOUT_MS", 2000),
            model_dir: path("CARDBOOTH_MODEL_DIR", "models"),
            catalog_path: path("CARDBOOTH_CATALOG", "players.json"),
            template_path: path("CARDBOOTH_TEMPLATE", "card_template.svg"),
            garment_path: path("CARDBOOTH_GARMENT", "jersey.png"),
            work_dir: path("CARDBOOTH_WORK_DIR", "work"),
            output_path: path("CARDBOOTH_OUTPUT", "current_card.svg"),
            capture_dir: path("CARDBOOTH_CAPTURE_DIR", "captures"),
            background_command: var("CARDBOOTH_BACKGROUND_COMMAND")
                .unwrap_or_else(|| "rembg i".to_string()),
            bus: match var("CARDBOOTH_DBUS").as_deref().map(str::trim) {
                Some("system") => BusKind::System,
                Some("0") | Some("off") | Some("none") => BusKind::Disabled,
                _ => BusKind::Session,
            },
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            device_count: self.device_count,
            backends: self.backends.clone(),
            width: self.width,
            height: self.height,
            warmup_attempts: self.warmup_attempts,
            min_brightness: self.min_brightness,
            warmup_interval: Duration::from_millis(self.warmup_interval_ms),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            debounce_threshold: self.debounce_threshold,
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }

    pub fn compositor(&self) -> CompositorConfig {
        CompositorConfig {
            template_path: self.template_path.clone(),
            garment_path: self.garment_path.clone(),
            work_dir: self.work_dir.clone(),
            output_path: self.output_path.clone(),
        }
    }
}

/// Parse a comma-separated backend list, keeping its order.
///
/// Unknown names are skipped with a warning; an empty result falls back
/// to the default order.
pub fn parse_backends(list: &str) -> Vec<Backend> {
    let mut backends = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name.parse::<Backend>() {
            Ok(b) if !backends.contains(&b) => backends.push(b),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring camera backend"),
        }
    }
    if backends.is_empty() {
        tracing::warn!(
            list,
            "no usable camera backends configured; using default order"
        );
        return Backend::DEFAULT_ORDER.to_vec();
    }
    backends
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
