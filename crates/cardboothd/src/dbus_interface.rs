use crate::kiosk::Kiosk;
use crate::session::SessionStatus;
use cardbooth_core::{CommandRemover, Gender};
use cardbooth_hw::Frame;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.cardbooth.Kiosk1";
pub const OBJECT_PATH: &str = "/org/cardbooth/Kiosk1";

/// D-Bus interface for the card kiosk daemon.
///
/// Bus name: org.cardbooth.Kiosk1
/// Object path: /org/cardbooth/Kiosk1
pub struct KioskService {
    pub kiosk: Arc<Kiosk<Option<CommandRemover>>>,
    pub session: watch::Receiver<SessionStatus>,
    pub frames: watch::Receiver<Option<Arc<Frame>>>,
    /// Selected camera, or `None` when running in upload-only mode.
    pub camera: Option<String>,
}

#[interface(name = "org.cardbooth.Kiosk1")]
impl KioskService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let s = self.session.borrow().clone();
        let latest = self.frames.borrow().clone();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera.as_deref().unwrap_or("none"),
            "capturing": s.running,
            "aligned": s.aligned,
            "consecutive": s.consecutive,
            "frames_read": s.frames_read,
            "read_failures": s.read_failures,
            "last_error": s.last_error,
            "latest_frame": latest.map(|f| serde_json::json!({
                "sequence": f.sequence,
                "width": f.width,
                "height": f.height,
                "age_ms": f.captured_at.elapsed().as_millis() as u64,
            })),
            "gender": self.kiosk.gender().map(|g| g.to_string()),
            "current_card": self.kiosk.current_card().map(|c| c.output_path),
        })
        .to_string())
    }

    /// Path of the most recently generated card.
    async fn current_card(&self) -> zbus::fdo::Result<String> {
        self.kiosk
            .current_card()
            .map(|c| c.output_path.display().to_string())
            .ok_or_else(|| zbus::fdo::Error::Failed("no card generated yet".into()))
    }

    /// Set the catalog partition for camera-triggered cards. An empty tag
    /// selects from every partition.
    async fn set_gender(&self, tag: &str) -> zbus::fdo::Result<()> {
        let gender = Gender::parse_tag(tag).map_err(zbus::fdo::Error::InvalidArgs)?;
        self.kiosk.set_gender(gender);
        Ok(())
    }

    /// Compose a card from an uploaded photo. This is the path used when no
    /// camera could be opened.
    async fn compose_from_photo(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
        path: &str,
        tag: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(path, tag, "compose_from_photo requested");
        let gender = Gender::parse_tag(tag).map_err(zbus::fdo::Error::InvalidArgs)?;
        let photo = PathBuf::from(path);
        let kiosk = Arc::clone(&self.kiosk);

        let asset = tokio::task::spawn_blocking(move || kiosk.generate(&photo, gender))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("composition task failed: {e}")))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        let output = asset.output_path.display().to_string();
        if let Err(e) = Self::card_ready(&emitter, &output).await {
            tracing::warn!(error = %e, "failed to emit CardReady");
        }
        Ok(output)
    }

    /// Emitted after every successful composition.
    #[zbus(signal)]
    pub async fn card_ready(emitter: &SignalEmitter<'_>, path: &str) -> zbus::Result<()>;
}
