use anyhow::{Context, Result};
use cardbooth_core::{
    AlignmentGate, CardCompositor, Catalog, CommandRemover, PlayerSelector, ScrfdLocator,
};
use cardbooth_hw::{FrameSource, V4lOpener};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod kiosk;
mod session;

use config::{BusKind, Config};
use dbus_interface::{KioskService, BUS_NAME, OBJECT_PATH};
use kiosk::Kiosk;
use session::{CaptureEvent, CaptureSession};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("cardboothd starting");
    let config = Config::from_env();

    let catalog = Catalog::load(&config.catalog_path)
        .with_context(|| format!("loading catalog {}", config.catalog_path.display()))?;

    let remover =
        CommandRemover::from_command_line(&config.background_command, &config.work_dir);
    if remover.is_none() {
        tracing::warn!("background removal disabled; cards will use the raw photo");
    }
    let kiosk = Arc::new(Kiosk::new(
        PlayerSelector::new(catalog),
        CardCompositor::new(config.compositor(), remover),
        config.capture_dir.clone(),
    ));

    let mut session = CaptureSession::new(config.session());
    let (camera, mut events) = match start_capture(&config, &mut session) {
        Ok((camera, events)) => (Some(camera), Some(events)),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "camera capture unavailable; only photo uploads can produce cards"
            );
            (None, None)
        }
    };

    let service = KioskService {
        kiosk: Arc::clone(&kiosk),
        session: session.subscribe_status(),
        frames: session.subscribe_frames(),
        camera,
    };
    let conn = match connect_bus(config.bus, service).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "D-Bus interface unavailable; continuing without it"
            );
            None
        }
    };

    tracing::info!(output = %kiosk.output_path().display(), "cardboothd ready");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = next_event(&mut events) => match event {
                Some(event) => {
                    tokio::spawn(handle_capture(Arc::clone(&kiosk), conn.clone(), event));
                }
                None => {
                    tracing::warn!("capture loop ended");
                    events = None;
                }
            },
        }
    }

    tracing::info!(state = ?session.state(), "cardboothd shutting down");
    tokio::task::block_in_place(|| session.stop());
    let status = session.status();
    tracing::info!(
        frames = status.frames_read,
        read_failures = status.read_failures,
        "capture totals"
    );
    Ok(())
}

/// Load the face locator, walk the camera ladder and start the session.
fn start_capture(
    config: &Config,
    session: &mut CaptureSession,
) -> Result<(String, mpsc::UnboundedReceiver<CaptureEvent>)> {
    let model_path = config.scrfd_model_path();
    let locator = ScrfdLocator::load(&model_path)?;
    tracing::info!(path = %model_path.display(), "SCRFD locator loaded");

    let (_, camera) = cardbooth_hw::discover(&mut V4lOpener, &config.discovery())?;
    let described = camera.describe();

    let events = session.start(camera, AlignmentGate::new(locator))?;
    Ok((described, events))
}

async fn connect_bus(kind: BusKind, service: KioskService) -> Result<Option<zbus::Connection>> {
    let builder = match kind {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Disabled => return Ok(None),
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    tracing::info!(
        name = BUS_NAME,
        path = OBJECT_PATH,
        "D-Bus interface registered"
    );
    Ok(Some(conn))
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<CaptureEvent>>,
) -> Option<CaptureEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Run the card pipeline for one capture on a blocking worker, off the
/// acquisition thread. Captures that arrive mid-generation are dropped by
/// the kiosk.
async fn handle_capture(
    kiosk: Arc<Kiosk<Option<CommandRemover>>>,
    conn: Option<zbus::Connection>,
    event: CaptureEvent,
) {
    let frame = event.frame;
    let result = tokio::task::spawn_blocking(move || kiosk.handle_capture(&frame)).await;

    let asset = match result {
        Ok(Ok(Some(asset))) => asset,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "card generation failed");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "card generation task panicked");
            return;
        }
    };

    let Some(conn) = conn else {
        return;
    };
    let output = asset.output_path.display().to_string();
    let emitted = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => KioskService::card_ready(&emitter, &output).await,
        Err(e) => Err(e),
    };
    if let Err(e) = emitted {
        tracing::warn!(error = %e, "failed to emit CardReady");
    }
}
