use anyhow::{Context, Result};
use rollcall_core::{EmbeddingModel, OnnxEmbedder, RecognitionEvent};
use rollcall_hw::Camera;
use rollcall_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod engine;
mod enroll;
mod roster;
mod sink;
#[cfg(test)]
mod testing;

use config::Config;
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use engine::{open_with_retries, FramePipeline, FrameScheduler, PipelineSettings};
use enroll::EnrollmentController;
use roster::Roster;
use sink::EventSink;

const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const EVENT_QUEUE: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        model = %config.model_path.display(),
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        cooldown_secs = config.cooldown_secs,
        sink = config.event_endpoint.as_deref().unwrap_or("disabled"),
        "configuration loaded"
    );

    // Retries sleep between attempts; keep them off the async workers.
    let model_path = config.model_path_str();
    let retries = config.startup_retries;
    let model = tokio::task::spawn_blocking(move || {
        open_with_retries("model", retries, RETRY_BACKOFF, || OnnxEmbedder::load(&model_path))
    })
    .await??;
    tracing::info!(
        input_size = model.input_size(),
        output_len = model.output_len(),
        layout = ?model.layout(),
        "embedding model loaded"
    );

    let store = SqliteStore::open(&config.db_path, &config.thumbnail_dir)
        .context("failed to open roster store")?;
    let roster = Arc::new(Roster::new(Box::new(store), Some(model.output_len())));
    roster.load().context("failed to load roster")?;

    let device = config.camera_device.clone();
    let opened = tokio::task::spawn_blocking(move || {
        open_with_retries("camera", retries, RETRY_BACKOFF, || Camera::open(&device))
    })
    .await?;
    let camera = match opened {
        Ok(camera) => camera,
        Err(e) => {
            for device in Camera::list_devices() {
                tracing::info!(path = %device.path, name = %device.name, driver = %device.driver, "available camera");
            }
            return Err(e.into());
        }
    };

    let (event_tx, event_rx) = mpsc::channel::<RecognitionEvent>(EVENT_QUEUE);
    let mut pipeline = FramePipeline::spawn(
        Box::new(model),
        Arc::clone(&roster),
        PipelineSettings {
            threshold: config.match_threshold,
            cooldown: config.cooldown(),
        },
        event_tx,
    )?;
    let mut scheduler = FrameScheduler::start(
        Box::new(camera),
        pipeline.handle(),
        config.force_still_capture,
        config.fallback_interval(),
    )?;

    let controller = Arc::new(EnrollmentController::new(
        Arc::clone(&roster),
        pipeline.latest(),
        config.thumbnail_size,
    ));
    let service = RollcallService::new(
        controller,
        pipeline.handle(),
        pipeline.status(),
        scheduler.mode_updates(),
        config.camera_device.clone(),
    );

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;
    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let sink = config
        .event_endpoint
        .as_deref()
        .map(|url| EventSink::new(url, config.event_timeout()))
        .transpose()?;
    let forwarder = tokio::spawn(forward_events(event_rx, conn.clone(), sink));

    tracing::info!(mode = ?scheduler.mode(), enrolled = roster.len(), "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    // Frame source first, then the worker, then the camera itself.
    scheduler.stop();
    pipeline.shutdown();
    drop(scheduler);
    forwarder.await?;

    Ok(())
}

/// Publish each debounced recognition as a D-Bus signal and to the sink.
async fn forward_events(
    mut events: mpsc::Receiver<RecognitionEvent>,
    conn: zbus::Connection,
    sink: Option<EventSink>,
) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "cannot emit signals; recognitions will not be published");
            return;
        }
    };

    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => {
                if let Err(e) = RollcallService::recognized(&emitter, &json).await {
                    tracing::warn!(name = %event.name, error = %e, "failed to emit Recognized");
                }
            }
            Err(e) => tracing::warn!(name = %event.name, error = %e, "failed to encode event"),
        }
        if let Some(sink) = &sink {
            sink.dispatch(event);
        }
    }
    tracing::debug!("event forwarder stopped");
}
