use anyhow::{Context, Result};
use rollcall_core::{
    Announcer, AttendanceLedger, AttendanceSystem, Devices, LogAnnouncer, PipelineOptions, Roster,
    SpeechInput,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod adapters;
mod config;
mod dbus_interface;
mod engine;

use config::{Bus, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;

    // A corrupt store must stop startup rather than run with a partial roster.
    let roster = Roster::open(&config.store_path)
        .with_context(|| format!("loading embedding store {}", config.store_path.display()))?;
    let status = roster.status();
    tracing::info!(
        embeddings = status.embeddings,
        identities = status.identities,
        trained = status.trained,
        "roster ready"
    );

    let ledger = AttendanceLedger::open(&config.ledger_path)
        .with_context(|| format!("opening ledger {}", config.ledger_path.display()))?;

    let speech: Box<dyn SpeechInput> = match &config.listen_cmd {
        Some(cmd) => Box::new(adapters::CommandListener::new(cmd.clone())),
        None => {
            tracing::warn!("no listen command configured; enrollment requires a typed name");
            Box::new(adapters::NoSpeech)
        }
    };
    let announcer: Arc<dyn Announcer> = match &config.speak_cmd {
        Some(cmd) => Arc::new(adapters::CommandAnnouncer::spawn(cmd.clone())?),
        None => Arc::new(LogAnnouncer),
    };
    let devices = Devices {
        camera: Box::new(adapters::CommandCamera::new(config.capture_cmd.clone())),
        encoder: Box::new(adapters::CommandEncoder::new(config.encoder_cmd.clone())),
        speech,
    };
    let options = PipelineOptions {
        listen_timeout: config.listen_timeout(),
        min_confidence: config.min_confidence,
    };
    if let Some(threshold) = options.min_confidence {
        tracing::info!(threshold, "open-set rejection enabled");
    }

    let system = AttendanceSystem::new(roster, ledger, devices, announcer, options);
    let engine = engine::spawn_engine(system)?;

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService { engine })?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
