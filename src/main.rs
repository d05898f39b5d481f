mod api;
mod catalog;
mod channel;
mod config;
mod controller;
mod encoder;
mod error;
mod player;
mod reception;
mod schedule;
mod station;
mod status;
mod transcode;

use std::sync::Arc;

use sysinfo::System;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{build_router, serve, AppState};
use crate::catalog::CatalogSet;
use crate::channel::ChannelSignal;
use crate::config::EngineConfig;
use crate::controller::{ChannelController, ControllerShared};
use crate::encoder::{EncoderLauncher, FfmpegLauncher};
use crate::player::PlayerContext;
use crate::reception::ReceptionStatus;
use crate::schedule::ScheduleResolver;
use crate::station::StationLineup;
use crate::transcode::StreamTranscodeManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = EngineConfig::from_env()?;

    // Nothing to control without stations.
    let lineup = Arc::new(StationLineup::load(&cfg.stations_path)?);
    info!("{} station(s) from {}", lineup.len(), cfg.stations_path.display());

    let resolver = Arc::new(ScheduleResolver::load(&lineup, &cfg.schedule_dir));
    let catalogs = Arc::new(CatalogSet::load(&lineup, &cfg.schedule_dir));

    let launcher: Arc<dyn EncoderLauncher> = Arc::new(FfmpegLauncher::new(cfg.ffmpeg.clone()));
    let transcode = Arc::new(StreamTranscodeManager::new(cfg.transcode.clone(), launcher.clone()));

    let cancel = CancellationToken::new();
    let (status_tx, _status_rx) = broadcast::channel(64);
    let signal = Arc::new(ChannelSignal::new(0, cfg.command_file.clone()));

    let ctx = Arc::new(PlayerContext {
        resolver,
        catalogs,
        launcher,
        signal: signal.clone(),
        reception: Arc::new(parking_lot::Mutex::new(ReceptionStatus::default())),
        status_tx: status_tx.clone(),
        timing: cfg.player.clone(),
        cancel: cancel.clone(),
    });
    let shared = Arc::new(ControllerShared::new(lineup.clone(), signal, status_tx));

    let controller = ChannelController::new(shared.clone(), ctx, cfg.transition, cfg.static_clip.clone());
    let controller_task = tokio::spawn(controller.run(0));
    let reaper_task = transcode.clone().spawn_reaper(cancel.clone());

    let state = AppState {
        version: version.clone(),
        controller: shared,
        transcode: transcode.clone(),
        sys: Arc::new(tokio::sync::Mutex::new(System::new())),
    };
    let app = build_router(state);

    info!("FieldStation engine {version} starting on http://{}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    serve(listener, app, shutdown_signal(), cancel.clone()).await?;

    cancel.cancel();
    if let Err(e) = controller_task.await {
        warn!("controller task ended abnormally: {e}");
    }
    if let Err(e) = reaper_task.await {
        warn!("reaper task ended abnormally: {e}");
    }
    transcode.shutdown().await;
    info!("FieldStation engine stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("no SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
