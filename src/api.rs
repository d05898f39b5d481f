// HTTP + WebSocket surface.
//
// Handlers only translate requests into reads of `ControllerShared` and
// calls on the transcode manager; no playout decisions are made here.

use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use sysinfo::System;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::channel::TuneCommand;
use crate::controller::ControllerShared;
use crate::encoder::InputSource;
use crate::error::{EngineError, EngineResult};
use crate::status::StatusSnapshot;
use crate::transcode::{StreamTranscodeManager, PLAYLIST_NAME};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub controller: Arc<ControllerShared>,
    pub transcode: Arc<StreamTranscodeManager>,
    pub sys: Arc<tokio::sync::Mutex<System>>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/status", get(status))
        .route("/api/channel/:target", post(change_channel))
        .route("/api/system", get(system_info))
        .route("/hls/:id/:file", get(hls_file))
        .route("/live", get(live))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then cancel playout before draining so
/// open `/live` bodies end with their encoders.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            cancel.cancel();
        })
        .await
}

async fn root() -> &'static str {
    "FieldStation engine is running. Try /api/status"
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.controller.snapshot())
}

/// `up`, `down` or a channel number.
async fn change_channel(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> EngineResult<Json<serde_json::Value>> {
    let command = match target.as_str() {
        "up" => TuneCommand::Up,
        "down" => TuneCommand::Down,
        other => {
            let channel = other
                .parse::<u32>()
                .map_err(|_| EngineError::InvalidRequest(format!("bad channel: {other}")))?;
            TuneCommand::Direct { channel }
        }
    };
    let channel = state.controller.request(command)?;
    Ok(Json(json!({"status": "ok", "channel": channel})))
}

/// Which encoder input a stream id stands for.
fn stream_input_for(state: &AppState, id: &str) -> EngineResult<InputSource> {
    if id.starts_with("guide") {
        return Ok(InputSource::Guide);
    }
    if id == "placeholder" {
        return Ok(InputSource::Placeholder);
    }
    id.strip_prefix("channel_")
        .and_then(|n| n.parse::<u32>().ok())
        .map(|n| state.controller.stream_input(n))
        .ok_or_else(|| EngineError::StreamNotFound(id.to_string()))
}

async fn hls_file(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> EngineResult<Response> {
    if file == PLAYLIST_NAME {
        let input = stream_input_for(&state, &id)?;
        state.transcode.get_or_create_stream(&id, input).await?;
        let body = state.transcode.serve_playlist(&id).await?;
        return Ok((
            [
                (CONTENT_TYPE, "application/vnd.apple.mpegurl"),
                (CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response());
    }

    let body = state.transcode.serve_segment(&id, &file).await?;
    Ok(([(CONTENT_TYPE, "video/mp2t")], body).into_response())
}

/// Fragmented MP4 of whatever the tuned channel is showing.
async fn live(State(state): State<AppState>) -> EngineResult<Response> {
    let player = state
        .controller
        .current_player()
        .ok_or_else(|| EngineError::StreamNotFound("nothing is playing".into()))?;
    let stdout = player.open_live_feed().await?;
    Ok((
        [(CONTENT_TYPE, "video/mp4"), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(ReaderStream::new(stdout)),
    )
        .into_response())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Push every status snapshot to the client; accept tune commands back.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = state.controller.subscribe();

    if let Ok(initial) = serde_json::to_string(&state.controller.snapshot()) {
        if sender.send(Message::Text(initial)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(snapshot) => {
                    let Ok(text) = serde_json::to_string(&snapshot) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("ws client lagged {n} status updates"),
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(command) = TuneCommand::parse(&text) {
                        if let Err(e) = state.controller.request(command) {
                            warn!("ws command {command:?} rejected: {e}");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("ws receive error: {e}");
                    break;
                }
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    arch: String,
    cpu_model: String,
    cpu_cores: usize,
    load_1m: f32,
    load_5m: f32,
    load_15m: f32,
    hostname: Option<String>,
    stream_sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Serialize)]
struct SessionInfo {
    id: String,
    instance: String,
    input: String,
    idle_secs: u64,
    pid: Option<u32>,
}

async fn system_info(State(st): State<AppState>) -> Json<SystemInfo> {
    let mut stream_sessions = Vec::new();
    for session in st.transcode.sessions() {
        stream_sessions.push(SessionInfo {
            id: session.id().to_string(),
            instance: session.instance().to_string(),
            input: session.input().describe(),
            idle_secs: session.idle_for().as_secs(),
            pid: session.encoder_pid().await,
        });
    }

    let mut sys = st.sys.lock().await;
    sys.refresh_cpu_all();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "Unknown CPU".to_string());
    let la = System::load_average();

    Json(SystemInfo {
        name: "FieldStation Engine".to_string(),
        version: st.version.clone(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_model,
        cpu_cores: sys.cpus().len(),
        load_1m: la.one as f32,
        load_5m: la.five as f32,
        load_15m: la.fifteen as f32,
        hostname: System::host_name(),
        stream_sessions,
    })
}
