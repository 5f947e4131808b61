//! HTTP surface: `POST /hook` and `GET /healthz`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{info, warn};

use crate::lock::{BuildLock, LockGuard};
use crate::signature::{verify, SIGNATURE_HEADER};

pub const HOOK_ENDPOINT: &str = "/hook";
pub const HEALTH_ENDPOINT: &str = "/healthz";
pub const EVENT_HEADER: &str = "x-github-event";
/// Exported to the build script when the delivery names a commit.
pub const REVISION_ENV: &str = "BERTH_REVISION";

#[derive(Debug, Clone)]
pub struct HookSettings {
    pub secret: String,
    /// Only pushes to this ref trigger a build, e.g. `refs/heads/main`.
    pub git_ref: String,
    pub script: PathBuf,
    pub lock: PathBuf,
    pub stale_after: Duration,
}

pub struct HookState {
    settings: HookSettings,
    lock: BuildLock,
}

impl HookState {
    pub fn new(settings: HookSettings) -> Self {
        let lock = BuildLock::new(settings.lock.clone(), settings.stale_after);
        Self { settings, lock }
    }
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
}

pub fn router(state: Arc<HookState>) -> Router {
    Router::new()
        .route(HOOK_ENDPOINT, post(handle_hook))
        .route(HEALTH_ENDPOINT, get(handle_health))
        .with_state(state)
}

/// Listen on `bind` until ctrl-c or SIGTERM.
pub async fn serve(settings: HookSettings, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind push listener on {bind}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve push listener address")?;
    info!(
        addr = %local_addr,
        git_ref = %settings.git_ref,
        script = %settings.script.display(),
        "push listener ready"
    );

    let app = router(Arc::new(HookState::new(settings)));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("push listener exited unexpectedly")?;
    Ok(())
}

/// Resolves on ctrl-c, or on SIGTERM from systemd stopping the unit.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupted, shutting down"),
        _ = terminate => info!("terminated, shutting down"),
    }
}

async fn handle_health(State(state): State<Arc<HookState>>) -> Response {
    reply(
        StatusCode::OK,
        json!({
            "status": "ok",
            "in_flight": state.lock.is_held(),
            "ref": state.settings.git_ref,
        }),
    )
}

async fn handle_hook(
    State(state): State<Arc<HookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = header(&headers, SIGNATURE_HEADER);
    if let Err(e) = verify(state.settings.secret.as_bytes(), &body, signature) {
        warn!(error = %e, "rejected delivery");
        return reply(
            StatusCode::UNAUTHORIZED,
            json!({ "status": "unauthorized", "message": e.to_string() }),
        );
    }

    match header(&headers, EVENT_HEADER).unwrap_or_default() {
        "ping" => return reply(StatusCode::OK, json!({ "status": "pong" })),
        "push" => {}
        other => {
            return reply(
                StatusCode::ACCEPTED,
                json!({ "status": "ignored", "reason": format!("event `{other}` is not a push") }),
            )
        }
    }

    let payload: PushPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return reply(
                StatusCode::BAD_REQUEST,
                json!({ "status": "invalid", "message": e.to_string() }),
            )
        }
    };
    let pushed = payload.git_ref.unwrap_or_default();
    if pushed != state.settings.git_ref {
        return reply(
            StatusCode::ACCEPTED,
            json!({ "status": "ignored", "reason": format!("ref `{pushed}` is not tracked") }),
        );
    }

    let guard = match state.lock.try_acquire() {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            info!(git_ref = %pushed, "build already in flight; delivery collapsed");
            return reply(StatusCode::CONFLICT, json!({ "status": "in_flight" }));
        }
        Err(e) => {
            warn!(error = %e, lock = %state.lock.path().display(), "cannot take build lock");
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "status": "error", "message": e.to_string() }),
            );
        }
    };

    match spawn_build(&state.settings.script, guard, payload.after) {
        Ok(pid) => reply(
            StatusCode::ACCEPTED,
            json!({ "status": "started", "pid": pid }),
        ),
        Err(e) => {
            warn!(error = %e, script = %state.settings.script.display(), "cannot start build");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "status": "error", "message": e.to_string() }),
            )
        }
    }
}

/// Start `script` in the background; the lock is released when it exits.
fn spawn_build(
    script: &Path,
    guard: LockGuard,
    revision: Option<String>,
) -> std::io::Result<Option<u32>> {
    let mut command = Command::new(script);
    command.stdin(Stdio::null());
    if let Some(revision) = &revision {
        command.env(REVISION_ENV, revision);
    }
    let mut child = command.spawn()?;
    let pid = child.id();
    info!(pid = ?pid, revision = ?revision, "build started");

    tokio::spawn(async move {
        let _guard = guard;
        match child.wait().await {
            Ok(status) if status.success() => info!(pid = ?pid, "build finished"),
            Ok(status) => warn!(pid = ?pid, status = %status, "build failed"),
            Err(e) => warn!(pid = ?pid, error = %e, "build could not be awaited"),
        }
    });
    Ok(pid)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}
