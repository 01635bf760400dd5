//! In-process stand-in for the render worker.
//!
//! Speaks the worker's HTTP contract on a loopback port and ships as the
//! `stub_worker` binary, so the supervisor can be exercised end to end
//! without the real rendering toolchain installed.

use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::script::Character;

#[derive(Clone)]
struct StubState {
    /// Fixed roster, generated once so ids are stable for a process run.
    cast: Arc<Vec<Character>>,
    api_key: Arc<Mutex<Option<String>>>,
}

fn builtin_cast() -> Vec<Character> {
    vec![
        Character::new("Reimu").with_voice("reimu"),
        Character::new("Marisa").with_voice("marisa"),
        Character::new("Zundamon").with_voice("zundamon"),
    ]
}

pub fn router() -> Router {
    let state = StubState {
        cast: Arc::new(builtin_cast()),
        api_key: Arc::new(Mutex::new(None)),
    };
    Router::new()
        .route("/health", get(health))
        .route("/config/api-key", post(set_api_key))
        .route("/characters", get(characters))
        .route("/render", post(render))
        .with_state(state)
}

/// Serve the stub on the given listener until the process is killed.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "stub worker listening");
    axum::serve(listener, router()).await
}

async fn health(State(state): State<StubState>) -> Json<Value> {
    let api_key_set = state
        .api_key
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some();
    Json(json!({"status": "ok", "api_key_set": api_key_set}))
}

async fn set_api_key(
    State(state): State<StubState>,
    body: Option<Json<Value>>,
) -> (StatusCode, Json<Value>) {
    let key = body
        .as_ref()
        .and_then(|Json(body)| body.get("api_key"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|key| !key.is_empty());
    let Some(key) = key else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "api_key is required"})),
        );
    };

    *state
        .api_key
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(key.to_string());
    info!("stub API key configured");
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn characters(State(state): State<StubState>) -> Json<Vec<Character>> {
    Json(state.cast.as_ref().clone())
}

async fn render(body: Option<Json<Value>>) -> (StatusCode, Json<Value>) {
    let Some(Json(job)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "render request must be JSON"})),
        );
    };

    let lines = job
        .get("lines")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if lines == 0 {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "script has no lines"})),
        );
    }

    let title = job.get("title").and_then(Value::as_str).unwrap_or("untitled");
    info!(title, lines, "stub render accepted");

    let video = format!("/videos/{}.mp4", Uuid::new_v4());
    (StatusCode::OK, Json(json!({"video_url": video})))
}
