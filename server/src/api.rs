use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use common::{cell, Delta};

use crate::config::Config;
use crate::error::ApiError;
use crate::guard::{client_identity, AdmissionGuard};
use crate::hub::Hub;
use crate::store::StateStore;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub hub: Arc<Hub>,
    pub guard: Arc<AdmissionGuard>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/state/chunk", get(get_chunk))
        .route("/state/seq", get(get_seq))
        .route("/paint", post(post_paint))
        .route("/sub", get(subscribe))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Deserialize)]
struct ChunkQuery {
    cx: i64,
    cy: i64,
}

#[derive(Debug, Deserialize)]
pub struct PaintRequest {
    pub lat: f64,
    pub lon: f64,
    pub cx: i64,
    pub cy: i64,
    pub o: u32,
    pub color: u8,
    #[serde(default, rename = "turnstileToken")]
    pub turnstile_token: String,
}

#[derive(Debug, Serialize)]
pub struct PaintResponse {
    pub ok: bool,
    pub seq: u64,
    pub ts: i64,
}

/// GET /state/chunk?cx=&cy= — byte-exact snapshot for late joiners.
async fn get_chunk(
    State(state): State<AppState>,
    Query(q): Query<ChunkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (bits, seq) = state.store.read(q.cx, q.cy).await?;
    debug_assert_eq!(bits.len(), cell::CHUNK_BYTES);

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::HeaderName::from_static("x-seq"), seq.to_string()),
            (
                header::CACHE_CONTROL,
                "public, max-age=2, stale-while-revalidate=8".to_string(),
            ),
        ],
        bits,
    ))
}

/// GET /state/seq?cx=&cy= — cheap staleness probe: the chunk's current
/// sequence without the 32 KiB body.
async fn get_seq(
    State(state): State<AppState>,
    Query(q): Query<ChunkQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let seq = state.store.seq_of(q.cx, q.cy).await?;
    Ok(Json(serde_json::json!({
        "cx": q.cx,
        "cy": q.cy,
        "seq": seq
    })))
}

/// POST /paint — admission, atomic cell write, then delta fan-out.
async fn post_paint(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    payload: Result<Json<PaintRequest>, JsonRejection>,
) -> Result<Json<PaintResponse>, ApiError> {
    // Any body problem, malformed JSON or a field of the wrong shape,
    // is the client's 400.
    let Json(req) = payload.map_err(|e| ApiError::BadInput(e.to_string()))?;

    if req.o as usize >= cell::CHUNK_CELLS {
        return Err(ApiError::BadInput("o out of range".into()));
    }
    if req.color > cell::MAX_COLOR {
        return Err(ApiError::BadInput("invalid color".into()));
    }
    if !req.lat.is_finite() || !req.lon.is_finite() {
        return Err(ApiError::BadInput("invalid coordinates".into()));
    }
    let o = req.o as u16;

    let identity = client_identity(&headers, peer, state.config.trust_proxy_headers);

    state
        .guard
        .admit(
            &identity,
            &req.turnstile_token,
            req.lat,
            req.lon,
            req.cx,
            req.cy,
            o,
        )
        .await?;

    let outcome = state.store.paint(req.cx, req.cy, o, req.color).await?;

    // The write is durable for this process; only now does the client
    // spend its cooldown and move its speed anchor.
    state.guard.commit(&identity, req.lat, req.lon).await;

    state
        .hub
        .publish(
            req.cx,
            req.cy,
            Delta {
                seq: outcome.seq,
                o,
                color: req.color,
                ts: outcome.ts,
            },
        )
        .await;

    tracing::debug!(
        cx = req.cx,
        cy = req.cy,
        o,
        color = req.color,
        seq = outcome.seq,
        "paint accepted"
    );

    Ok(Json(PaintResponse {
        ok: true,
        seq: outcome.seq,
        ts: outcome.ts,
    }))
}

/// GET /sub?cx=&cy= — WebSocket upgrade into a chunk room.
async fn subscribe(
    State(state): State<AppState>,
    Query(q): Query<ChunkQuery>,
    ws_upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let write_buffer = state.config.ws_write_buffer_bytes;
    ws_upgrade
        .max_message_size(512)
        .write_buffer_size(write_buffer)
        .on_upgrade(move |socket| ws::serve_subscriber(socket, state, q.cx, q.cy))
}

/// GET /healthz — 200 only while the state store is reachable.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.healthy().await {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    } else {
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "status": "store unreachable" })),
        )
            .into_response()
    }
}
