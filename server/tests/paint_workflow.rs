//! Full-stack paint workflow tests: HTTP admission and snapshots via the
//! router, delta fan-out over a real WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use futures::{Stream, StreamExt};
use http_body_util::BodyExt;
use tokio_tungstenite::tungstenite::protocol::Message;
use tower::ServiceExt;

use common::{cell, coords};
use server::api::{self, AppState};
use server::config::Config;
use server::guard::AdmissionGuard;
use server::hub::Hub;
use server::store::StateStore;

const BOSTON: (f64, f64) = (42.3601, -71.0589);
const NYC: (f64, f64) = (40.7128, -74.0060);

fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".into(),
        state_store_url: "memory://".into(),
        mask_path: None,
        mask_bounds: None,
        paint_cooldown_ms: 5000,
        geofence_radius_m: 300.0,
        speed_max_kmh: 150.0,
        enable_token_check: false,
        token_secret: String::new(),
        ws_write_buffer_bytes: 65536,
        ws_ping_interval_s: 20,
        ws_idle_timeout_s: 60,
        sub_outbox_cap: 256,
        trust_proxy_headers: true,
    }
}

async fn test_state(config: Config) -> AppState {
    AppState {
        store: Arc::new(StateStore::connect("memory://").await.unwrap()),
        hub: Arc::new(Hub::new(config.sub_outbox_cap)),
        guard: Arc::new(AdmissionGuard::new(&config, None, None)),
        config: Arc::new(config),
    }
}

/// Chunk/offset of the cell directly under a lat/lon point.
fn cell_under(lat: f64, lon: f64) -> (i64, i64, u16) {
    let (x, y) = coords::lat_lon_to_tile(lat, lon);
    let (cx, cy) = coords::chunk_of(x, y);
    (cx, cy, coords::offset_of(x, y))
}

fn paint_body(lat: f64, lon: f64, cx: i64, cy: i64, o: u16, color: u8) -> String {
    serde_json::json!({
        "lat": lat,
        "lon": lon,
        "cx": cx,
        "cy": cy,
        "o": o,
        "color": color,
        "turnstileToken": ""
    })
    .to_string()
}

fn paint_request(body: String, peer: &str) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/paint")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn chunk_request(cx: i64, cy: i64) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/state/chunk?cx={cx}&cy={cy}"))
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn empty_chunk_snapshot_is_all_zeroes() {
    let app = api::router(test_state(test_config()).await);

    let response = app.oneshot(chunk_request(0, 0)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-seq").unwrap().to_str().unwrap(),
        "0"
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap(),
        "application/octet-stream"
    );
    assert_eq!(
        response
            .headers()
            .get(header::CACHE_CONTROL)
            .unwrap()
            .to_str()
            .unwrap(),
        "public, max-age=2, stale-while-revalidate=8"
    );

    let bytes = body_bytes(response).await;
    assert_eq!(bytes.len(), cell::CHUNK_BYTES);
    assert!(bytes.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn accepted_paint_is_visible_in_the_snapshot() {
    let app = api::router(test_state(test_config()).await);
    let (lat, lon) = BOSTON;
    let (cx, cy, o) = cell_under(lat, lon);

    let response = app
        .clone()
        .oneshot(paint_request(paint_body(lat, lon, cx, cy, o, 5), "10.1.1.1:9000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["seq"], 1);
    assert!(body["ts"].as_i64().unwrap() > 0);

    let snapshot = app.oneshot(chunk_request(cx, cy)).await.unwrap();
    assert_eq!(
        snapshot.headers().get("x-seq").unwrap().to_str().unwrap(),
        "1"
    );
    let bytes = body_bytes(snapshot).await;
    assert_eq!(cell::get(&bytes, o as usize), 5);
}

#[tokio::test]
async fn second_rapid_paint_hits_the_cooldown() {
    let app = api::router(test_state(test_config()).await);
    let (lat, lon) = BOSTON;
    let (cx, cy, o) = cell_under(lat, lon);

    let first = app
        .clone()
        .oneshot(paint_request(paint_body(lat, lon, cx, cy, o, 5), "10.1.1.1:9000"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(paint_request(paint_body(lat, lon, cx, cy, o, 7), "10.1.1.1:9001"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=5).contains(&retry_after));
    assert_eq!(body_bytes(second).await, b"cooldown");

    // The rejected paint left the chunk untouched.
    let snapshot = app.oneshot(chunk_request(cx, cy)).await.unwrap();
    assert_eq!(
        snapshot.headers().get("x-seq").unwrap().to_str().unwrap(),
        "1"
    );
    let bytes = body_bytes(snapshot).await;
    assert_eq!(cell::get(&bytes, o as usize), 5);
}

#[tokio::test]
async fn forwarded_for_identities_cool_down_independently() {
    let app = api::router(test_state(test_config()).await);
    let (lat, lon) = BOSTON;
    let (cx, cy, o) = cell_under(lat, lon);

    // Same peer socket, two different forwarded clients.
    for (client_ip, expected) in [
        ("198.51.100.1", StatusCode::OK),
        ("198.51.100.2", StatusCode::OK),
        ("198.51.100.1", StatusCode::TOO_MANY_REQUESTS),
    ] {
        let mut request = paint_request(paint_body(lat, lon, cx, cy, o, 5), "10.0.0.1:9000");
        request
            .headers_mut()
            .insert("x-forwarded-for", client_ip.parse().unwrap());
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), expected, "client {client_ip}");
    }
}

#[tokio::test]
async fn distant_cell_paint_is_rejected_by_radius() {
    let app = api::router(test_state(test_config()).await);
    let (lat, lon) = BOSTON;
    let (x, y) = coords::lat_lon_to_tile(lat, lon);
    // A cell ~10 km east of where the client claims to stand.
    let (cx, cy) = coords::chunk_of(x + 1000, y);
    let o = coords::offset_of(x + 1000, y);

    let response = app
        .oneshot(paint_request(paint_body(lat, lon, cx, cy, o, 5), "10.1.1.1:9000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_bytes(response).await, b"radius");
}

#[tokio::test]
async fn teleporting_client_is_rejected_by_speed() {
    let mut config = test_config();
    config.paint_cooldown_ms = 0;
    let app = api::router(test_state(config).await);

    let (lat1, lon1) = BOSTON;
    let (cx1, cy1, o1) = cell_under(lat1, lon1);
    let first = app
        .clone()
        .oneshot(paint_request(paint_body(lat1, lon1, cx1, cy1, o1, 5), "10.1.1.1:9000"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(10)).await;

    // Harvard Square a moment later: far beyond 150 km/h.
    let (lat2, lon2) = (42.3736, -71.1190);
    let (cx2, cy2, o2) = cell_under(lat2, lon2);
    let second = app
        .oneshot(paint_request(paint_body(lat2, lon2, cx2, cy2, o2, 5), "10.1.1.1:9000"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_bytes(second).await, b"speed");
}

#[tokio::test]
async fn out_of_window_paint_is_geofenced() {
    let app = api::router(test_state(test_config()).await);
    let (lat, lon) = NYC;
    let (cx, cy, o) = cell_under(lat, lon);

    let response = app
        .clone()
        .oneshot(paint_request(paint_body(lat, lon, cx, cy, o, 5), "10.1.1.1:9000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_bytes(response).await, b"geofence");

    // No chunk was mutated.
    let snapshot = app.oneshot(chunk_request(cx, cy)).await.unwrap();
    assert_eq!(
        snapshot.headers().get("x-seq").unwrap().to_str().unwrap(),
        "0"
    );
}

#[tokio::test]
async fn malformed_and_out_of_range_paints_are_bad_requests() {
    let app = api::router(test_state(test_config()).await);
    let (lat, lon) = BOSTON;
    let (cx, cy, o) = cell_under(lat, lon);

    let not_json = app
        .clone()
        .oneshot(paint_request("not json".into(), "10.1.1.1:9000"))
        .await
        .unwrap();
    assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);

    let bad_offset = app
        .clone()
        .oneshot(paint_request(
            paint_body(lat, lon, cx, cy, 0, 5).replace("\"o\":0", "\"o\":70000"),
            "10.1.1.1:9000",
        ))
        .await
        .unwrap();
    assert_eq!(bad_offset.status(), StatusCode::BAD_REQUEST);

    let bad_color = app
        .clone()
        .oneshot(paint_request(paint_body(lat, lon, cx, cy, o, 16), "10.1.1.1:9000"))
        .await
        .unwrap();
    assert_eq!(bad_color.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chunk_query_requires_both_coordinates() {
    let app = api::router(test_state(test_config()).await);

    let missing = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/state/chunk?cx=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let invalid = app
        .oneshot(
            Request::builder()
                .uri("/state/chunk?cx=abc&cy=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn seq_probe_tracks_paints() {
    let app = api::router(test_state(test_config()).await);
    let (lat, lon) = BOSTON;
    let (cx, cy, o) = cell_under(lat, lon);

    let before = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/state/seq?cx={cx}&cy={cy}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(before).await).unwrap();
    assert_eq!(body["seq"], 0);

    app.clone()
        .oneshot(paint_request(paint_body(lat, lon, cx, cy, o, 5), "10.1.1.1:9000"))
        .await
        .unwrap();

    let after = app
        .oneshot(
            Request::builder()
                .uri(format!("/state/seq?cx={cx}&cy={cy}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(after).await).unwrap();
    assert_eq!(body["seq"], 1);
    assert_eq!(body["cx"], cx);
    assert_eq!(body["cy"], cy);
}

#[tokio::test]
async fn healthz_reports_ok_for_the_memory_store() {
    let app = api::router(test_state(test_config()).await);
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Serve the app on an ephemeral port for WebSocket tests.
async fn spawn_server(state: AppState) -> SocketAddr {
    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn wait_for_subscribers(state: &AppState, cx: i64, cy: i64, n: usize) {
    for _ in 0..100 {
        if state.hub.subscriber_count(cx, cy).await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("room ({cx}, {cy}) never reached {n} subscribers");
}

async fn next_text_frame<S>(stream: &mut S) -> serde_json::Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            // Pings and pongs are part of the keep-alive contract.
            _ => continue,
        }
    }
}

#[tokio::test]
async fn paint_fans_out_to_a_live_subscriber() {
    let mut config = test_config();
    config.paint_cooldown_ms = 0;
    let state = test_state(config).await;
    let addr = spawn_server(state.clone()).await;

    let (lat, lon) = BOSTON;
    let (cx, cy, o) = cell_under(lat, lon);

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/sub?cx={cx}&cy={cy}"))
            .await
            .unwrap();
    wait_for_subscribers(&state, cx, cy, 1).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/paint"))
        .json(&serde_json::json!({
            "lat": lat, "lon": lon, "cx": cx, "cy": cy, "o": o, "color": 4,
            "turnstileToken": ""
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let seq = body["seq"].as_u64().unwrap();

    let frame = next_text_frame(&mut socket).await;
    assert_eq!(frame["seq"].as_u64().unwrap(), seq);
    assert_eq!(frame["o"].as_u64().unwrap(), o as u64);
    assert_eq!(frame["color"].as_u64().unwrap(), 4);
    assert!(frame["ts"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn subscribers_only_see_their_own_chunk() {
    let mut config = test_config();
    config.paint_cooldown_ms = 0;
    let state = test_state(config).await;
    let addr = spawn_server(state.clone()).await;

    let (lat, lon) = BOSTON;
    let (cx, cy, o) = cell_under(lat, lon);

    // One room over; nothing painted there.
    let (mut other, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/sub?cx={}&cy={}",
        cx + 1,
        cy
    ))
    .await
    .unwrap();
    let (mut same, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/sub?cx={cx}&cy={cy}"))
            .await
            .unwrap();
    wait_for_subscribers(&state, cx, cy, 1).await;
    wait_for_subscribers(&state, cx + 1, cy, 1).await;

    let client = reqwest::Client::new();
    client
        .post(format!("http://{addr}/paint"))
        .json(&serde_json::json!({
            "lat": lat, "lon": lon, "cx": cx, "cy": cy, "o": o, "color": 9,
            "turnstileToken": ""
        }))
        .send()
        .await
        .unwrap();

    let frame = next_text_frame(&mut same).await;
    assert_eq!(frame["o"].as_u64().unwrap(), o as u64);

    // The other room stays quiet (only keep-alive pings, no text).
    let quiet = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            match other.next().await {
                Some(Ok(Message::Text(_))) => break false,
                Some(Ok(_)) => continue,
                _ => break true,
            }
        }
    })
    .await;
    assert!(quiet.is_err() || quiet.unwrap());
}

#[tokio::test]
async fn closing_the_socket_unsubscribes() {
    let state = test_state(test_config()).await;
    let addr = spawn_server(state.clone()).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/sub?cx=0&cy=0"))
        .await
        .unwrap();
    wait_for_subscribers(&state, 0, 0, 1).await;
    assert_eq!(state.hub.room_count().await, 1);

    socket.close(None).await.unwrap();
    wait_for_subscribers(&state, 0, 0, 0).await;

    for _ in 0..100 {
        if state.hub.room_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("room survived its last subscriber");
}

#[tokio::test]
async fn subscribe_requires_chunk_coordinates() {
    let state = test_state(test_config()).await;
    let addr = spawn_server(state).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/sub?cx=0")).await;
    assert!(result.is_err(), "upgrade without cy must be refused");
}
