use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};

use crate::api::AppState;

/// Drive one subscriber's socket: drain the hub outbox into JSON text
/// frames, ping on the configured interval, and close on idle. Inbound
/// frames are ignored except that any traffic resets the idle timer.
pub async fn serve_subscriber(socket: WebSocket, state: AppState, cx: i64, cy: i64) {
    let mut sub = state.hub.subscribe(cx, cy).await;
    tracing::debug!(cx, cy, id = sub.id, "subscriber joined");

    let (mut sender, mut receiver) = socket.split();

    let ping_every = Duration::from_secs(state.config.ws_ping_interval_s.max(1));
    let idle_after = Duration::from_secs(state.config.ws_idle_timeout_s.max(1));

    let mut ping = tokio::time::interval(ping_every);
    ping.tick().await; // the first tick fires immediately

    let idle = tokio::time::sleep(idle_after);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            delta = sub.outbox.recv() => {
                let Some(delta) = delta else {
                    // The hub tore us down (outbox overflow); the client
                    // reconciles by refetching the snapshot.
                    break;
                };
                let frame = match serde_json::to_string(&delta) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("failed to encode delta: {e}");
                        break;
                    }
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_after);
                    }
                    // Protocol error or the peer went away.
                    _ => break,
                }
            }
            _ = &mut idle => {
                tracing::debug!(cx, cy, id = sub.id, "idle subscriber timed out");
                break;
            }
        }
    }

    state.hub.unsubscribe(sub.key, sub.id).await;
    tracing::debug!(cx, cy, id = sub.id, "subscriber left");
}
