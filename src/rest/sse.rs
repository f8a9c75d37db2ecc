//! Per-client SSE stream — `GET /mcp/stream`.
//!
//! Each connection mints a client id, subscribes to its notification topic
//! on the bus, and streams events until the client goes away. Wire protocol
//! per event: `event: <name>\ndata: <JSON>\n\n`.
//!
//! Event order: `capabilities` once, immediately; then `notification` /
//! `event` as the bus delivers, with a `ping` after every 30 s of idle.
//! Any write failure ends the stream; cleanup (bus unsubscribe plus a
//! `mcp:client_disconnected` broadcast) runs when the stream is dropped,
//! which the HTTP layer does as soon as the TCP connection closes.

use axum::extract::State;
use axum::http::{header, HeaderName};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::{self, Stream};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{
    notifications_topic, BusEvent, NotificationBus, TOPIC_CLIENT_CONNECTED,
    TOPIC_CLIENT_DISCONNECTED,
};
use crate::{capabilities, AppContext};

/// Idle interval between `ping` events.
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

pub const CLIENT_ID_HEADER: &str = "x-mcp-client-id";

pub async fn client_stream(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let client_id = Uuid::new_v4().to_string();
    let own_topic = notifications_topic(&client_id);

    // One delivery channel for the per-client queue and the broadcast topics.
    let rx = ctx
        .bus
        .subscribe_all(&[&own_topic, "mcp:client_*"], &client_id);

    ctx.bus.publish(
        TOPIC_CLIENT_CONNECTED,
        json!({ "clientId": client_id, "timestamp": now_iso8601() }),
    );
    debug!(client = %client_id, "sse client connected");

    let caps = capabilities::build(&ctx).await;
    let body = event_stream(
        rx,
        own_topic,
        caps,
        ClientGuard {
            bus: ctx.bus.clone(),
            client_id: client_id.clone(),
        },
    );

    (
        [
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (header::CONNECTION, "keep-alive".to_string()),
            (HeaderName::from_static(CLIENT_ID_HEADER), client_id),
        ],
        Sse::new(body),
    )
}

struct StreamState {
    rx: mpsc::Receiver<BusEvent>,
    own_topic: String,
    ping: Interval,
    _guard: ClientGuard,
}

/// `capabilities` first, then bus events interleaved with idle pings.
fn event_stream(
    rx: mpsc::Receiver<BusEvent>,
    own_topic: String,
    caps: serde_json::Value,
    guard: ClientGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + KEEP_ALIVE, KEEP_ALIVE);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = StreamState {
        rx,
        own_topic,
        ping,
        _guard: guard,
    };

    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("capabilities").data(caps.to_string()))
    });

    let rest = stream::unfold(state, |mut st| async move {
        tokio::select! {
            received = st.rx.recv() => match received {
                Some(ev) => {
                    st.ping.reset();
                    Some((Ok(bus_event(&st.own_topic, ev)), st))
                }
                // Bus dropped us (slow reader) — end the stream.
                None => None,
            },
            _ = st.ping.tick() => Some((Ok(ping_event()), st)),
        }
    });

    first.chain(rest)
}

/// Per-client notifications keep their envelope; everything else is wrapped
/// with its topic as a generic `event`.
fn bus_event(own_topic: &str, ev: BusEvent) -> Event {
    if ev.topic == own_topic {
        Event::default()
            .event("notification")
            .data(ev.payload.to_string())
    } else {
        Event::default()
            .event("event")
            .data(json!({ "topic": ev.topic, "payload": ev.payload }).to_string())
    }
}

fn ping_event() -> Event {
    Event::default()
        .event("ping")
        .data(json!({ "timestamp": now_iso8601() }).to_string())
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339()
}

/// Unregisters the client when its stream is dropped.
struct ClientGuard {
    bus: Arc<NotificationBus>,
    client_id: String,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.client_id);
        self.bus.publish(
            TOPIC_CLIENT_DISCONNECTED,
            json!({ "clientId": self.client_id, "timestamp": now_iso8601() }),
        );
        debug!(client = %self.client_id, "sse client disconnected");
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
