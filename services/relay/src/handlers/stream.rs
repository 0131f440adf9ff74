use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
};
use futures::Stream;
use tracing::info;
use types::event::{DebugEvent, DEFAULT_TOPIC};

use crate::broadcast::Subscription;
use crate::state::AppState;

/// Interval between keep-alive comments on an idle stream.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// `GET /stream`: attach a console as a subscriber.
///
/// The backlog arrives first, then live events. When the peer goes away
/// axum drops the stream, which unregisters the subscriber.
pub async fn stream(State(state): State<AppState>) -> Sse<KeepAliveStream<ConsoleStream>> {
    let subscription = state.channel.subscribe();
    info!(subscriber = %subscription.id(), "Console connected");

    Sse::new(ConsoleStream { subscription })
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

/// SSE framing over a [`Subscription`].
pub struct ConsoleStream {
    subscription: Subscription,
}

impl Stream for ConsoleStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.subscription)
            .poll_next(cx)
            .map(|event| event.map(|event| Ok(to_sse(&event))))
    }
}

impl Drop for ConsoleStream {
    fn drop(&mut self) {
        info!(subscriber = %self.subscription.id(), "Console disconnected");
    }
}

/// One SSE message per event: `id` is the sequence, `event` the topic.
pub fn to_sse(event: &DebugEvent) -> Event {
    let topic: String = event
        .topic
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    let topic = if topic.is_empty() {
        DEFAULT_TOPIC.to_string()
    } else {
        topic
    };
    let data = event.payload_text().replace("\r\n", "\n").replace('\r', "\n");

    Event::default()
        .id(event.sequence.to_string())
        .event(topic)
        .data(data)
}
