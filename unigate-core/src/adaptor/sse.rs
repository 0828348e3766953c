//! Server-sent event framing shared by the streaming adaptors

use super::{AdaptorError, AdaptorResult, ByteStream};
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};

/// Split a byte stream into SSE events
pub(crate) fn events(body: ByteStream) -> impl Stream<Item = AdaptorResult<Event>> + Send {
    body.eventsource().map(|result| {
        result.map_err(|e| match e {
            EventStreamError::Transport(inner) => inner,
            EventStreamError::Utf8(e) => {
                AdaptorError::Protocol(format!("invalid UTF-8 in event stream: {}", e))
            }
            EventStreamError::Parser(e) => {
                AdaptorError::Protocol(format!("bad event stream: {}", e))
            }
        })
    })
}

/// Decode one event's JSON payload
pub(crate) fn decode<T: serde::de::DeserializeOwned>(event: &Event) -> AdaptorResult<T> {
    serde_json::from_str(&event.data).map_err(|e| {
        AdaptorError::Protocol(format!("undecodable stream event '{}': {}", event.event, e))
    })
}
