//! Pub/sub and work sharing over Redis streams
//!
//! A [`Stream`] is a named append-only log. Events published to a stream
//! carry a name, an optional topic and an opaque payload. A [`Sink`] is a
//! named consumer shared by any number of cooperating processes: each
//! event published to the streams a sink reads from is delivered to
//! exactly one of the sink's members, with at-least-once semantics.
//! Members that crash without acknowledging have their pending events
//! reclaimed by surviving peers.

mod event;
mod options;
mod sink;
mod stream;

pub use event::Event;
pub use options::{
    AddEventOptions, AddStreamOptions, EventMatcher, SinkOptions, StreamOptions,
};
pub use sink::Sink;
pub use stream::Stream;

/// Prefix of all stream keys.
pub(crate) const STREAM_KEY_PREFIX: &str = "ponos:stream:";

/// Entry field holding the event name.
pub(crate) const NAME_FIELD: &str = "name";

/// Entry field holding the event topic, absent when no topic was set.
pub(crate) const TOPIC_FIELD: &str = "topic";

/// Entry field holding the event payload.
pub(crate) const PAYLOAD_FIELD: &str = "payload";

/// Name of the replicated map tracking the consumers of each sink reading
/// from the given stream.
pub(crate) fn consumers_map_name(stream_name: &str) -> String {
    format!("{stream_name}:sinks")
}

/// Name of the replicated map tracking the keep-alives of the given sink's
/// consumers.
pub(crate) fn keep_alive_map_name(sink_name: &str) -> String {
    format!("ponos:sink:{sink_name}:keepalive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_names() {
        assert_eq!(consumers_map_name("orders"), "orders:sinks");
        assert_eq!(keep_alive_map_name("billing"), "ponos:sink:billing:keepalive");
    }
}
