//! Events delivered by sinks

use redis::streams::StreamId;
use tracing::warn;

use super::{NAME_FIELD, PAYLOAD_FIELD, TOPIC_FIELD};

/// An event read from a stream.
///
/// Events are immutable. They are produced by a sink's reader or reclaim
/// loop and carry everything needed to acknowledge them.
#[derive(Debug, Clone)]
pub struct Event {
    /// Name of the stream the event was read from.
    pub stream_name: String,
    /// Name of the sink that delivered the event.
    pub sink_name: String,
    /// Backend assigned event ID.
    pub id: String,
    /// Event name.
    pub event_name: String,
    /// Event topic, empty if none was set.
    pub topic: String,
    /// Event payload.
    pub payload: Vec<u8>,
    /// Backend key of the stream, used to acknowledge the event.
    pub(crate) stream_key: String,
}

impl Event {
    /// Builds an event from a backend stream entry. Entries without a name
    /// field are skipped.
    pub(crate) fn from_entry(
        stream_name: &str,
        stream_key: &str,
        sink_name: &str,
        entry: &StreamId,
    ) -> Option<Event> {
        let Some(event_name) = entry.get::<String>(NAME_FIELD) else {
            warn!(
                "skipping malformed entry {} on stream {}: no name field",
                entry.id, stream_name
            );
            return None;
        };
        Some(Event {
            stream_name: stream_name.to_string(),
            sink_name: sink_name.to_string(),
            id: entry.id.clone(),
            event_name,
            topic: entry.get::<String>(TOPIC_FIELD).unwrap_or_default(),
            payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default(),
            stream_key: stream_key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &[u8])]) -> StreamId {
        let map: HashMap<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::BulkString(v.to_vec())))
            .collect();
        StreamId {
            id: "1234-0".to_string(),
            map,
        }
    }

    #[test]
    fn test_from_entry() {
        let entry = entry(&[
            ("name", b"event 1"),
            ("topic", b"my-topic"),
            ("payload", b"payload"),
        ]);
        let event = Event::from_entry("orders", "ponos:stream:orders", "billing", &entry)
            .expect("event");
        assert_eq!(event.stream_name, "orders");
        assert_eq!(event.sink_name, "billing");
        assert_eq!(event.id, "1234-0");
        assert_eq!(event.event_name, "event 1");
        assert_eq!(event.topic, "my-topic");
        assert_eq!(event.payload, b"payload");
        assert_eq!(event.stream_key, "ponos:stream:orders");
    }

    #[test]
    fn test_from_entry_without_topic() {
        let entry = entry(&[("name", b"event 1"), ("payload", b"payload")]);
        let event =
            Event::from_entry("orders", "ponos:stream:orders", "billing", &entry).expect("event");
        assert_eq!(event.topic, "");
    }

    #[test]
    fn test_from_entry_without_name() {
        let entry = entry(&[("payload", b"payload")]);
        assert!(Event::from_entry("orders", "ponos:stream:orders", "billing", &entry).is_none());
    }
}
