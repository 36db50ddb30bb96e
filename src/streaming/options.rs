//! Stream and sink configuration

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::Event;
use crate::{Error, Result};

/// Predicate deciding whether a sink delivers an event.
pub type EventMatcher = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Start reading at the oldest event in the stream.
pub(crate) const START_AT_OLDEST: &str = "0";

/// Start reading at events added after group creation.
pub(crate) const START_AT_NEWEST: &str = "$";

const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_MAX_POLLED: usize = 1000;
const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_ACK_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Options used when creating a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub(crate) max_len: Option<usize>,
}

impl StreamOptions {
    /// Trim the stream to approximately `max_len` events on append.
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

/// Options used when appending an event to a stream.
#[derive(Debug, Clone, Default)]
pub struct AddEventOptions {
    pub(crate) topic: Option<String>,
}

impl AddEventOptions {
    /// Tag the event with a topic.
    pub fn topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }
}

/// Options used when creating a sink.
#[derive(Clone)]
pub struct SinkOptions {
    pub(crate) start_id: String,
    pub(crate) no_ack: bool,
    pub(crate) block_duration: Duration,
    pub(crate) max_polled: usize,
    pub(crate) buffer_size: usize,
    pub(crate) ack_grace_period: Duration,
    pub(crate) topic: Option<String>,
    pub(crate) topic_pattern: Option<String>,
    pub(crate) event_matcher: Option<EventMatcher>,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            start_id: START_AT_NEWEST.to_string(),
            no_ack: false,
            block_duration: DEFAULT_BLOCK_DURATION,
            max_polled: DEFAULT_MAX_POLLED,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ack_grace_period: DEFAULT_ACK_GRACE_PERIOD,
            topic: None,
            topic_pattern: None,
            event_matcher: None,
        }
    }
}

impl SinkOptions {
    /// Read from the beginning of the stream when creating the consumer
    /// group. Ignored if the group already exists.
    pub fn start_at_oldest(mut self) -> Self {
        self.start_id = START_AT_OLDEST.to_string();
        self
    }

    /// Read events added after group creation. This is the default.
    /// Ignored if the group already exists.
    pub fn start_at_newest(mut self) -> Self {
        self.start_id = START_AT_NEWEST.to_string();
        self
    }

    /// Read events added after the given event ID when creating the
    /// consumer group. Ignored if the group already exists.
    pub fn start_at(mut self, id: &str) -> Self {
        self.start_id = id.to_string();
        self
    }

    /// Deliver events without requiring acknowledgement; the backend acks
    /// on delivery.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    /// Maximum time a single poll blocks waiting for events.
    pub fn block_duration(mut self, duration: Duration) -> Self {
        self.block_duration = duration;
        self
    }

    /// Maximum number of events read in a single poll.
    pub fn max_polled(mut self, max: usize) -> Self {
        self.max_polled = max;
        self
    }

    /// Capacity of the sink event channel. A full channel stalls the
    /// reader, which leaves events pending in the backend.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Time after which an unacknowledged event becomes eligible for
    /// reclaim by another sink member. Also the keep-alive expiry; members
    /// heartbeat every half period.
    pub fn ack_grace_period(mut self, period: Duration) -> Self {
        self.ack_grace_period = period;
        self
    }

    /// Deliver only events with exactly this topic.
    pub fn topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    /// Deliver only events whose topic matches the regular expression.
    pub fn topic_pattern(mut self, pattern: &str) -> Self {
        self.topic_pattern = Some(pattern.to_string());
        self
    }

    /// Deliver only events matching the predicate. Takes precedence over
    /// [`topic`](Self::topic) and [`topic_pattern`](Self::topic_pattern).
    pub fn event_matcher(
        mut self,
        matcher: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.event_matcher = Some(Arc::new(matcher));
        self
    }

    /// Reduces the configured filters to a single predicate. Setting both
    /// a topic and a topic pattern is rejected.
    pub(crate) fn resolve_matcher(&self) -> Result<Option<EventMatcher>> {
        if let Some(matcher) = &self.event_matcher {
            return Ok(Some(matcher.clone()));
        }
        if self.topic.is_some() && self.topic_pattern.is_some() {
            return Err(Error::ConflictingTopicFilters);
        }
        if let Some(topic) = &self.topic {
            let topic = topic.clone();
            return Ok(Some(Arc::new(move |e: &Event| e.topic == topic)));
        }
        if let Some(pattern) = &self.topic_pattern {
            let re = Regex::new(pattern)?;
            return Ok(Some(Arc::new(move |e: &Event| re.is_match(&e.topic))));
        }
        Ok(None)
    }
}

impl std::fmt::Debug for SinkOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkOptions")
            .field("start_id", &self.start_id)
            .field("no_ack", &self.no_ack)
            .field("block_duration", &self.block_duration)
            .field("max_polled", &self.max_polled)
            .field("buffer_size", &self.buffer_size)
            .field("ack_grace_period", &self.ack_grace_period)
            .field("topic", &self.topic)
            .field("topic_pattern", &self.topic_pattern)
            .field("event_matcher", &self.event_matcher.is_some())
            .finish()
    }
}

/// Options used when adding a stream to an existing sink.
#[derive(Debug, Clone, Default)]
pub struct AddStreamOptions {
    pub(crate) last_event_id: Option<String>,
}

impl AddStreamOptions {
    /// Read events added after the given event ID when creating the
    /// consumer group for the added stream. Defaults to the sink's own
    /// start position.
    pub fn last_event_id(mut self, id: &str) -> Self {
        self.last_event_id = Some(id.to_string());
        self
    }
}
