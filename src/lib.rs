//! Distributed pub/sub and work sharing on top of Redis streams
//!
//! Processes publish named, topic-tagged events to streams; groups of
//! cooperating processes consume them through named sinks with
//! at-least-once delivery. Members of a sink split the event flow between
//! them, heartbeat their liveness and take over events left pending by
//! crashed peers.
//!
//! # Architecture
//!
//! - **`streaming`** - Stream handles, events, and the sink subsystem
//!   (multiplexed reads, dynamic stream membership, acknowledgement,
//!   stale-consumer reclaim)
//! - **`rmap`** - Replicated key-value maps used to coordinate sink
//!   membership and keep-alives across processes
//!
//! # Example
//!
//! ```ignore
//! use ponos::{SinkOptions, Stream};
//!
//! let client = redis::Client::open("redis://127.0.0.1:6379")?;
//! let stream = Stream::new("my-stream", client).await?;
//! stream.add("event 1", b"payload").await?;
//!
//! let sink = stream.new_sink("my-sink", SinkOptions::default().start_at_oldest()).await?;
//! let mut events = sink.events().expect("single consumer");
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", event.event_name, event.payload);
//!     sink.ack(&event).await?;
//! }
//! sink.stop().await;
//! ```
//!
//! # Error Handling
//!
//! Construction and explicit caller operations return [`Error`];
//! background loop failures are logged and retried since the delivery
//! protocol is self-healing (unacknowledged events become eligible for
//! reclaim once their grace period expires).

mod error;
pub mod rmap;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use streaming::{
    AddEventOptions, AddStreamOptions, Event, EventMatcher, Sink, SinkOptions, Stream,
    StreamOptions,
};
