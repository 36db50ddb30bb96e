//! Stream sinks
//!
//! A sink fans in events from one or more streams and shares them with
//! peer processes using the same sink name. Two background tasks drive it:
//!
//! - the reader polls the streams with blocking group reads and publishes
//!   converted events on the sink channel;
//! - the reclaim loop heartbeats this consumer and takes over events left
//!   pending by peers whose heartbeat lapsed.
//!
//! Peer membership is tracked per stream in a replicated map so the last
//! member leaving a stream can destroy its consumer group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    consumers_map_name, keep_alive_map_name, AddStreamOptions, Event, EventMatcher, SinkOptions,
    Stream, STREAM_KEY_PREFIX,
};
use crate::rmap::Map;
use crate::{Error, Result};

/// Maximum retry backoff jitter after a failed read, in milliseconds.
const MAX_JITTER_MS: u64 = 5000;

/// Cursor asking the backend for events not yet delivered to the group.
const NEW_EVENTS_CURSOR: &str = ">";

/// Mutable sink state, guarded by the sink lock. Events are published on
/// the sink channel while the lock is held, which serializes the reader
/// and reclaim loop publications.
struct SinkState {
    /// Streams the sink currently reads from, unique by name.
    streams: Vec<Stream>,
    /// Read cursors in the form `[key1, key2, ..., ">", ">", ...]`.
    cursors: Vec<String>,
    /// Consumer membership map of each stream, indexed by stream name.
    consumers_maps: HashMap<String, Map>,
    /// True once `stop` has been called.
    stopping: bool,
}

struct SinkInner {
    name: String,
    consumer_id: String,
    start_id: String,
    no_ack: bool,
    block_duration: Duration,
    max_polled: usize,
    ack_grace_period: Duration,
    event_matcher: Option<EventMatcher>,
    client: redis::Client,
    conn: ConnectionManager,
    keep_alive: Map,
    state: Mutex<SinkState>,
    /// Wakes the reader when the stream set changes; at most one
    /// notification is pending at a time.
    streams_changed: Notify,
    done: CancellationToken,
    /// Cancelled once shutdown has fully completed.
    terminated: CancellationToken,
    stopped: AtomicBool,
}

/// A named consumer of one or more streams, shared with peer processes.
///
/// Events are received from the channel returned by [`Sink::events`] and
/// acknowledged with [`Sink::ack`] once processed. An event that is never
/// acknowledged is redelivered to a surviving peer once its consumer's
/// keep-alive lapses.
pub struct Sink {
    inner: Arc<SinkInner>,
    events: parking_lot::Mutex<Option<mpsc::Receiver<Event>>>,
    tasks: parking_lot::Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Sink {
    /// Creates the sink, registers this consumer with its peers and starts
    /// the background loops. Membership is recorded before the consumer
    /// group is created so a peer tearing down concurrently cannot destroy
    /// the group out from under us.
    pub(crate) async fn new(name: &str, stream: &Stream, options: SinkOptions) -> Result<Sink> {
        let event_matcher = options.resolve_matcher()?;

        let consumers = Map::join(&consumers_map_name(&stream.name), &stream.client)
            .await
            .map_err(|e| construct_error(name, e))?;
        let keep_alive = Map::join(&keep_alive_map_name(name), &stream.client)
            .await
            .map_err(|e| construct_error(name, e))?;

        let consumer_id = Uuid::new_v4().to_string();
        consumers
            .append_values(name, &[&consumer_id])
            .await
            .map_err(|e| construct_error(name, e))?;

        let mut conn = stream.conn.clone();
        if let Err(e) = create_group(&mut conn, &stream.key, name, &options.start_id).await {
            // Roll back the membership record so peers don't wait on a
            // consumer that never existed.
            if let Err(e) = consumers.remove_values(name, &[&consumer_id]).await {
                warn!(
                    "sink {}: failed to roll back consumer {} registration: {}",
                    name, consumer_id, e
                );
            }
            return Err(construct_error(name, e));
        }
        if let Err(e) = create_consumer(&mut conn, &stream.key, name, &consumer_id).await {
            return Err(construct_error(name, e));
        }

        // Channel capacity must be nonzero; an unbuffered sink degenerates
        // to a capacity of one.
        let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
        let inner = Arc::new(SinkInner {
            name: name.to_string(),
            consumer_id,
            start_id: options.start_id.clone(),
            no_ack: options.no_ack,
            block_duration: options.block_duration,
            max_polled: options.max_polled,
            ack_grace_period: options.ack_grace_period,
            event_matcher,
            client: stream.client.clone(),
            conn: stream.conn.clone(),
            keep_alive,
            state: Mutex::new(SinkState {
                streams: vec![stream.clone()],
                cursors: cursor_list(&[&stream.key]),
                consumers_maps: HashMap::from([(stream.name.clone(), consumers)]),
                stopping: false,
            }),
            streams_changed: Notify::new(),
            done: CancellationToken::new(),
            terminated: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        });

        let reader = tokio::spawn(inner.clone().read_loop(tx.clone()));
        let reclaim = tokio::spawn(inner.clone().reclaim_loop(tx));
        info!(
            "sink {}: consumer {} reading stream {}",
            inner.name, inner.consumer_id, stream.name
        );
        Ok(Sink {
            inner,
            events: parking_lot::Mutex::new(Some(rx)),
            tasks: parking_lot::Mutex::new(Some((reader, reclaim))),
        })
    }

    /// The sink name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The identity of this process within the sink.
    pub fn consumer_id(&self) -> &str {
        &self.inner.consumer_id
    }

    /// Takes the sink event channel. The channel must be consumed by a
    /// single task; it is closed once the sink has stopped. Returns `None`
    /// on every call after the first.
    pub fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events.lock().take()
    }

    /// Acknowledge the event. Errors are surfaced but not retried: an
    /// unacknowledged event is redelivered through the reclaim path once
    /// its grace period expires. A no-op for `no_ack` sinks.
    pub async fn ack(&self, event: &Event) -> Result<()> {
        if self.inner.no_ack {
            return Ok(());
        }
        let mut conn = self.inner.conn.clone();
        let acked: std::result::Result<i64, RedisError> = conn
            .xack(&event.stream_key, &event.sink_name, &[&event.id])
            .await;
        match acked {
            Ok(_) => {
                debug!(
                    "sink {}: acked event {} on stream {}",
                    self.inner.name, event.id, event.stream_name
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "sink {}: failed to ack event {} on stream {}: {}",
                    self.inner.name, event.id, event.stream_name, e
                );
                Err(e.into())
            }
        }
    }

    /// Add a stream to the sink. Does nothing if the sink already reads
    /// from a stream with the same name. The group cursor starts at the
    /// sink's start position unless overridden in `options`.
    pub async fn add_stream(&self, stream: &Stream) -> Result<()> {
        self.add_stream_options(stream, AddStreamOptions::default())
            .await
    }

    /// Add a stream to the sink with options.
    pub async fn add_stream_options(
        &self,
        stream: &Stream,
        options: AddStreamOptions,
    ) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.stopping {
            return Err(Error::SinkStopped);
        }
        if state.streams.iter().any(|s| s.name == stream.name) {
            return Ok(());
        }
        let start_id = options
            .last_event_id
            .unwrap_or_else(|| inner.start_id.clone());

        // Same ordering as construction: record membership first.
        let consumers = Map::join(&consumers_map_name(&stream.name), &inner.client).await?;
        consumers
            .append_values(&inner.name, &[&inner.consumer_id])
            .await?;
        let mut conn = inner.conn.clone();
        if let Err(e) = create_group(&mut conn, &stream.key, &inner.name, &start_id).await {
            if let Err(e) = consumers
                .remove_values(&inner.name, &[&inner.consumer_id])
                .await
            {
                warn!(
                    "sink {}: failed to roll back consumer registration on stream {}: {}",
                    inner.name, stream.name, e
                );
            }
            return Err(e);
        }

        state.streams.push(stream.clone());
        state.cursors = stream_cursors(&state.streams);
        state.consumers_maps.insert(stream.name.clone(), consumers);
        inner.streams_changed.notify_one();
        info!("sink {}: added stream {}", inner.name, stream.name);
        Ok(())
    }

    /// Remove a stream from the sink. Does nothing if the sink does not
    /// read from it. The consumer group on that stream is destroyed when
    /// this consumer was its last member.
    pub async fn remove_stream(&self, stream: &Stream) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.stopping {
            // Cleanup already detaches every stream.
            return Ok(());
        }
        let Some(pos) = state.streams.iter().position(|s| s.name == stream.name) else {
            return Ok(());
        };
        let removed = state.streams.remove(pos);
        state.cursors = stream_cursors(&state.streams);

        let mut conn = inner.conn.clone();
        let deleted: std::result::Result<i64, RedisError> = conn
            .xgroup_delconsumer(&removed.key, &inner.name, &inner.consumer_id)
            .await;
        if let Err(e) = deleted {
            error!(
                "sink {}: failed to delete consumer {} on stream {}: {}",
                inner.name, inner.consumer_id, removed.name, e
            );
            return Err(e.into());
        }
        if let Some(consumers) = state.consumers_maps.remove(&removed.name) {
            let remaining = consumers
                .remove_values(&inner.name, &[&inner.consumer_id])
                .await?;
            if remaining.is_empty() {
                let _: i64 = conn.xgroup_destroy(&removed.key, &inner.name).await?;
                debug!(
                    "sink {}: destroyed consumer group on stream {}",
                    inner.name, removed.name
                );
            }
        }
        inner.streams_changed.notify_one();
        info!("sink {}: removed stream {}", inner.name, removed.name);
        Ok(())
    }

    /// Stop the sink and wait for its background loops to exit. The
    /// consumer is deleted from every stream, membership entries are
    /// removed and consumer groups left without members are destroyed.
    /// Idempotent; concurrent callers all return once shutdown completed.
    pub async fn stop(&self) {
        let first = {
            let mut state = self.inner.state.lock().await;
            if state.stopping {
                false
            } else {
                state.stopping = true;
                self.inner.done.cancel();
                true
            }
        };
        if !first {
            self.inner.terminated.cancelled().await;
            return;
        }
        let tasks = self.tasks.lock().take();
        if let Some((reader, reclaim)) = tasks {
            if let Err(e) = reader.await {
                error!("sink {}: reader task failed: {}", self.inner.name, e);
            }
            if let Err(e) = reclaim.await {
                error!("sink {}: reclaim task failed: {}", self.inner.name, e);
            }
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.terminated.cancel();
        info!("sink {}: stopped", self.inner.name);
    }

    /// True once `stop` has completed.
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Kills the background loops without running cleanup, simulating a
    /// crashed process.
    #[cfg(test)]
    pub(crate) fn abandon(&self) {
        if let Some((reader, reclaim)) = self.tasks.lock().take() {
            reader.abort();
            reclaim.abort();
        }
    }
}

impl SinkInner {
    /// Reads events from the streams and publishes them on the sink
    /// channel until the sink is stopped, then cleans up this consumer.
    async fn read_loop(self: Arc<Self>, events: mpsc::Sender<Event>) {
        if let Some(conn) = self.reader_connection().await {
            self.read_events(conn, &events).await;
        }
        self.cleanup().await;
        debug!("sink {}: reader exited", self.name);
    }

    async fn read_events(&self, mut conn: ConnectionManager, events: &mpsc::Sender<Event>) {
        loop {
            if self.done.is_cancelled() {
                return;
            }
            let cursors = { self.state.lock().await.cursors.clone() };
            if cursors.is_empty() {
                // No streams left; wait for an add or for shutdown.
                tokio::select! {
                    _ = self.done.cancelled() => return,
                    _ = self.streams_changed.notified() => continue,
                }
            }
            let (keys, ids) = cursors.split_at(cursors.len() / 2);
            let mut options = StreamReadOptions::default()
                .group(&self.name, &self.consumer_id)
                .count(self.max_polled)
                .block(self.block_duration.as_millis() as usize);
            if self.no_ack {
                options = options.noack();
            }
            debug!("sink {}: reading {} stream(s)", self.name, keys.len());

            let reply = tokio::select! {
                _ = self.done.cancelled() => return,
                _ = self.streams_changed.notified() => {
                    // The in-flight blocking read is abandoned. Reopen the
                    // connection so the next poll does not queue behind it
                    // on the server.
                    match self.reader_connection().await {
                        Some(fresh) => conn = fresh,
                        None => return,
                    }
                    continue;
                }
                reply = async {
                    let reply: std::result::Result<Option<StreamReadReply>, RedisError> =
                        conn.xread_options(keys, ids, &options).await;
                    reply
                } => reply,
            };

            match reply {
                Ok(Some(reply)) => {
                    let batch = self.convert_batch(&reply);
                    if batch.is_empty() {
                        continue;
                    }
                    let state = self.state.lock().await;
                    for event in batch {
                        if events.send(event).await.is_err() {
                            debug!("sink {}: event channel receiver dropped", self.name);
                            break;
                        }
                    }
                    drop(state);
                }
                // The blocking read timed out without new events.
                Ok(None) => continue,
                Err(e) => {
                    if self.done.is_cancelled() {
                        return;
                    }
                    warn!("sink {}: read failed: {}", self.name, e);
                    self.backoff().await;
                }
            }
        }
    }

    /// Heartbeats this consumer and reclaims events pending on peers whose
    /// heartbeat lapsed past the grace period.
    async fn reclaim_loop(self: Arc<Self>, events: mpsc::Sender<Event>) {
        let period = self.ack_grace_period / 2;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.done.cancelled() => {
                    debug!("sink {}: reclaim loop exited", self.name);
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self
                .keep_alive
                .set(&self.consumer_id, &unix_now().to_string())
                .await
            {
                error!("sink {}: failed to update keep-alive: {}", self.name, e);
            }
            let peers = match self.keep_alive.map().await {
                Ok(peers) => peers,
                Err(e) => {
                    error!("sink {}: failed to read keep-alive map: {}", self.name, e);
                    continue;
                }
            };
            let grace = self.ack_grace_period.as_secs() as i64;
            for (peer, last_seen) in peers {
                if peer == self.consumer_id {
                    continue;
                }
                let last_seen = match last_seen.parse::<i64>() {
                    Ok(timestamp) => timestamp,
                    Err(e) => {
                        error!(
                            "sink {}: invalid keep-alive timestamp for consumer {}: {}",
                            self.name, peer, e
                        );
                        continue;
                    }
                };
                if unix_now() - last_seen > grace {
                    if let Err(e) = self.claim_stale_events(&peer, &events).await {
                        error!(
                            "sink {}: failed to claim events from stale consumer {}: {}",
                            self.name, peer, e
                        );
                    }
                }
            }
        }
    }

    /// Claims events that have been pending longer than the grace period
    /// and delivers them on the sink channel. Safe to race with peers
    /// doing the same: the backend hands each pending event to one caller.
    async fn claim_stale_events(&self, peer: &str, events: &mpsc::Sender<Event>) -> Result<()> {
        let mut conn = self.conn.clone();
        let state = self.state.lock().await;
        for stream in &state.streams {
            let reply: StreamAutoClaimReply = conn
                .xautoclaim_options(
                    &stream.key,
                    &self.name,
                    &self.consumer_id,
                    self.ack_grace_period.as_millis() as usize,
                    "0-0",
                    StreamAutoClaimOptions::default(),
                )
                .await?;
            if reply.claimed.is_empty() {
                continue;
            }
            info!(
                "sink {}: claimed {} event(s) pending on stale consumer {}",
                self.name,
                reply.claimed.len(),
                peer
            );
            for entry in &reply.claimed {
                if let Some(event) = self.convert_entry(&stream.name, &stream.key, entry) {
                    if events.send(event).await.is_err() {
                        debug!("sink {}: event channel receiver dropped", self.name);
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Converts a group read reply, applying the event filter.
    fn convert_batch(&self, reply: &StreamReadReply) -> Vec<Event> {
        let mut batch = Vec::new();
        for key in &reply.keys {
            let stream_name = key
                .key
                .strip_prefix(STREAM_KEY_PREFIX)
                .unwrap_or(&key.key)
                .to_string();
            for entry in &key.ids {
                if let Some(event) = self.convert_entry(&stream_name, &key.key, entry) {
                    batch.push(event);
                }
            }
        }
        batch
    }

    fn convert_entry(&self, stream_name: &str, stream_key: &str, entry: &StreamId) -> Option<Event> {
        let event = Event::from_entry(stream_name, stream_key, &self.name, entry)?;
        if let Some(matcher) = &self.event_matcher {
            if !matcher(&event) {
                debug!(
                    "sink {}: event {} on stream {} did not match filter",
                    self.name, event.id, stream_name
                );
                return None;
            }
        }
        debug!(
            "sink {}: received event {} from stream {}",
            self.name, event.id, stream_name
        );
        Some(event)
    }

    /// Opens a connection dedicated to blocking reads so they do not stall
    /// commands issued on the shared connection. Retries until the sink is
    /// stopped.
    async fn reader_connection(&self) -> Option<ConnectionManager> {
        loop {
            if self.done.is_cancelled() {
                return None;
            }
            match ConnectionManager::new(self.client.clone()).await {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    error!("sink {}: failed to open read connection: {}", self.name, e);
                    self.backoff().await;
                }
            }
        }
    }

    /// Sleeps for a jittered interval, cut short by shutdown.
    async fn backoff(&self) {
        let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
        tokio::select! {
            _ = self.done.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
        }
    }

    /// Detaches this consumer from every stream: delete the backend
    /// consumer, then remove the membership entry, then destroy the group
    /// if the membership list emptied. Reversing that order would let a
    /// joining peer lose its group. Failures are logged; cleanup proceeds.
    async fn cleanup(&self) {
        let mut conn = self.conn.clone();
        let mut state = self.state.lock().await;
        for stream in &state.streams {
            let deleted: std::result::Result<i64, RedisError> = conn
                .xgroup_delconsumer(&stream.key, &self.name, &self.consumer_id)
                .await;
            if let Err(e) = deleted {
                error!(
                    "sink {}: failed to delete consumer on stream {}: {}",
                    self.name, stream.name, e
                );
            }
            let Some(consumers) = state.consumers_maps.get(&stream.name) else {
                continue;
            };
            match consumers
                .remove_values(&self.name, &[&self.consumer_id])
                .await
            {
                Ok(remaining) if remaining.is_empty() => {
                    let destroyed: std::result::Result<i64, RedisError> =
                        conn.xgroup_destroy(&stream.key, &self.name).await;
                    match destroyed {
                        Ok(_) => debug!(
                            "sink {}: destroyed consumer group on stream {}",
                            self.name, stream.name
                        ),
                        Err(e) => error!(
                            "sink {}: failed to destroy consumer group on stream {}: {}",
                            self.name, stream.name, e
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => error!(
                    "sink {}: failed to remove consumer from membership of stream {}: {}",
                    self.name, stream.name, e
                ),
            }
        }
        state.consumers_maps.clear();
        if let Err(e) = self.keep_alive.delete(&self.consumer_id).await {
            warn!("sink {}: failed to remove keep-alive entry: {}", self.name, e);
        }
        debug!("sink {}: cleaned up consumer {}", self.name, self.consumer_id);
    }
}

/// Creates the consumer group and the underlying stream when absent. A
/// group that already exists is fine.
async fn create_group(
    conn: &mut ConnectionManager,
    key: &str,
    group: &str,
    start_id: &str,
) -> Result<()> {
    let created: std::result::Result<String, RedisError> =
        conn.xgroup_create_mkstream(key, group, start_id).await;
    match created {
        Ok(_) => Ok(()),
        Err(e) if is_busy_group(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn create_consumer(
    conn: &mut ConnectionManager,
    key: &str,
    group: &str,
    consumer: &str,
) -> Result<()> {
    let _: i64 = redis::cmd("XGROUP")
        .arg("CREATECONSUMER")
        .arg(key)
        .arg(group)
        .arg(consumer)
        .query_async(conn)
        .await?;
    Ok(())
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

fn construct_error(name: &str, source: Error) -> Error {
    Error::Construct {
        name: name.to_string(),
        source: Box::new(source),
    }
}

/// Builds the read cursor list: the stream keys followed by one new-events
/// cursor per stream.
fn cursor_list(keys: &[&str]) -> Vec<String> {
    let mut cursors: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    cursors.extend(keys.iter().map(|_| NEW_EVENTS_CURSOR.to_string()));
    cursors
}

fn stream_cursors(streams: &[Stream]) -> Vec<String> {
    let keys: Vec<&str> = streams.iter().map(|s| s.key.as_str()).collect();
    cursor_list(&keys)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::AddEventOptions;
    use crate::testing::{group_count, init_tracing, test_client, unique_name};

    #[test]
    fn test_cursor_list() {
        assert!(cursor_list(&[]).is_empty());
        assert_eq!(cursor_list(&["a"]), vec!["a", ">"]);
        assert_eq!(
            cursor_list(&["a", "b", "c"]),
            vec!["a", "b", "c", ">", ">", ">"]
        );
    }

    fn fast_options() -> SinkOptions {
        SinkOptions::default()
            .start_at_oldest()
            .block_duration(Duration::from_millis(100))
    }

    async fn receive(
        events: &mut mpsc::Receiver<Event>,
        within: Duration,
    ) -> Option<Event> {
        tokio::time::timeout(within, events.recv()).await.ok().flatten()
    }

    #[tokio::test]
    #[ignore] // requires Redis
    async fn test_delivers_event_and_acks() {
        init_tracing();
        let client = test_client();
        let stream = Stream::new(&unique_name("stream"), client.clone()).await.unwrap();
        stream
            .add_options("event 1", b"p", AddEventOptions::default().topic("my-topic"))
            .await
            .unwrap();

        let sink = stream
            .new_sink(&unique_name("sink"), fast_options())
            .await
            .unwrap();
        let mut events = sink.events().expect("event channel");
        assert!(sink.events().is_none());

        let event = receive(&mut events, Duration::from_secs(5)).await.expect("event");
        assert_eq!(event.event_name, "event 1");
        assert_eq!(event.topic, "my-topic");
        assert_eq!(event.payload, b"p");
        assert_eq!(event.stream_name, stream.name);
        assert_eq!(event.sink_name, sink.name());

        sink.ack(&event).await.unwrap();
        // Acking twice must not fail or redeliver.
        sink.ack(&event).await.unwrap();

        sink.stop().await;
        stream.destroy().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // requires Redis
    async fn test_topic_filter_excludes_events() {
        init_tracing();
        let client = test_client();
        let stream = Stream::new(&unique_name("stream"), client.clone()).await.unwrap();
        stream
            .add_options("event a", b"1", AddEventOptions::default().topic("a"))
            .await
            .unwrap();
        stream
            .add_options("event b", b"2", AddEventOptions::default().topic("b"))
            .await
            .unwrap();

        let sink = stream
            .new_sink(&unique_name("sink"), fast_options().topic("b"))
            .await
            .unwrap();
        let mut events = sink.events().unwrap();

        let event = receive(&mut events, Duration::from_secs(5)).await.expect("event");
        assert_eq!(event.topic, "b");
        assert!(receive(&mut events, Duration::from_millis(300)).await.is_none());

        sink.stop().await;
        stream.destroy().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // requires Redis
    async fn test_add_stream_delivers_new_events() {
        init_tracing();
        let client = test_client();
        let stream1 = Stream::new(&unique_name("stream1"), client.clone()).await.unwrap();
        let stream2 = Stream::new(&unique_name("stream2"), client.clone()).await.unwrap();
        stream1.add("event 1", b"1").await.unwrap();

        let sink = stream1
            .new_sink(&unique_name("sink"), fast_options())
            .await
            .unwrap();
        let mut events = sink.events().unwrap();
        let event = receive(&mut events, Duration::from_secs(5)).await.expect("event 1");
        assert_eq!(event.event_name, "event 1");

        sink.add_stream(&stream2).await.unwrap();
        // Adding the same stream again is a no-op.
        sink.add_stream(&stream2).await.unwrap();

        stream2.add("event 2", b"2").await.unwrap();
        let event = receive(&mut events, Duration::from_secs(5)).await.expect("event 2");
        assert_eq!(event.event_name, "event 2");
        assert_eq!(event.stream_name, stream2.name);

        sink.stop().await;
        stream1.destroy().await.unwrap();
        stream2.destroy().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // requires Redis
    async fn test_remove_stream_stops_delivery() {
        init_tracing();
        let client = test_client();
        let stream1 = Stream::new(&unique_name("stream1"), client.clone()).await.unwrap();
        let stream2 = Stream::new(&unique_name("stream2"), client.clone()).await.unwrap();

        let sink = stream1
            .new_sink(&unique_name("sink"), fast_options())
            .await
            .unwrap();
        sink.add_stream(&stream2).await.unwrap();
        let mut events = sink.events().unwrap();

        sink.remove_stream(&stream2).await.unwrap();
        // Removing twice is a no-op.
        sink.remove_stream(&stream2).await.unwrap();

        // The last member left, so the group on stream2 must be gone.
        assert_eq!(group_count(&client, &stream2.name).await, 0);

        stream2.add("event 2", b"2").await.unwrap();
        assert!(receive(&mut events, Duration::from_millis(300)).await.is_none());

        sink.stop().await;
        stream1.destroy().await.unwrap();
        stream2.destroy().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // requires Redis
    async fn test_stale_peer_events_are_reclaimed() {
        init_tracing();
        let client = test_client();
        let stream = Stream::new(&unique_name("stream"), client.clone()).await.unwrap();
        let sink_name = unique_name("sink");
        stream.add("event 1", b"p").await.unwrap();

        let options = fast_options().ack_grace_period(Duration::from_secs(2));

        // Peer A receives the event but crashes before acking.
        let sink_a = stream.new_sink(&sink_name, options.clone()).await.unwrap();
        let mut events_a = sink_a.events().unwrap();
        let event = receive(&mut events_a, Duration::from_secs(5)).await.expect("event on A");
        assert_eq!(event.event_name, "event 1");
        // Let A heartbeat once so peers see it go stale.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        sink_a.abandon();

        // Peer B takes over once A's keep-alive lapses.
        let sink_b = stream.new_sink(&sink_name, options).await.unwrap();
        let mut events_b = sink_b.events().unwrap();
        let claimed = receive(&mut events_b, Duration::from_secs(10))
            .await
            .expect("reclaimed event on B");
        assert_eq!(claimed.event_name, "event 1");
        assert_eq!(claimed.payload, b"p");
        sink_b.ack(&claimed).await.unwrap();

        sink_b.stop().await;
        stream.destroy().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // requires Redis
    async fn test_stop_cleans_up_last_member() {
        init_tracing();
        let client = test_client();
        let stream = Stream::new(&unique_name("stream"), client.clone()).await.unwrap();
        let sink_name = unique_name("sink");

        let sink = stream.new_sink(&sink_name, fast_options()).await.unwrap();
        let mut events = sink.events().unwrap();

        let consumers = Map::join(&consumers_map_name(&stream.name), &client)
            .await
            .unwrap();
        let members = consumers.map().await.unwrap();
        assert_eq!(
            members.get(&sink_name).map(String::as_str),
            Some(sink.consumer_id())
        );

        assert!(!sink.stopped());
        sink.stop().await;
        assert!(sink.stopped());
        // Idempotent.
        sink.stop().await;
        assert!(sink.stopped());

        // The channel is closed, membership is gone and so is the group.
        assert!(events.recv().await.is_none());
        assert!(consumers.map().await.unwrap().get(&sink_name).is_none());
        assert_eq!(group_count(&client, &stream.name).await, 0);

        // Membership mutations after stop are rejected or ignored.
        let other = Stream::new(&unique_name("other"), client.clone()).await.unwrap();
        assert!(matches!(
            sink.add_stream(&other).await,
            Err(Error::SinkStopped)
        ));
        sink.remove_stream(&other).await.unwrap();

        stream.destroy().await.unwrap();
    }
}
