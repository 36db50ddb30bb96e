//! Stream handles

use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{
    AddEventOptions, Sink, SinkOptions, StreamOptions, NAME_FIELD, PAYLOAD_FIELD,
    STREAM_KEY_PREFIX, TOPIC_FIELD,
};
use crate::Result;

/// A named append-only stream of events.
///
/// Streams are created by the first process that appends to them or that
/// attaches a sink; handles held by different processes address the same
/// backend stream. Cloning a handle is cheap.
#[derive(Clone)]
pub struct Stream {
    /// The stream name.
    pub name: String,
    pub(crate) key: String,
    pub(crate) client: redis::Client,
    pub(crate) conn: ConnectionManager,
    max_len: Option<usize>,
}

impl Stream {
    /// Create a handle on the named stream.
    pub async fn new(name: &str, client: redis::Client) -> Result<Stream> {
        Self::new_options(name, client, StreamOptions::default()).await
    }

    /// Create a handle on the named stream with options.
    pub async fn new_options(
        name: &str,
        client: redis::Client,
        options: StreamOptions,
    ) -> Result<Stream> {
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("created handle on stream {}", name);
        Ok(Stream {
            name: name.to_string(),
            key: format!("{STREAM_KEY_PREFIX}{name}"),
            client,
            conn,
            max_len: options.max_len,
        })
    }

    /// Append an event to the stream and return its backend assigned ID.
    pub async fn add(&self, event_name: &str, payload: &[u8]) -> Result<String> {
        self.add_options(event_name, payload, AddEventOptions::default())
            .await
    }

    /// Append an event with options.
    pub async fn add_options(
        &self,
        event_name: &str,
        payload: &[u8],
        options: AddEventOptions,
    ) -> Result<String> {
        let mut items: Vec<(&str, Vec<u8>)> =
            vec![(NAME_FIELD, event_name.as_bytes().to_vec())];
        if let Some(topic) = &options.topic {
            items.push((TOPIC_FIELD, topic.as_bytes().to_vec()));
        }
        items.push((PAYLOAD_FIELD, payload.to_vec()));

        let mut conn = self.conn.clone();
        let id: String = match self.max_len {
            Some(max) => {
                conn.xadd_maxlen(&self.key, StreamMaxlen::Approx(max), "*", &items)
                    .await?
            }
            None => conn.xadd(&self.key, "*", &items).await?,
        };
        debug!("added event {} to stream {}", id, self.name);
        Ok(id)
    }

    /// Delete the backend stream and all its events. Sinks reading from
    /// the stream should be stopped or have the stream removed first.
    pub async fn destroy(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(&self.key).await?;
        info!("destroyed stream {}", self.name);
        Ok(())
    }

    /// Create a sink reading from this stream. All processes creating a
    /// sink with the same name share its events.
    pub async fn new_sink(&self, name: &str, options: SinkOptions) -> Result<Sink> {
        Sink::new(name, self, options).await
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}
