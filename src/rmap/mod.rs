//! Replicated key-value map shared by cooperating processes
//!
//! Backed by a Redis hash so every peer that joins a map by name sees the
//! same content. Scalar entries use plain hash commands; list-valued
//! entries (comma separated strings) are mutated through Lua scripts so
//! concurrent peers cannot lose each other's updates. Appending removes
//! duplicates, removing the last element deletes the hash field.

use std::collections::HashMap;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;

use crate::{Error, Result};

/// Appends values to a list-valued entry, skipping values already present.
/// Returns the new list.
const APPEND_VALUES_LUA: &str = r#"
local curr = redis.call("HGET", KEYS[1], ARGV[1])
local list = {}
local seen = {}
if curr then
  for item in string.gmatch(curr, "[^,]+") do
    table.insert(list, item)
    seen[item] = true
  end
end
for i = 2, #ARGV do
  if not seen[ARGV[i]] then
    table.insert(list, ARGV[i])
    seen[ARGV[i]] = true
  end
end
local joined = table.concat(list, ",")
redis.call("HSET", KEYS[1], ARGV[1], joined)
return joined
"#;

/// Removes values from a list-valued entry, deleting the field when the
/// list empties. Returns the remaining list.
const REMOVE_VALUES_LUA: &str = r#"
local curr = redis.call("HGET", KEYS[1], ARGV[1])
if not curr then
  return ""
end
local drop = {}
for i = 2, #ARGV do
  drop[ARGV[i]] = true
end
local list = {}
for item in string.gmatch(curr, "[^,]+") do
  if not drop[item] then
    table.insert(list, item)
  end
end
local joined = table.concat(list, ",")
if joined == "" then
  redis.call("HDEL", KEYS[1], ARGV[1])
else
  redis.call("HSET", KEYS[1], ARGV[1], joined)
end
return joined
"#;

/// A replicated map identified by name.
///
/// Cloning is cheap; clones address the same backend hash.
#[derive(Clone)]
pub struct Map {
    name: String,
    key: String,
    conn: ConnectionManager,
    append: Arc<Script>,
    remove: Arc<Script>,
}

impl Map {
    /// Join the map with the given name, creating it lazily on first write.
    pub async fn join(name: &str, client: &redis::Client) -> Result<Map> {
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("joined replicated map {}", name);
        Ok(Map {
            name: name.to_string(),
            key: content_key(name),
            conn,
            append: Arc::new(Script::new(APPEND_VALUES_LUA)),
            remove: Arc::new(Script::new(REMOVE_VALUES_LUA)),
        })
    }

    /// The map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set a scalar entry.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(&self.key, key, value).await?;
        Ok(())
    }

    /// Get a scalar entry.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(&self.key, key).await?;
        Ok(value)
    }

    /// Delete an entry.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(&self.key, key).await?;
        Ok(())
    }

    /// Snapshot of the whole map.
    pub async fn map(&self) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(&self.key).await?;
        Ok(entries)
    }

    /// Append values to the list stored under `key`, ignoring values that
    /// are already present. Returns the new list.
    pub async fn append_values(&self, key: &str, values: &[&str]) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.append.prepare_invoke();
        invocation.key(&self.key).arg(key);
        for value in values {
            invocation.arg(*value);
        }
        let joined: String = invocation.invoke_async(&mut conn).await.map_err(Error::from)?;
        Ok(split_list(&joined))
    }

    /// Remove values from the list stored under `key`. Returns the
    /// remaining list, which is empty when the entry was deleted.
    pub async fn remove_values(&self, key: &str, values: &[&str]) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.remove.prepare_invoke();
        invocation.key(&self.key).arg(key);
        for value in values {
            invocation.arg(*value);
        }
        let joined: String = invocation.invoke_async(&mut conn).await.map_err(Error::from)?;
        Ok(split_list(&joined))
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map").field("name", &self.name).finish()
    }
}

/// Backend hash key holding the map content.
pub(crate) fn content_key(name: &str) -> String {
    format!("{name}:content")
}

fn split_list(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    joined.split(',').map(str::to_string).collect()
}
