use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamInfoGroupsReply, StreamReadOptions, StreamReadReply};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store error: {0}")]
    Custom(String),
}

/// One delivered stream entry: server-assigned id plus field pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamSummary {
    pub length: u64,
    pub groups: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamGroupSummary {
    pub name: String,
    pub pending: u64,
}

/// The durable map + stream abstraction every component persists through.
/// Values are JSON documents; the stream half carries consumer-group,
/// acknowledged, at-least-once delivery.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;
    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<String, StoreError>;

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, StoreError>;

    /// Blocking group read from the `>` position. Entries stay pending for
    /// the consumer until acknowledged.
    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError>;

    /// Idempotent: an already-existing group is not an error.
    async fn stream_create_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    async fn stream_info(&self, stream: &str) -> Result<StreamSummary, StoreError>;

    async fn stream_groups_info(
        &self,
        stream: &str,
    ) -> Result<Vec<StreamGroupSummary>, StoreError>;
}

// -----------------------------------------------------------------------------
// In-Memory Store (tests and single-process runs without a KV endpoint)
// -----------------------------------------------------------------------------

#[derive(Default)]
struct MemStream {
    seq: u64,
    entries: Vec<StreamEntry>,
    /// group -> cursor into `entries` for new deliveries
    cursors: HashMap<String, usize>,
    /// group -> (entry id -> consumer holding it pending)
    pending: HashMap<String, HashMap<String, String>>,
}

#[derive(Default)]
pub struct MemoryStore {
    kv: Mutex<HashMap<String, String>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    streams: Mutex<HashMap<String, MemStream>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.kv.lock().unwrap().insert(key.into(), value.into());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.kv.lock().unwrap().remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.hashes
            .lock()
            .unwrap()
            .entry(key.into())
            .or_default()
            .insert(field.into(), value.into());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|h| h.contains_key(field)))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        if let Some(h) = self.hashes.lock().unwrap().get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<String, StoreError> {
        Ok("PONG".into())
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, StoreError> {
        let mut streams = self.streams.lock().unwrap();
        let s = streams.entry(stream.into()).or_default();
        s.seq += 1;
        let id = format!("{}-0", s.seq);
        s.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Ok(id)
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut streams = self.streams.lock().unwrap();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(vec![]);
        };
        if !s.cursors.contains_key(group) {
            return Err(StoreError::Custom(format!("NOGROUP {group}")));
        }

        let mut out = Vec::new();

        // Unacknowledged entries held by this consumer are redelivered
        // first, modelling claim-after-restart.
        let pending = s.pending.entry(group.into()).or_default();
        let mut held: Vec<String> = pending
            .iter()
            .filter(|(_, c)| c.as_str() == consumer)
            .map(|(id, _)| id.clone())
            .collect();
        held.sort();
        for id in held.into_iter().take(count) {
            if let Some(e) = s.entries.iter().find(|e| e.id == id) {
                out.push(e.clone());
            }
        }

        let cursor = s.cursors.get_mut(group).unwrap();
        while out.len() < count && *cursor < s.entries.len() {
            let entry = s.entries[*cursor].clone();
            s.pending
                .get_mut(group)
                .unwrap()
                .insert(entry.id.clone(), consumer.to_string());
            out.push(entry);
            *cursor += 1;
        }
        Ok(out)
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        if let Some(s) = self.streams.lock().unwrap().get_mut(stream) {
            if let Some(p) = s.pending.get_mut(group) {
                p.remove(id);
            }
        }
        Ok(())
    }

    async fn stream_create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut streams = self.streams.lock().unwrap();
        let s = streams.entry(stream.into()).or_default();
        s.cursors.entry(group.into()).or_insert(0);
        s.pending.entry(group.into()).or_default();
        Ok(())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamSummary, StoreError> {
        let streams = self.streams.lock().unwrap();
        let Some(s) = streams.get(stream) else {
            return Ok(StreamSummary { length: 0, groups: 0 });
        };
        Ok(StreamSummary {
            length: s.entries.len() as u64,
            groups: s.cursors.len() as u64,
        })
    }

    async fn stream_groups_info(
        &self,
        stream: &str,
    ) -> Result<Vec<StreamGroupSummary>, StoreError> {
        let streams = self.streams.lock().unwrap();
        let Some(s) = streams.get(stream) else {
            return Ok(vec![]);
        };
        let mut out: Vec<StreamGroupSummary> = s
            .cursors
            .keys()
            .map(|name| StreamGroupSummary {
                name: name.clone(),
                pending: s.pending.get(name).map(|p| p.len() as u64).unwrap_or(0),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// Redis Store
// -----------------------------------------------------------------------------

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hexists(key, field).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong)
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &opts).await?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = Vec::with_capacity(entry.map.len());
                for (k, v) in entry.map {
                    let text: String = redis::from_redis_value(&v)?;
                    fields.push((k, text));
                }
                out.push(StreamEntry {
                    id: entry.id,
                    fields,
                });
            }
        }
        Ok(out)
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(stream, group, &[id]).await?;
        Ok(())
    }

    async fn stream_create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0")
            .await
        {
            Ok(()) => Ok(()),
            // Re-creating an existing group is a no-op by contract.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamSummary, StoreError> {
        let mut conn = self.conn.clone();
        let length: u64 = conn.xlen(stream).await?;
        let reply: StreamInfoGroupsReply = conn.xinfo_groups(stream).await?;
        Ok(StreamSummary {
            length,
            groups: reply.groups.len() as u64,
        })
    }

    async fn stream_groups_info(
        &self,
        stream: &str,
    ) -> Result<Vec<StreamGroupSummary>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoGroupsReply = conn.xinfo_groups(stream).await?;
        Ok(reply
            .groups
            .into_iter()
            .map(|g| StreamGroupSummary {
                name: g.name,
                pending: g.pending as u64,
            })
            .collect())
    }
}
