use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tracing::{debug, trace};

/// How long a refresh result stays retrievable after it is written.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Result of one credential-provider job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum JobOutcome {
    Success(serde_json::Value),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshEntry {
    pub token: String,
    pub outcome: JobOutcome,
    pub created_at: DateTime<Utc>,
}

impl RefreshEntry {
    pub fn new(token: String, outcome: JobOutcome) -> Self {
        Self {
            token,
            outcome,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Token issued, job still running.
    Pending,
    /// Never issued, or expired.
    Missing,
    Found(RefreshEntry),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token {0} was already issued")]
    DuplicateToken(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("stored entry is not valid json: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Token-keyed cache of refresh results.
///
/// Every slot, pending or resolved, disappears one retention window after its
/// last write. After that it reads exactly like a token that was never issued.
#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// Create a pending slot for a freshly issued token.
    async fn reserve(&self, token: &str) -> Result<(), StoreError>;

    /// Store the outcome for `token` and restart its retention window.
    async fn put(&self, token: &str, outcome: JobOutcome) -> Result<RefreshEntry, StoreError>;

    async fn get(&self, token: &str) -> Result<Lookup, StoreError>;
}

pub type SharedStore = Arc<dyn RefreshStore>;

#[derive(Debug, Clone)]
enum SlotState {
    Pending,
    Ready(RefreshEntry),
}

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    expires_at: Instant,
    generation: u64,
}

#[derive(Debug)]
struct ScheduledExpiry {
    token: String,
    generation: u64,
    deadline: Instant,
}

/// In-process store. Removal is scheduled on a `DelayQueue` owned by a
/// background task; reads also check the deadline against the tokio clock.
#[derive(Clone)]
pub struct InMemoryRefreshStore {
    slots: Arc<DashMap<String, Slot>>,
    retention: Duration,
    generation: Arc<AtomicU64>,
    expiry_tx: mpsc::UnboundedSender<ScheduledExpiry>,
}

impl InMemoryRefreshStore {
    /// Must be called inside a tokio runtime; spawns the expiry task.
    pub fn new(retention: Duration) -> Self {
        let slots = Arc::new(DashMap::new());
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_expiry(slots.clone(), expiry_rx));
        Self {
            slots,
            retention,
            generation: Arc::new(AtomicU64::new(0)),
            expiry_tx,
        }
    }

    /// Number of slots not yet removed by the expiry task.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn new_slot(&self, state: SlotState) -> Slot {
        Slot {
            state,
            expires_at: Instant::now() + self.retention,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn schedule(&self, token: &str, slot: &Slot) {
        // The receiver only goes away with the runtime.
        let _ = self.expiry_tx.send(ScheduledExpiry {
            token: token.to_string(),
            generation: slot.generation,
            deadline: slot.expires_at,
        });
    }
}

#[async_trait]
impl RefreshStore for InMemoryRefreshStore {
    async fn reserve(&self, token: &str) -> Result<(), StoreError> {
        let slot = self.new_slot(SlotState::Pending);
        match self.slots.entry(token.to_string()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateToken(token.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(slot.clone());
                Ok(())
            }
        }?;
        self.schedule(token, &slot);
        Ok(())
    }

    async fn put(&self, token: &str, outcome: JobOutcome) -> Result<RefreshEntry, StoreError> {
        let entry = RefreshEntry::new(token.to_string(), outcome);
        let slot = self.new_slot(SlotState::Ready(entry.clone()));
        self.slots.insert(token.to_string(), slot.clone());
        self.schedule(token, &slot);
        Ok(entry)
    }

    async fn get(&self, token: &str) -> Result<Lookup, StoreError> {
        let Some(slot) = self.slots.get(token) else {
            return Ok(Lookup::Missing);
        };
        if slot.expires_at <= Instant::now() {
            return Ok(Lookup::Missing);
        }
        Ok(match &slot.state {
            SlotState::Pending => Lookup::Pending,
            SlotState::Ready(entry) => Lookup::Found(entry.clone()),
        })
    }
}

async fn run_expiry(
    slots: Arc<DashMap<String, Slot>>,
    mut scheduled: mpsc::UnboundedReceiver<ScheduledExpiry>,
) {
    let mut queue: DelayQueue<(String, u64)> = DelayQueue::new();
    loop {
        tokio::select! {
            next = scheduled.recv() => match next {
                Some(expiry) => {
                    queue.insert_at((expiry.token, expiry.generation), expiry.deadline);
                }
                None => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let (token, generation) = expired.into_inner();
                // A later write bumped the generation and owns its own removal.
                let removed = slots
                    .remove_if(&token, |_, slot| slot.generation == generation)
                    .is_some();
                if removed {
                    debug!(%token, "refresh entry expired");
                } else {
                    trace!(%token, generation, "stale expiry skipped");
                }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum StoredSlot {
    Pending,
    Ready { entry: RefreshEntry },
}

/// Redis-backed store; Redis key TTLs do the expiry.
#[derive(Clone)]
pub struct RedisRefreshStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisRefreshStore {
    pub async fn new(redis_url: &str, retention: Duration) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            ttl_seconds: retention.as_secs().max(1),
        })
    }
}

#[async_trait]
impl RefreshStore for RedisRefreshStore {
    async fn reserve(&self, token: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(&StoredSlot::Pending)?;
        let created: Option<String> = redis::cmd("SET")
            .arg(refresh_key(token))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await?;
        match created {
            Some(_) => Ok(()),
            None => Err(StoreError::DuplicateToken(token.to_string())),
        }
    }

    async fn put(&self, token: &str, outcome: JobOutcome) -> Result<RefreshEntry, StoreError> {
        let mut conn = self.redis.clone();
        let entry = RefreshEntry::new(token.to_string(), outcome);
        let value = serde_json::to_string(&StoredSlot::Ready {
            entry: entry.clone(),
        })?;
        conn.set_ex::<_, _, ()>(refresh_key(token), value, self.ttl_seconds)
            .await?;
        Ok(entry)
    }

    async fn get(&self, token: &str) -> Result<Lookup, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(refresh_key(token)).await?;
        match value {
            None => Ok(Lookup::Missing),
            Some(json) => Ok(match serde_json::from_str::<StoredSlot>(&json)? {
                StoredSlot::Pending => Lookup::Pending,
                StoredSlot::Ready { entry } => Lookup::Found(entry),
            }),
        }
    }
}

fn refresh_key(token: &str) -> String {
    format!("cookie-relay:refresh:{}", token)
}
