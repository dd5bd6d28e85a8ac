//! Work stream: an append-only log of [`WorkItem`]s consumed through named
//! consumer groups.
//!
//! ## Delivery semantics
//!
//! The model follows Redis Streams (`XADD` / `XGROUP CREATE MKSTREAM` /
//! `XREADGROUP` / `XCLAIM` / `XACK`):
//!
//! * Each group keeps a cursor over the log. A claim hands the next unseen
//!   entry to exactly one consumer and records it in the group's pending
//!   entry list (PEL).
//! * An entry stays pending until acknowledged. Once it has been idle for
//!   longer than the caller's threshold, any consumer may reclaim it; this is
//!   how work held by a dead worker is recovered. A live holder keeps its
//!   entry by calling [`WorkStream::touch`] more often than that threshold
//!   (`XCLAIM ... JUSTID` by the same consumer), and checks the return value
//!   before writing anything for the entry.
//! * Creating a stream or group that already exists is a no-op (the
//!   `BUSYGROUP` case).

use crate::error::Script2JsonError;
use crate::model::WorkItem;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// One entry handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Stream entry id; pass it back to [`WorkStream::ack`].
    pub entry_id: String,
    pub item: WorkItem,
    /// 1 on first delivery, incremented on every reclaim.
    pub delivery_count: u32,
}

/// Durable queue with consumer-group fan-out.
#[async_trait]
pub trait WorkStream: Send + Sync {
    /// Create the stream if missing.
    async fn ensure_stream(&self, stream: &str) -> Result<(), Script2JsonError>;

    /// Create the group (and stream) if missing. New groups start at the
    /// beginning of the log.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Script2JsonError>;

    /// Append an item; returns its entry id.
    async fn append(&self, stream: &str, item: &WorkItem) -> Result<String, Script2JsonError>;

    /// Hand one entry to `consumer`: first a pending entry idle for at least
    /// `min_idle`, otherwise the next never-delivered entry.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, Script2JsonError>;

    /// Reset the idle clock of an entry held by `consumer`.
    ///
    /// Returns `false` when the entry is no longer pending for `consumer`:
    /// it was acknowledged or reclaimed by someone else.
    async fn touch(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
        consumer: &str,
    ) -> Result<bool, Script2JsonError>;

    /// Remove an entry from the group's pending list. Unknown ids are ignored.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), Script2JsonError>;

    /// Number of delivered-but-unacknowledged entries in a group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, Script2JsonError>;
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Position of the next never-delivered entry.
    cursor: usize,
    /// Keyed by log position so reclaim order follows the log.
    pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: Vec<WorkItem>,
    groups: HashMap<String, GroupState>,
}

/// [`WorkStream`] held in process memory.
#[derive(Debug, Default)]
pub struct MemoryWorkStream {
    streams: Mutex<HashMap<String, StreamLog>>,
}

impl MemoryWorkStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamLog>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn entry_id(position: usize) -> String {
    format!("{}-0", position + 1)
}

fn parse_entry_id(id: &str) -> Option<usize> {
    let seq = id.split('-').next()?.parse::<usize>().ok()?;
    seq.checked_sub(1)
}

fn no_group(stream: &str, group: &str) -> Script2JsonError {
    Script2JsonError::StreamUnavailable {
        stream: stream.to_string(),
        detail: format!("NOGROUP no consumer group '{group}'"),
    }
}

#[async_trait]
impl WorkStream for MemoryWorkStream {
    async fn ensure_stream(&self, stream: &str) -> Result<(), Script2JsonError> {
        self.lock().entry(stream.to_string()).or_default();
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Script2JsonError> {
        let mut streams = self.lock();
        let log = streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            debug!(stream, group, "consumer group already exists");
        } else {
            log.groups.insert(group.to_string(), GroupState::default());
            info!(stream, group, "created consumer group");
        }
        Ok(())
    }

    async fn append(&self, stream: &str, item: &WorkItem) -> Result<String, Script2JsonError> {
        let mut streams = self.lock();
        let log = streams.entry(stream.to_string()).or_default();
        log.entries.push(item.clone());
        Ok(entry_id(log.entries.len() - 1))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, Script2JsonError> {
        let mut streams = self.lock();
        let log = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let StreamLog { entries, groups } = log;
        let state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();

        // XCLAIM: the oldest entry whose holder has gone quiet.
        let stale = state
            .pending
            .iter()
            .find(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(pos, _)| *pos);
        if let Some(pos) = stale {
            if let Some(p) = state.pending.get_mut(&pos) {
                info!(
                    stream, group, entry = %entry_id(pos),
                    from = %p.consumer, to = consumer, "reclaiming idle entry"
                );
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.delivery_count += 1;
                return Ok(Some(Delivery {
                    entry_id: entry_id(pos),
                    item: entries[pos].clone(),
                    delivery_count: p.delivery_count,
                }));
            }
        }

        // XREADGROUP >: the next never-delivered entry.
        if state.cursor >= entries.len() {
            return Ok(None);
        }
        let pos = state.cursor;
        state.cursor += 1;
        state.pending.insert(
            pos,
            PendingEntry {
                consumer: consumer.to_string(),
                delivered_at: now,
                delivery_count: 1,
            },
        );
        Ok(Some(Delivery {
            entry_id: entry_id(pos),
            item: entries[pos].clone(),
            delivery_count: 1,
        }))
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), Script2JsonError> {
        let mut streams = self.lock();
        let state = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        if let Some(pos) = parse_entry_id(entry_id) {
            state.pending.remove(&pos);
        }
        Ok(())
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
        consumer: &str,
    ) -> Result<bool, Script2JsonError> {
        let mut streams = self.lock();
        let state = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        let held = parse_entry_id(entry_id)
            .and_then(|pos| state.pending.get_mut(&pos))
            .filter(|p| p.consumer == consumer);
        match held {
            Some(p) => {
                p.delivered_at = Instant::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, Script2JsonError> {
        let streams = self.lock();
        let state = streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(state.pending.len())
    }
}
