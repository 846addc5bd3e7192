// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Progress tracker (component C): the four offset sets and the per-claim
//! dedup state machine that decides what a consumer-group rebalance replay
//! should skip, advance past, or forward to the dispatcher.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::KarError;
use crate::kv::{mangle_live, mangle_partition, KvStore};

/// This sidecar's most recently published in-flight offsets, the wire shape
/// mirrored into `live_<sidecar>` (see `SPEC_FULL.md` §10.5) and carried
/// as consumer-group member user-data where the bus driver can express it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveUserData {
    pub sidecar: String,
    pub service: String,
    /// partition number, stringified, since JSON object keys must be strings.
    pub live: BTreeMap<String, Vec<i64>>,
}

#[derive(Default)]
struct ProgressState {
    here_live: HashMap<i32, HashSet<i64>>,
    local: HashMap<i32, HashSet<i64>>,
    /// When each still-tracked `local[p]` offset was confirmed, ordered by
    /// offset rather than by wall-clock time: offsets within one partition
    /// arrive from the bus in increasing order, so offset order is also
    /// confirm order, and pruning the lowest offsets first prunes the
    /// oldest ones.
    local_confirmed_at: HashMap<i32, BTreeMap<i64, Instant>>,
    live: HashMap<i32, HashSet<i64>>,
    done: HashMap<i32, HashSet<i64>>,
}

pub struct ProgressTracker {
    kv: std::sync::Arc<dyn KvStore>,
    sidecar_id: String,
    service: String,
    state: Mutex<ProgressState>,
    /// How long a `local[p]` entry is kept before it is eligible for
    /// pruning. `None` disables pruning (unbounded growth), the default.
    retain: Option<Duration>,
}

impl ProgressTracker {
    pub fn new(kv: std::sync::Arc<dyn KvStore>, sidecar_id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            kv,
            sidecar_id: sidecar_id.into(),
            service: service.into(),
            state: Mutex::new(ProgressState::default()),
            retain: None,
        }
    }

    /// Sets the retention window for `local[p]` offsets (`--progress-retain-ms`).
    pub fn with_retention(mut self, retain: Option<Duration>) -> Self {
        self.retain = retain;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records that this sidecar is starting (or has already started)
    /// `offset` on `partition`. Returns false if it was already recorded.
    pub fn confirm(&self, partition: i32, offset: i64) -> bool {
        let mut state = self.lock();
        {
            let local = state.local.entry(partition).or_default();
            if local.contains(&offset) {
                return false;
            }
            local.insert(offset);
        }
        state.local_confirmed_at.entry(partition).or_default().insert(offset, Instant::now());
        state.here_live.entry(partition).or_default().insert(offset);
        if let Some(retain) = self.retain {
            prune_local(&mut state, partition, retain);
        }
        true
    }

    /// Persists `offset` as complete and drops it from the in-flight set.
    /// A KV write failure is logged, not propagated: the next rebalance
    /// republishes `here.Live` and the offset is retried downstream.
    pub async fn mark(&self, partition: i32, offset: i64) {
        let key = mangle_partition(partition);
        if let Err(e) = self.kv.sorted_set_add(&key, offset, &offset.to_string()).await {
            tracing::warn!(partition, offset, error = %e, "failed to persist completed offset");
        }
        let mut state = self.lock();
        if let Some(live) = state.here_live.get_mut(&partition) {
            live.remove(&offset);
        }
        if let Some(retain) = self.retain {
            prune_local(&mut state, partition, retain);
        }
    }

    /// Session setup: for each partition newly assigned to this sidecar,
    /// populates `done[p]` from the shared KV and `live[p]` from the union
    /// of every peer's announced in-flight offsets for that partition.
    pub async fn setup(&self, assigned: &[i32], peers: &[LiveUserData]) -> Result<(), KarError> {
        for &partition in assigned {
            let key = mangle_partition(partition);
            let members = self
                .kv
                .sorted_set_range(&key, 0, -1)
                .await
                .map_err(|e| KarError::Store(e.to_string()))?;
            let done: HashSet<i64> = members.iter().filter_map(|m| m.parse().ok()).collect();

            let mut live: HashSet<i64> = HashSet::new();
            let partition_key = partition.to_string();
            for peer in peers {
                if let Some(offsets) = peer.live.get(&partition_key) {
                    live.extend(offsets.iter().copied());
                }
            }

            let mut state = self.lock();
            state.done.insert(partition, done);
            state.live.insert(partition, live);
        }
        Ok(())
    }

    /// Begins a claim: trims the completed set below the claim's starting
    /// offset, then snapshots `live[p]`/`done[p]` (stable for the claim's
    /// lifetime, since they are only written during `setup`).
    pub async fn begin_claim(&self, partition: i32, initial_offset: i64) -> Result<ClaimCursor, KarError> {
        if initial_offset > 0 {
            let key = mangle_partition(partition);
            self.kv
                .sorted_set_rem_by_score(&key, 0, initial_offset - 1)
                .await
                .map_err(|e| KarError::Store(e.to_string()))?;
        }
        let state = self.lock();
        let live = state.live.get(&partition).cloned().unwrap_or_default();
        let done = state.done.get(&partition).cloned().unwrap_or_default();
        drop(state);
        Ok(ClaimCursor::new(partition, live, done, self.sidecar_id.clone(), self.service.clone()))
    }

    /// Republishes this sidecar's in-flight offsets before releasing an
    /// assignment, both as the bus's own member user-data (handled by the
    /// caller, which owns the session) and mirrored into `live_<sidecar>`.
    pub async fn cleanup(&self) -> Result<(), KarError> {
        let snapshot = {
            let state = self.lock();
            LiveUserData {
                sidecar: self.sidecar_id.clone(),
                service: self.service.clone(),
                live: state
                    .here_live
                    .iter()
                    .map(|(p, offsets)| (p.to_string(), offsets.iter().copied().collect()))
                    .collect(),
            }
        };
        let body = serde_json::to_string(&snapshot).map_err(|e| KarError::Bus(e.to_string()))?;
        let key = mangle_live(&self.sidecar_id);
        let previous = self.kv.get(&key).await.unwrap_or_default();
        if let Err(e) = self.kv.compare_and_set(&key, &previous, &body).await {
            tracing::warn!(error = %e, "failed to republish live offsets");
        }
        Ok(())
    }
}

/// Drops the oldest confirmed offsets of `partition` from `local`/
/// `local_confirmed_at` once they have aged past `retain`. Best-effort: a
/// dropped offset that is later redelivered is treated as unseen and
/// reprocessed, which is safe (at-least-once) but no longer deduplicated.
fn prune_local(state: &mut ProgressState, partition: i32, retain: Duration) {
    let Some(cutoff) = Instant::now().checked_sub(retain) else { return };
    let Some(timestamps) = state.local_confirmed_at.get_mut(&partition) else { return };
    let stale: Vec<i64> = timestamps
        .iter()
        .take_while(|&(_, &confirmed_at)| confirmed_at < cutoff)
        .map(|(&offset, _)| offset)
        .collect();
    if stale.is_empty() {
        return;
    }
    for offset in &stale {
        timestamps.remove(offset);
    }
    if let Some(local) = state.local.get_mut(&partition) {
        for offset in &stale {
            local.remove(offset);
        }
    }
}

/// Per-claim dedup state machine (the `prefix` latch in `SPEC_FULL.md`
/// §4.C), decoupled from any real consumer so it is plainly unit-testable.
pub struct ClaimCursor {
    partition: i32,
    live: HashSet<i64>,
    done: HashSet<i64>,
    prefix: bool,
    sidecar_id: String,
    service: String,
}

/// What a claim loop should do with one message.
pub enum ClaimOutcome {
    /// Already in flight elsewhere; leave the cursor where it is.
    Skip,
    /// Already complete and still within the unbroken done-prefix; advance
    /// the consumer cursor past it.
    SkipAndAdvance,
    /// Neither done nor live: hand off to the dispatcher.
    Forward(ForwardedMessage),
}

/// A message ready for the dispatcher, decoded from its envelope.
pub struct ForwardedMessage {
    pub value: HashMap<String, String>,
    pub valid: bool,
    pub partition: i32,
    pub offset: i64,
}

impl ClaimCursor {
    fn new(partition: i32, live: HashSet<i64>, done: HashSet<i64>, sidecar_id: String, service: String) -> Self {
        Self { partition, live, done, prefix: true, sidecar_id, service }
    }

    /// Classifies one message. `body` is the raw JSON envelope; it is only
    /// decoded when the message is neither live nor done.
    pub fn classify(&mut self, offset: i64, body: &str) -> Result<ClaimOutcome, serde_json::Error> {
        if self.live.contains(&offset) {
            self.prefix = false;
            return Ok(ClaimOutcome::Skip);
        }
        if self.done.contains(&offset) {
            return Ok(if self.prefix { ClaimOutcome::SkipAndAdvance } else { ClaimOutcome::Skip });
        }
        self.prefix = false;
        let value: HashMap<String, String> = serde_json::from_str(body)?;
        let valid = value
            .get("to")
            .is_some_and(|to| to == &self.sidecar_id || to == &self.service);
        Ok(ClaimOutcome::Forward(ForwardedMessage { value, valid, partition: self.partition, offset }))
    }
}

#[cfg(test)]
#[path = "progress_tests.rs"]
mod tests;
