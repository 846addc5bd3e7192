// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Actor registry and session lock (component E).
//!
//! Each resident actor has exactly one [`ActorEntry`] reachable through the
//! registry's table. The entry's `(session, depth, busy)` triple *is* the
//! lock protocol visible to callers; `entry_mutex` only ever guards short
//! field updates and is never held across I/O, an external call, or a wait
//! on `busy`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::actor::Actor;
use crate::error::KarError;
use crate::kv::{KvError, KvStore};

const EXCLUSIVE: &str = "exclusive";
const REMINDER: &str = "reminder";

fn mangle_owner(actor: &Actor) -> String {
    format!("owner{sep}{}{sep}{}", actor.ty, actor.id, sep = crate::config::SEPARATOR)
}

struct EntryState {
    valid: bool,
    session: String,
    depth: u32,
    busy: CancellationToken,
    last_release: Option<Instant>,
}

impl EntryState {
    fn idle() -> Self {
        Self { valid: false, session: String::new(), depth: 0, busy: CancellationToken::new(), last_release: None }
    }
}

/// A resident actor's lock entry. Cheap to clone via `Arc`.
pub struct ActorEntry {
    pub actor: Actor,
    state: Mutex<EntryState>,
}

impl ActorEntry {
    fn new(actor: Actor) -> Arc<Self> {
        Arc::new(Self { actor, state: Mutex::new(EntryState::idle()) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-sidecar table of actor identities to locally held session locks.
pub struct ActorRegistry {
    table: DashMap<Actor, Arc<ActorEntry>>,
    kv: Arc<dyn KvStore>,
    sidecar_id: String,
    actor_timeout: std::time::Duration,
}

/// Outcome of a successful [`ActorRegistry::acquire`].
pub struct Acquired {
    pub entry: Arc<ActorEntry>,
    pub needs_activation: bool,
}

impl ActorRegistry {
    pub fn new(kv: Arc<dyn KvStore>, sidecar_id: impl Into<String>, actor_timeout: std::time::Duration) -> Self {
        Self { table: DashMap::new(), kv, sidecar_id: sidecar_id.into(), actor_timeout }
    }

    /// Who the shared KV currently believes owns `actor`. Claims ownership
    /// for this sidecar if nobody has claimed it yet (first acquirer wins);
    /// see `DESIGN.md` Open Question 5 for why this policy lives here.
    async fn get_sidecar(&self, actor: &Actor) -> Result<String, KarError> {
        let key = mangle_owner(actor);
        match self.kv.get(&key).await {
            Ok(owner) => Ok(owner),
            Err(KvError::Nil) => {
                let _ = self.kv.compare_and_set(&key, "", &self.sidecar_id).await;
                match self.kv.get(&key).await {
                    Ok(owner) => Ok(owner),
                    Err(KvError::Nil) => Ok(self.sidecar_id.clone()),
                    Err(e) => Err(KarError::Store(e.to_string())),
                }
            }
            Err(e) => Err(KarError::Store(e.to_string())),
        }
    }

    async fn compare_and_set_sidecar(&self, actor: &Actor, expected: &str, new: &str) -> Result<bool, KarError> {
        self.kv
            .compare_and_set(&mangle_owner(actor), expected, new)
            .await
            .map_err(|e| KarError::Store(e.to_string()))
    }

    /// Acquire the session lock for `actor`. `session` must not be empty.
    pub async fn acquire(
        &self,
        actor: &Actor,
        session: &str,
        cancel: &CancellationToken,
    ) -> Result<Acquired, KarError> {
        debug_assert!(!session.is_empty(), "acquire requires a non-empty session");

        loop {
            // Phase 1: a quick, lock-scoped peek. If the actor is already
            // resident, grab its entry and fall through to the ordinary
            // session/depth logic below. `table.get` never holds its shard
            // guard past this block.
            let existing = self.table.get(actor).map(|r| Arc::clone(r.value()));

            let entry = match existing {
                Some(entry) => entry,
                None => {
                    // Phase 2: consult ownership with no table or entry lock
                    // held, since this is an I/O round trip to the KV store.
                    let owner = self.get_sidecar(actor).await?;
                    if owner != self.sidecar_id {
                        return Err(KarError::ActorHasMoved);
                    }

                    let candidate = ActorEntry::new(actor.clone());
                    {
                        let mut state = candidate.lock();
                        state.valid = true;
                        state.session = session.to_owned();
                        state.depth = 1;
                        state.busy = CancellationToken::new();
                    }
                    // Someone may have activated the same actor while we were
                    // waiting on the KV round trip; only install ours if the
                    // slot is still vacant, and otherwise fall back to racing
                    // the entry that won, same as any other contended entry.
                    match self.table.entry(actor.clone()) {
                        dashmap::mapref::entry::Entry::Vacant(vacant) => {
                            vacant.insert(Arc::clone(&candidate));
                            return Ok(Acquired { entry: candidate, needs_activation: true });
                        }
                        dashmap::mapref::entry::Entry::Occupied(occupied) => Arc::clone(occupied.get()),
                    }
                }
            };

            let mut state = entry.lock();
            if !state.valid {
                drop(state);
                continue; // being torn down; loop and re-race
            }
            if state.session.is_empty() {
                state.session = session.to_owned();
                state.depth = 1;
                state.busy = CancellationToken::new();
                drop(state);
                return Ok(Acquired { entry, needs_activation: false });
            }
            if session == REMINDER || (session != EXCLUSIVE && session == state.session) {
                state.depth += 1;
                drop(state);
                return Ok(Acquired { entry, needs_activation: false });
            }

            let busy = state.busy.clone();
            drop(state);
            tokio::select! {
                _ = busy.cancelled() => continue,
                _ = cancel.cancelled() => return Err(KarError::Cancelled),
                _ = tokio::time::sleep(self.actor_timeout) => return Err(KarError::AcquireTimeout),
            }
        }
    }

    /// Release a held session. `invoked` must be true iff the application
    /// was actually called during this session.
    pub fn release(&self, entry: &ActorEntry, invoked: bool) {
        let mut state = entry.lock();
        state.depth -= 1;
        if invoked {
            state.last_release = Some(Instant::now());
        }
        if state.depth != 0 {
            return;
        }
        let became_invalid = !invoked;
        if became_invalid {
            state.valid = false;
        }
        state.session.clear();
        let busy = state.busy.clone();
        drop(state);
        if became_invalid {
            self.remove_if_same(&entry.actor, entry);
        }
        busy.cancel();
    }

    fn remove_if_same(&self, actor: &Actor, expected: &ActorEntry) {
        self.table.remove_if(actor, |_, v| std::ptr::eq(v.as_ref(), expected));
    }

    /// Idle-eviction sweep: deactivate and remove entries idle since before `before`.
    /// `deactivate` is the external callback invoked while the entry briefly
    /// holds an `"exclusive"` session. Stops early if `cancel` fires.
    pub async fn collect<F, Fut>(&self, before: Instant, cancel: &CancellationToken, deactivate: F)
    where
        F: Fn(Actor) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let candidates: Vec<Arc<ActorEntry>> = self.table.iter().map(|r| Arc::clone(r.value())).collect();
        for entry in candidates {
            if cancel.is_cancelled() {
                return;
            }
            let Ok(mut state) = entry.state.try_lock() else { continue };
            if !(state.valid && state.session.is_empty() && state.last_release.is_some_and(|t| t < before)) {
                continue;
            }
            state.depth = 1;
            state.session = EXCLUSIVE.to_owned();
            state.busy = CancellationToken::new();
            drop(state);

            let deactivated = deactivate(entry.actor.clone()).await;

            let mut state = entry.lock();
            state.depth -= 1;
            state.session.clear();
            if deactivated {
                state.valid = false;
            }
            let busy = state.busy.clone();
            drop(state);
            if deactivated {
                self.remove_if_same(&entry.actor, &entry);
            }
            busy.cancel();
        }
    }

    /// Release the held session while handing ownership of `actor` to
    /// `new_sidecar`. Precondition: the caller holds `entry` at `depth==1`.
    pub async fn migrate(&self, entry: &ActorEntry, new_sidecar: &str) -> Result<bool, KarError> {
        let mut state = entry.lock();
        state.depth -= 1;
        state.session.clear();
        state.valid = false;
        let busy = state.busy.clone();
        drop(state);
        self.remove_if_same(&entry.actor, entry);
        let result = self.compare_and_set_sidecar(&entry.actor, &self.sidecar_id, new_sidecar).await;
        busy.cancel();
        result
    }

    /// Snapshot of `{type -> [id...]}` for actors currently valid on this sidecar.
    pub fn get_actors(&self) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for r in self.table.iter() {
            let entry = r.value();
            let state = entry.lock();
            if state.valid {
                out.entry(entry.actor.ty.clone()).or_default().push(entry.actor.id.clone());
            }
        }
        out
    }

    /// Renders a merged `{type -> [id...]}` map as either JSON or the
    /// original's textual summary, capped at 10 IDs per type.
    pub fn render_actor_info(information: &HashMap<String, Vec<String>>, format: &str) -> String {
        if format == "json" || format == "application/json" {
            return serde_json::to_string(information).unwrap_or_else(|_| "{}".to_owned());
        }
        let mut out = String::from("\nActor Type\n : IDs of actors with type\n");
        for (ty, ids) in information {
            out.push_str(ty);
            out.push_str("\n : ");
            if ids.len() > 10 {
                out.push('[');
                for id in &ids[..10] {
                    out.push_str(id);
                    out.push(' ');
                }
                out.push_str(&format!("... and {} more]\n", ids.len() - 10));
            } else {
                out.push_str(&format!("{ids:?}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
