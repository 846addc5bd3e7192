// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Router (component D): resolves a service or session name to a concrete
//! `(partition, sidecar)` pair against the bus driver's cluster view.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::KarError;
use crate::kv::{mangle_session, KvStore};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// `replicas`/`routes`, refreshed wholesale on every rebalance.
#[derive(Default, Clone)]
pub struct ClusterView {
    pub replicas: HashMap<String, Vec<String>>,
    pub routes: HashMap<String, Vec<i32>>,
}

pub struct Router {
    view: RwLock<ClusterView>,
    kv: Arc<dyn KvStore>,
}

impl Router {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { view: RwLock::new(ClusterView::default()), kv }
    }

    /// Installs a freshly rebuilt view, replacing the previous one wholesale.
    /// Called by the bus driver after every rebalance.
    pub async fn apply_view(&self, view: ClusterView) {
        *self.view.write().await = view;
    }

    /// Picks a sidecar carrying `service`, then a partition of that sidecar's,
    /// retrying with exponential backoff while the view has no candidates.
    pub async fn route_to_service(
        &self,
        service: &str,
        cancel: &CancellationToken,
    ) -> Result<(i32, String), KarError> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return Err(KarError::Cancelled);
            }
            let candidate = {
                let view = self.view.read().await;
                view.replicas
                    .get(service)
                    .and_then(|sidecars| sidecars.choose(&mut rand::rng()).cloned())
            };
            let Some(sidecar) = candidate else {
                Self::wait_backoff(&mut backoff, cancel).await?;
                continue;
            };
            match self.route_to_sidecar(&sidecar).await {
                Ok(partition) => return Ok((partition, sidecar)),
                Err(_) => {
                    // The view raced with a rebalance; this sidecar's
                    // partitions haven't landed yet. Back off and retry.
                    Self::wait_backoff(&mut backoff, cancel).await?;
                }
            }
        }
    }

    /// Single-shot: picks a random partition belonging to `sidecar`.
    pub async fn route_to_sidecar(&self, sidecar: &str) -> Result<i32, KarError> {
        let view = self.view.read().await;
        view.routes
            .get(sidecar)
            .and_then(|partitions| partitions.choose(&mut rand::rng()).copied())
            .ok_or_else(|| KarError::Bus(format!("sidecar {sidecar} has no partitions in the current view")))
    }

    /// Resolves a sticky session binding, creating one if absent and
    /// re-racing if a concurrent binder wins the compare-and-set.
    pub async fn route_to_session(
        &self,
        service: &str,
        session: &str,
        cancel: &CancellationToken,
    ) -> Result<i32, KarError> {
        let key = mangle_session(service, session);
        loop {
            if cancel.is_cancelled() {
                return Err(KarError::Cancelled);
            }
            let bound = self.kv.get(&key).await;
            let old_sidecar = match bound {
                Ok(sidecar) => {
                    if let Ok(partition) = self.route_to_sidecar(&sidecar).await {
                        return Ok(partition);
                    }
                    sidecar
                }
                Err(crate::kv::KvError::Nil) => String::new(),
                Err(e) => return Err(KarError::Store(e.to_string())),
            };

            let (_, candidate) = self.route_to_service(service, cancel).await?;
            let won = self
                .kv
                .compare_and_set(&key, &old_sidecar, &candidate)
                .await
                .map_err(|e| KarError::Store(e.to_string()))?;
            if won {
                return self.route_to_sidecar(&candidate).await;
            }
            // Lost the race; the winner's binding is now observable. Loop.
        }
    }

    async fn wait_backoff(backoff: &mut Duration, cancel: &CancellationToken) -> Result<(), KarError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(KarError::Cancelled),
            _ = tokio::time::sleep(*backoff) => {
                *backoff = (*backoff * 2).min(MAX_BACKOFF);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
