// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher glue (component F): the last hop between the progress
//! tracker's output channel and the external application container. Not
//! the application's request/response contract itself, which is an
//! external collaborator (see `SPEC_FULL.md` §4.F) — only the well-formed
//! request this glue issues against a documented path convention.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bus::BusDriver;
use crate::progress::{ForwardedMessage, ProgressTracker};
use crate::registry::ActorRegistry;
use crate::router::Router;

/// How long `get_all_actors` waits for one peer's reply before giving up on it.
const SIDECAR_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Calls out to the application container on `127.0.0.1:service_port`,
/// following the path convention `/actor/{type}/{id}/{command}` with the
/// session carried as a query parameter and the remaining envelope fields
/// as the JSON body. Also answers `protocol:"sidecar"` envelopes addressed
/// to this sidecar, since those arrive through the same forwarded-message
/// channel as actor invocations (see `SPEC_FULL.md` §4.E/§4.F).
pub struct Dispatcher {
    registry: Arc<ActorRegistry>,
    progress: Arc<ProgressTracker>,
    bus: Arc<dyn BusDriver>,
    router: Arc<Router>,
    sidecar_id: String,
    client: Client,
    base_url: String,
    pending_actor_queries: DashMap<String, oneshot::Sender<String>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ActorRegistry>,
        progress: Arc<ProgressTracker>,
        bus: Arc<dyn BusDriver>,
        router: Arc<Router>,
        sidecar_id: impl Into<String>,
        service_port: u16,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            registry,
            progress,
            bus,
            router,
            sidecar_id: sidecar_id.into(),
            client,
            base_url: format!("http://127.0.0.1:{service_port}"),
            pending_actor_queries: DashMap::new(),
        }
    }

    /// Drains `inbox` until it closes or `cancel` fires. Every message is
    /// handled on its own task so that independent actors make progress
    /// concurrently; the registry's session lock is what serializes
    /// messages addressed to the same actor.
    pub async fn run(self: Arc<Self>, mut inbox: tokio::sync::mpsc::Receiver<ForwardedMessage>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.handle(msg, &cancel).await });
        }
    }

    async fn handle(&self, msg: ForwardedMessage, cancel: &CancellationToken) {
        let partition = msg.partition;
        let offset = msg.offset;

        if !self.progress.confirm(partition, offset) {
            tracing::debug!(partition, offset, "offset already confirmed, skipping duplicate delivery");
            return;
        }

        if msg.valid {
            if let Err(e) = self.dispatch(msg, cancel).await {
                tracing::warn!(partition, offset, error = %e, "dispatch failed");
            }
        } else {
            tracing::debug!(partition, offset, "message not addressed to this sidecar or service, discarding");
        }
        self.progress.mark(partition, offset).await;
    }

    async fn dispatch(&self, msg: ForwardedMessage, cancel: &CancellationToken) -> anyhow::Result<()> {
        if msg.value.get("protocol").map(String::as_str) == Some("sidecar") {
            return self.handle_sidecar_protocol(&msg.value).await;
        }

        let ty = msg
            .value
            .get("type")
            .ok_or_else(|| anyhow::anyhow!("envelope is missing actor type"))?;
        let id = msg
            .value
            .get("id")
            .ok_or_else(|| anyhow::anyhow!("envelope is missing actor id"))?;
        let command = msg.value.get("command").map(String::as_str).unwrap_or("tell");
        let session = msg
            .value
            .get("session")
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let actor = crate::actor::Actor::new(ty.clone(), id.clone())?;
        let acquired = self.registry.acquire(&actor, &session, cancel).await?;

        let result = self.invoke(&actor, command, &session, &msg.value).await;
        let invoked = result.is_ok();
        self.registry.release(&acquired.entry, invoked);
        result.map(|_| ())
    }

    /// Handles `protocol:"sidecar"` envelopes: a peer's `getActors` query
    /// (answered with this sidecar's own `get_actors()` snapshot), or the
    /// `getActorsReply` this sidecar receives back from a query it issued
    /// itself via [`Dispatcher::get_all_actors`].
    async fn handle_sidecar_protocol(&self, value: &HashMap<String, String>) -> anyhow::Result<()> {
        match value.get("command").map(String::as_str) {
            Some("getActors") => {
                let requester = value
                    .get("from")
                    .ok_or_else(|| anyhow::anyhow!("sidecar getActors query is missing the requester"))?;
                let request_id = value.get("requestId").cloned().unwrap_or_default();
                let payload = serde_json::to_string(&self.registry.get_actors())?;
                let reply = HashMap::from([
                    ("protocol".to_string(), "sidecar".to_string()),
                    ("to".to_string(), requester.clone()),
                    ("command".to_string(), "getActorsReply".to_string()),
                    ("requestId".to_string(), request_id),
                    ("payload".to_string(), payload),
                ]);
                let body = serde_json::to_string(&reply)?;
                let partition = self.router.route_to_sidecar(requester).await?;
                self.bus.send(partition, &body).await?;
                Ok(())
            }
            Some("getActorsReply") => {
                let request_id = value.get("requestId").cloned().unwrap_or_default();
                if let Some((_, tx)) = self.pending_actor_queries.remove(&request_id) {
                    let _ = tx.send(value.get("payload").cloned().unwrap_or_default());
                }
                Ok(())
            }
            other => {
                tracing::debug!(command = ?other, "unrecognized sidecar protocol command, ignoring");
                Ok(())
            }
        }
    }

    /// Fans out `protocol:"sidecar", command:"getActors"` to every sidecar in
    /// `peer_sidecars` other than this one, merges their replies with this
    /// sidecar's own `get_actors()`, and renders the result per `format`
    /// (`"json"`/`"application/json"` or the textual ≤10-IDs-per-type
    /// summary), matching the original `GetAllActors`.
    pub async fn get_all_actors(
        &self,
        peer_sidecars: &[String],
        format: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let mut merged = self.registry.get_actors();

        for sidecar in peer_sidecars {
            if sidecar == &self.sidecar_id {
                continue;
            }

            let request_id = uuid::Uuid::new_v4().to_string();
            let (tx, rx) = oneshot::channel();
            self.pending_actor_queries.insert(request_id.clone(), tx);

            let query = HashMap::from([
                ("protocol".to_string(), "sidecar".to_string()),
                ("to".to_string(), sidecar.clone()),
                ("from".to_string(), self.sidecar_id.clone()),
                ("command".to_string(), "getActors".to_string()),
                ("requestId".to_string(), request_id.clone()),
            ]);
            let body = serde_json::to_string(&query)?;
            let partition = match self.router.route_to_sidecar(sidecar).await {
                Ok(p) => p,
                Err(e) => {
                    self.pending_actor_queries.remove(&request_id);
                    tracing::warn!(sidecar, error = %e, "failed to route getActors query, skipping peer");
                    continue;
                }
            };
            self.bus.send(partition, &body).await?;

            let payload = tokio::select! {
                _ = cancel.cancelled() => {
                    self.pending_actor_queries.remove(&request_id);
                    return Err(anyhow::anyhow!("cancelled while awaiting actor info from {sidecar}"));
                }
                res = tokio::time::timeout(SIDECAR_QUERY_TIMEOUT, rx) => match res {
                    Ok(Ok(payload)) => payload,
                    Ok(Err(_)) => {
                        tracing::warn!(sidecar, "getActors reply channel dropped, skipping peer");
                        continue;
                    }
                    Err(_) => {
                        self.pending_actor_queries.remove(&request_id);
                        tracing::warn!(sidecar, "timed out waiting for getActors reply, skipping peer");
                        continue;
                    }
                },
            };

            let info: HashMap<String, Vec<String>> = serde_json::from_str(&payload)?;
            for (ty, ids) in info {
                merged.entry(ty).or_default().extend(ids);
            }
        }

        Ok(ActorRegistry::render_actor_info(&merged, format))
    }

    async fn invoke(
        &self,
        actor: &crate::actor::Actor,
        command: &str,
        session: &str,
        value: &std::collections::HashMap<String, String>,
    ) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/actor/{}/{}/{}", self.base_url, actor.ty, actor.id, command);
        let resp = self
            .client
            .post(url)
            .query(&[("session", session)])
            .json(value)
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
