// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::*;
use crate::kv::memory::MemoryKv;
use crate::router::ClusterView;

/// Delivers every `send`-ed envelope to whichever of the two dispatchers
/// under test its `to` field names, simulating the bus round trip without
/// a broker.
struct RoutingBus {
    tx: mpsc::UnboundedSender<(i32, String)>,
}

#[async_trait]
impl BusDriver for RoutingBus {
    async fn send(&self, partition: i32, body: &str) -> Result<(), crate::error::KarError> {
        self.tx
            .send((partition, body.to_owned()))
            .map_err(|_| crate::error::KarError::Bus("routing bus closed".into()))
    }

    async fn ensure_topic(&self) -> Result<(), crate::error::KarError> {
        Ok(())
    }

    async fn run(
        &self,
        _progress: Arc<ProgressTracker>,
        _router: Arc<Router>,
        _out: tokio::sync::mpsc::Sender<ForwardedMessage>,
        _cancel: CancellationToken,
    ) -> Result<(), crate::error::KarError> {
        Ok(())
    }
}

async fn two_sidecar_fixture() -> (Arc<Dispatcher>, Arc<Dispatcher>) {
    let kv = Arc::new(MemoryKv::new());
    let router = Arc::new(Router::new(Arc::clone(&kv)));
    router
        .apply_view(ClusterView {
            replicas: HashMap::new(),
            routes: HashMap::from([("sc-a".to_string(), vec![0]), ("sc-b".to_string(), vec![0])]),
        })
        .await;

    let registry_a = Arc::new(ActorRegistry::new(Arc::clone(&kv), "sc-a", Duration::from_secs(5)));
    let registry_b = Arc::new(ActorRegistry::new(Arc::clone(&kv), "sc-b", Duration::from_secs(5)));
    let progress_a = Arc::new(ProgressTracker::new(Arc::clone(&kv), "sc-a", "greeter"));
    let progress_b = Arc::new(ProgressTracker::new(Arc::clone(&kv), "sc-b", "greeter"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let bus: Arc<dyn BusDriver> = Arc::new(RoutingBus { tx });

    let dispatcher_a =
        Arc::new(Dispatcher::new(registry_a, progress_a, Arc::clone(&bus), Arc::clone(&router), "sc-a", 0));
    let dispatcher_b = Arc::new(Dispatcher::new(registry_b, progress_b, bus, router, "sc-b", 0));

    let cancel = CancellationToken::new();
    let actor = crate::actor::Actor::new("cart", "c-1").unwrap();
    dispatcher_b.registry.acquire(&actor, "s1", &cancel).await.unwrap();

    let (a, b) = (Arc::clone(&dispatcher_a), Arc::clone(&dispatcher_b));
    tokio::spawn(async move {
        while let Some((_, body)) = rx.recv().await {
            let value: HashMap<String, String> = serde_json::from_str(&body).unwrap();
            let target = if value.get("to").map(String::as_str) == Some("sc-a") { &a } else { &b };
            target.handle_sidecar_protocol(&value).await.unwrap();
        }
    });

    (dispatcher_a, dispatcher_b)
}

#[tokio::test]
async fn get_all_actors_merges_a_single_peers_reply() {
    let (dispatcher_a, _dispatcher_b) = two_sidecar_fixture().await;
    let cancel = CancellationToken::new();

    let json = dispatcher_a
        .get_all_actors(&["sc-b".to_string()], "json", &cancel)
        .await
        .unwrap();
    let parsed: HashMap<String, Vec<String>> = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.get("cart"), Some(&vec!["c-1".to_string()]));
}

#[tokio::test]
async fn get_all_actors_renders_the_textual_summary_when_format_is_not_json() {
    let (dispatcher_a, _dispatcher_b) = two_sidecar_fixture().await;
    let cancel = CancellationToken::new();

    let text = dispatcher_a
        .get_all_actors(&["sc-b".to_string()], "text", &cancel)
        .await
        .unwrap();
    assert!(text.contains("cart"));
    assert!(text.contains("c-1"));
}

#[tokio::test]
async fn get_all_actors_skips_querying_itself() {
    let (dispatcher_a, _dispatcher_b) = two_sidecar_fixture().await;
    let cancel = CancellationToken::new();

    // "sc-a" is in the peer list alongside itself; only "sc-b" should be
    // queried, and the merge should still surface sc-b's actor.
    let json = dispatcher_a
        .get_all_actors(&["sc-a".to_string(), "sc-b".to_string()], "json", &cancel)
        .await
        .unwrap();
    let parsed: HashMap<String, Vec<String>> = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.get("cart"), Some(&vec!["c-1".to_string()]));
}

#[tokio::test]
async fn handle_sidecar_protocol_ignores_unrecognized_commands() {
    let (dispatcher_a, _dispatcher_b) = two_sidecar_fixture().await;
    let value = HashMap::from([
        ("protocol".to_string(), "sidecar".to_string()),
        ("command".to_string(), "somethingElse".to_string()),
    ]);
    dispatcher_a.handle_sidecar_protocol(&value).await.unwrap();
}

#[tokio::test]
async fn handle_sidecar_protocol_drops_a_reply_with_no_matching_pending_query() {
    let (dispatcher_a, _dispatcher_b) = two_sidecar_fixture().await;
    let value = HashMap::from([
        ("protocol".to_string(), "sidecar".to_string()),
        ("command".to_string(), "getActorsReply".to_string()),
        ("requestId".to_string(), "no-such-request".to_string()),
        ("payload".to_string(), "{}".to_string()),
    ]);
    dispatcher_a.handle_sidecar_protocol(&value).await.unwrap();
}
