// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `rdkafka`-backed [`BusDriver`].
//!
//! Rebalance callbacks fire on `rdkafka`'s internal poll thread and cannot
//! await; they forward events over an unbounded channel that the consume
//! loop itself drains, so the async `progress.setup`/`cleanup` and
//! `router.apply_view` calls run on the same task that owns the claim
//! cursors (see `SPEC_FULL.md` §10.5 for why consumer-group membership is
//! resolved via group-describe plus the `live_<sidecar>` KV mirror, rather
//! than via native join-group user-data bytes).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::KarError;
use crate::kv::{mangle_live, KvError, KvStore};
use crate::progress::{ClaimCursor, ClaimOutcome, ForwardedMessage, LiveUserData, ProgressTracker};
use crate::router::{ClusterView, Router};

use super::BusDriver;

enum RebalanceEvent {
    PreRevoke,
    PostAssign(Vec<i32>),
}

/// Bridges `rdkafka`'s synchronous rebalance callbacks into the async
/// consume loop. Grounded in the `StatefulConsumerContext` pattern from
/// `PostHog/posthog`'s `rust-kafka-deduplicator`.
struct RebalanceContext {
    topic: String,
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(_) = rebalance {
            let _ = self.events.send(RebalanceEvent::PreRevoke);
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            let partitions = tpl
                .elements()
                .iter()
                .filter(|e| e.topic() == self.topic)
                .map(|e| e.partition())
                .collect();
            let _ = self.events.send(RebalanceEvent::PostAssign(partitions));
        }
    }
}

pub struct KafkaBus {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    base_config: ClientConfig,
    kv: Arc<dyn KvStore>,
    topic: String,
    group_id: String,
    sidecar_id: String,
    service: String,
}

impl KafkaBus {
    pub fn new(
        brokers: &[String],
        app: &str,
        service: &str,
        sidecar_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        enable_tls: bool,
        kv: Arc<dyn KvStore>,
    ) -> anyhow::Result<Self> {
        let topic = format!("kar{sep}{app}", sep = crate::config::SEPARATOR);

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", brokers.join(","))
            .set("client.id", sidecar_id)
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("group.id", &topic)
            .set("partition.assignment.strategy", "range");

        if let Some(password) = password.filter(|p| !p.is_empty()) {
            config
                .set("security.protocol", if enable_tls { "SASL_SSL" } else { "SASL_PLAINTEXT" })
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", username.unwrap_or_default())
                .set("sasl.password", password);
        } else if enable_tls {
            config.set("security.protocol", "SSL");
        }

        let producer: FutureProducer = config.create()?;
        let admin: AdminClient<DefaultClientContext> = config.create()?;

        Ok(Self {
            producer,
            admin,
            base_config: config,
            kv,
            group_id: topic.clone(),
            topic,
            sidecar_id: sidecar_id.to_owned(),
            service: service.to_owned(),
        })
    }

    async fn describe_group_view(&self, assigned: &[i32]) -> Result<(ClusterView, Vec<LiveUserData>), KarError> {
        let groups = self
            .admin
            .describe_consumer_groups(&[self.group_id.as_str()], AdminOptions::new())
            .await
            .map_err(|e| KarError::Bus(e.to_string()))?;
        let group = groups
            .into_iter()
            .next()
            .ok_or_else(|| KarError::Bus("consumer group not found in describe response".into()))?;

        let mut replicas: HashMap<String, Vec<String>> = HashMap::new();
        let mut routes: HashMap<String, Vec<i32>> = HashMap::new();
        let mut peers = Vec::new();

        for member in group.members() {
            let sidecar = member.client_id().to_owned();
            let partitions: Vec<i32> = member
                .assignment()
                .map(|tpl| {
                    tpl.elements()
                        .iter()
                        .filter(|e| e.topic() == self.topic)
                        .map(|e| e.partition())
                        .collect()
                })
                .unwrap_or_default();
            routes.insert(sidecar.clone(), if sidecar == self.sidecar_id { assigned.to_vec() } else { partitions });

            if sidecar == self.sidecar_id {
                replicas.entry(self.service.clone()).or_default().push(sidecar);
                continue;
            }

            match self.kv.get(&mangle_live(&sidecar)).await {
                Ok(raw) => match serde_json::from_str::<LiveUserData>(&raw) {
                    Ok(peer) => {
                        replicas.entry(peer.service.clone()).or_default().push(sidecar);
                        peers.push(peer);
                    }
                    Err(e) => tracing::warn!(sidecar, error = %e, "malformed peer live-offset publication"),
                },
                Err(KvError::Nil) => {
                    tracing::debug!(sidecar, "peer has not published live offsets yet");
                }
                Err(e) => tracing::warn!(sidecar, error = %e, "failed to read peer live offsets"),
            }
        }

        Ok((ClusterView { replicas, routes }, peers))
    }

    async fn handle_message(
        &self,
        progress: &ProgressTracker,
        cursors: &mut HashMap<i32, ClaimCursor>,
        consumer: &StreamConsumer<RebalanceContext>,
        partition: i32,
        offset: i64,
        body: &str,
        out: &mpsc::Sender<ForwardedMessage>,
        cancel: &CancellationToken,
    ) {
        let cursor = match cursors.entry(partition) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => match progress.begin_claim(partition, offset).await {
                Ok(cursor) => v.insert(cursor),
                Err(e) => {
                    tracing::error!(partition, error = %e, "failed to begin claim");
                    return;
                }
            },
        };

        match cursor.classify(offset, body) {
            Ok(ClaimOutcome::Skip) => {}
            Ok(ClaimOutcome::SkipAndAdvance) => {
                if let Err(e) = consumer.store_offset(&self.topic, partition, offset) {
                    tracing::warn!(partition, offset, error = %e, "failed to store consumer offset");
                }
            }
            Ok(ClaimOutcome::Forward(msg)) => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    res = out.send(msg) => {
                        if res.is_err() {
                            tracing::warn!("dispatcher channel closed while forwarding message");
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(partition, offset, error = %e, "malformed message envelope"),
        }
    }
}

#[async_trait]
impl BusDriver for KafkaBus {
    async fn send(&self, partition: i32, body: &str) -> Result<(), KarError> {
        let record: FutureRecord<'_, (), str> = FutureRecord::to(&self.topic).partition(partition).payload(body);
        self.producer
            .send(record, Timeout::After(Duration::from_secs(10)))
            .await
            .map_err(|(e, _)| KarError::Bus(e.to_string()))?;
        Ok(())
    }

    async fn ensure_topic(&self) -> Result<(), KarError> {
        let opts = AdminOptions::new();
        let preferred = NewTopic::new(&self.topic, 10, TopicReplication::Fixed(3));
        let result = self.admin.create_topics(&[preferred], &opts).await;
        let needs_fallback = match &result {
            Ok(results) => results.iter().any(|r| r.is_err()),
            Err(_) => true,
        };
        if needs_fallback {
            let fallback = NewTopic::new(&self.topic, 10, TopicReplication::Fixed(1));
            self.admin
                .create_topics(&[fallback], &opts)
                .await
                .map_err(|e| KarError::Bus(e.to_string()))?;
        }
        Ok(())
    }

    async fn run(
        &self,
        progress: Arc<ProgressTracker>,
        router: Arc<Router>,
        out: mpsc::Sender<ForwardedMessage>,
        cancel: CancellationToken,
    ) -> Result<(), KarError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = RebalanceContext { topic: self.topic.clone(), events: tx };
        let consumer: StreamConsumer<RebalanceContext> = self
            .base_config
            .create_with_context(ctx)
            .map_err(|e| KarError::Bus(e.to_string()))?;
        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| KarError::Bus(e.to_string()))?;

        let mut cursors: HashMap<i32, ClaimCursor> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = rx.recv() => {
                    match event {
                        RebalanceEvent::PreRevoke => {
                            cursors.clear();
                            if let Err(e) = progress.cleanup().await {
                                tracing::warn!(error = %e, "progress cleanup before revoke failed");
                            }
                        }
                        RebalanceEvent::PostAssign(partitions) => {
                            cursors.clear();
                            match self.describe_group_view(&partitions).await {
                                Ok((view, peers)) => {
                                    router.apply_view(view).await;
                                    if let Err(e) = progress.setup(&partitions, &peers).await {
                                        tracing::error!(error = %e, "progress setup failed after rebalance");
                                    }
                                }
                                Err(e) => tracing::error!(error = %e, "failed to resolve cluster view after rebalance"),
                            }
                        }
                    }
                }
                msg = consumer.recv() => {
                    match msg {
                        Ok(borrowed) => {
                            let partition = borrowed.partition();
                            let offset = borrowed.offset();
                            let payload = borrowed.payload().map(|b| b.to_vec());
                            drop(borrowed);
                            if let Some(bytes) = payload {
                                let body = String::from_utf8_lossy(&bytes).into_owned();
                                self.handle_message(&progress, &mut cursors, &consumer, partition, offset, &body, &out, &cancel).await;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "kafka consumer error"),
                    }
                }
            }
        }
        Ok(())
    }
}
