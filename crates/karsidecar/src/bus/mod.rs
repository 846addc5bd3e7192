// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bus driver (component B): a partitioned, replayable log with consumer
//! groups. `kafka` holds the only production implementation; tests exercise
//! the progress tracker and router directly rather than against a fake bus,
//! since the dedup and routing logic live entirely in those modules.

pub mod kafka;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::KarError;
use crate::progress::{ForwardedMessage, ProgressTracker};
use crate::router::Router;

/// Transport the sidecar runs its message plane on.
#[async_trait]
pub trait BusDriver: Send + Sync {
    /// Sends `body` (a pre-encoded JSON envelope) to `partition`. The caller
    /// (the router) has already chosen the partition; the driver must not
    /// repartition.
    async fn send(&self, partition: i32, body: &str) -> Result<(), KarError>;

    /// Creates the per-application topic if it does not already exist.
    /// Idempotent; safe to call on every startup.
    async fn ensure_topic(&self) -> Result<(), KarError>;

    /// Drives consumer-group sessions until `cancel` fires: on every
    /// (re)balance, calls `progress.setup` for newly assigned partitions and
    /// `router.apply_view` with the freshly observed cluster view; forwards
    /// every message classified as neither done nor live to `out`; calls
    /// `progress.cleanup` before releasing an assignment.
    async fn run(
        &self,
        progress: Arc<ProgressTracker>,
        router: Arc<Router>,
        out: mpsc::Sender<ForwardedMessage>,
        cancel: CancellationToken,
    ) -> Result<(), KarError>;
}
