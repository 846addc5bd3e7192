// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed error kinds shared across the registry, router, and bus driver.

use thiserror::Error;

/// Caller-facing error kinds for actor acquisition.
#[derive(Debug, Error)]
pub enum KarError {
    /// The KV store reports a different sidecar owns this actor.
    #[error("actor has moved")]
    ActorHasMoved,

    /// Local lock contention exceeded the configured acquire timeout.
    #[error("timed out acquiring actor lock")]
    AcquireTimeout,

    /// The ambient cancellation token fired while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// A KV-store-level failure, not distinguished further by callers.
    #[error("store error: {0}")]
    Store(String),

    /// A bus-level failure, not distinguished further by callers.
    #[error("bus error: {0}")]
    Bus(String),
}

pub type KarResult<T> = Result<T, KarError>;
