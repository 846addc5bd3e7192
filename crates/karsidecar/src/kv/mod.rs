// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared key-value store client (component A).

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a [`KvStore`] implementation.
#[derive(Debug, Error)]
pub enum KvError {
    /// The requested key does not exist. Distinguished from transport
    /// errors so callers can treat "absent" as a normal outcome.
    #[error("key not found")]
    Nil,

    /// Any other store-level failure (connection, protocol, timeout).
    #[error("store error: {0}")]
    Other(String),
}

/// Minimal shared key-value store surface the sidecar depends on.
///
/// Every operation is individually atomic; no multi-key transactions are
/// required by any caller in this crate.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, KvError>;

    /// Atomically set `key` to `new` iff its current value equals `expected`
    /// (or iff absent when `expected` is empty). Returns whether the set
    /// happened.
    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> Result<bool, KvError>;

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> Result<(), KvError>;

    async fn sorted_set_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError>;

    async fn sorted_set_rem_by_score(&self, key: &str, min: i64, max: i64) -> Result<(), KvError>;
}

pub fn mangle_partition(partition: i32) -> String {
    format!("partition{}{partition}", crate::config::SEPARATOR)
}

pub fn mangle_session(service: &str, session: &str) -> String {
    format!(
        "session{sep}{service}{sep}{session}",
        sep = crate::config::SEPARATOR
    )
}

pub fn mangle_live(sidecar: &str) -> String {
    format!("live{}{sidecar}", crate::config::SEPARATOR)
}
