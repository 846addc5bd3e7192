// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Actor identity.

use serde::{Deserialize, Serialize};

/// Uniquely identifies an actor instance cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// Actor type, e.g. "cart".
    #[serde(rename = "type")]
    pub ty: String,
    /// Actor instance id.
    pub id: String,
}

impl Actor {
    pub fn new(ty: impl Into<String>, id: impl Into<String>) -> anyhow::Result<Self> {
        let ty = ty.into();
        let id = id.into();
        if ty.is_empty() || id.is_empty() {
            anyhow::bail!("actor type and id must be non-empty");
        }
        if ty.contains(crate::config::SEPARATOR) || id.contains(crate::config::SEPARATOR) {
            anyhow::bail!(
                "actor type and id must not contain the reserved separator {:?}",
                crate::config::SEPARATOR
            );
        }
        Ok(Self { ty, id })
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.ty, crate::config::SEPARATOR, self.id)
    }
}

#[cfg(test)]
#[path = "actor_tests.rs"]
mod tests;
