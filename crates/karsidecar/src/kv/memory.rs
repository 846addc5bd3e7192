// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory `KvStore` fake, for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{KvError, KvStore};

#[derive(Default)]
pub struct MemoryKv {
    strings: Mutex<std::collections::HashMap<String, String>>,
    sorted_sets: Mutex<std::collections::HashMap<String, BTreeMap<i64, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        self.strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or(KvError::Nil)
    }

    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> Result<bool, KvError> {
        let mut strings = self.strings.lock().unwrap_or_else(|e| e.into_inner());
        let current = strings.get(key).map(String::as_str).unwrap_or("");
        if current == expected {
            strings.insert(key.to_owned(), new.to_owned());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> Result<(), KvError> {
        self.sorted_sets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_owned())
            .or_default()
            .insert(score, member.to_owned());
        Ok(())
    }

    async fn sorted_set_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let sets = self.sorted_sets.lock().unwrap_or_else(|e| e.into_inner());
        let Some(set) = sets.get(key) else { return Ok(vec![]) };
        let members: Vec<String> = set.values().cloned().collect();
        Ok(slice_inclusive(&members, start, stop))
    }

    async fn sorted_set_rem_by_score(&self, key: &str, min: i64, max: i64) -> Result<(), KvError> {
        if let Some(set) = self
            .sorted_sets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(key)
        {
            set.retain(|score, _| *score < min || *score > max);
        }
        Ok(())
    }
}

/// Redis-style inclusive range with negative indices counting from the end.
fn slice_inclusive(items: &[String], start: isize, stop: isize) -> Vec<String> {
    let len = items.len() as isize;
    let norm = |i: isize| -> isize {
        if i < 0 {
            (len + i).max(0)
        } else {
            i.min(len)
        }
    };
    let start = norm(start);
    let stop = (norm(stop) + 1).min(len);
    if start >= stop {
        return vec![];
    }
    items[start as usize..stop as usize].to_vec()
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
