// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn get_absent_is_nil() {
    let kv = MemoryKv::new();
    assert!(matches!(kv.get("missing").await, Err(KvError::Nil)));
}

#[tokio::test]
async fn compare_and_set_races() {
    let kv = MemoryKv::new();
    assert!(kv.compare_and_set("k", "", "a").await.unwrap());
    assert!(!kv.compare_and_set("k", "", "b").await.unwrap());
    assert!(kv.compare_and_set("k", "a", "b").await.unwrap());
    assert_eq!(kv.get("k").await.unwrap(), "b");
}

#[tokio::test]
async fn sorted_set_range_and_trim() {
    let kv = MemoryKv::new();
    for i in 0..10 {
        kv.sorted_set_add("p", i, &i.to_string()).await.unwrap();
    }
    let all = kv.sorted_set_range("p", 0, -1).await.unwrap();
    assert_eq!(all, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());

    kv.sorted_set_rem_by_score("p", 0, 3).await.unwrap();
    let remaining = kv.sorted_set_range("p", 0, -1).await.unwrap();
    assert_eq!(remaining, (4..10).map(|i| i.to_string()).collect::<Vec<_>>());
}

#[tokio::test]
async fn sorted_set_range_on_missing_key_is_empty() {
    let kv = MemoryKv::new();
    assert_eq!(kv.sorted_set_range("nope", 0, -1).await.unwrap(), Vec::<String>::new());
}
