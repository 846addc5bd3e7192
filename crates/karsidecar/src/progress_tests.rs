// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::kv::memory::MemoryKv;

fn tracker() -> ProgressTracker {
    ProgressTracker::new(Arc::new(MemoryKv::new()), "sc-1", "greeter")
}

#[test]
fn confirm_is_idempotent_per_offset() {
    let t = tracker();
    assert!(t.confirm(0, 42));
    assert!(!t.confirm(0, 42));
    assert!(t.confirm(0, 43));
}

#[tokio::test]
async fn stale_confirmations_are_pruned_once_past_the_retention_window() {
    let t = tracker().with_retention(Some(Duration::from_millis(20)));
    assert!(t.confirm(0, 1));
    assert!(!t.confirm(0, 1), "not yet stale, dedup still applies");

    tokio::time::sleep(Duration::from_millis(30)).await;
    // Confirming a later offset on the same partition triggers the prune.
    assert!(t.confirm(0, 2));

    // Offset 1 aged out of `local`, so it is no longer deduplicated.
    assert!(t.confirm(0, 1));
}

#[test]
fn retention_disabled_by_default_never_prunes() {
    let t = tracker();
    assert!(t.confirm(0, 1));
    assert!(!t.confirm(0, 1));
}

#[tokio::test]
async fn mark_persists_and_drops_from_here_live() {
    let t = tracker();
    assert!(t.confirm(0, 42));
    t.mark(0, 42).await;

    // A fresh claim over partition 0 should now see 42 as done.
    let cursor = t.begin_claim(0, 0).await.unwrap();
    drop(cursor);

    // Republishing should no longer report 42 as in-flight.
    t.cleanup().await.unwrap();
    let live = t.kv.get(&crate::kv::mangle_live("sc-1")).await.unwrap();
    let parsed: LiveUserData = serde_json::from_str(&live).unwrap();
    assert!(parsed.live.get("0").map_or(true, |offsets| !offsets.contains(&42)));
}

#[tokio::test]
async fn setup_populates_done_from_kv_and_live_from_peers() {
    let t = tracker();
    t.kv.sorted_set_add(&crate::kv::mangle_partition(1), 10, "10").await.unwrap();
    t.kv.sorted_set_add(&crate::kv::mangle_partition(1), 11, "11").await.unwrap();

    let peers = vec![LiveUserData {
        sidecar: "sc-2".into(),
        service: "greeter".into(),
        live: BTreeMap::from([("1".to_string(), vec![20, 21])]),
    }];

    t.setup(&[1], &peers).await.unwrap();

    let mut cursor = t.begin_claim(1, 0).await.unwrap();
    assert!(matches!(cursor.classify(10, "{}").unwrap(), ClaimOutcome::SkipAndAdvance));
    assert!(matches!(cursor.classify(20, "{}").unwrap(), ClaimOutcome::Skip));
}

#[tokio::test]
async fn begin_claim_trims_completed_offsets_below_the_initial_offset() {
    let t = tracker();
    let key = crate::kv::mangle_partition(0);
    t.kv.sorted_set_add(&key, 1, "1").await.unwrap();
    t.kv.sorted_set_add(&key, 5, "5").await.unwrap();

    t.begin_claim(0, 5).await.unwrap();

    let remaining = t.kv.sorted_set_range(&key, 0, -1).await.unwrap();
    assert_eq!(remaining, vec!["5".to_string()]);
}

#[test]
fn classify_prefix_latches_false_once_a_message_is_neither_done_nor_live() {
    let live = HashSet::from([100]);
    let done = HashSet::from([1, 2]);
    let mut cursor = ClaimCursor::new(0, live, done, "sc-1".into(), "greeter".into());

    // done, prefix still true -> advance
    assert!(matches!(cursor.classify(1, "{}").unwrap(), ClaimOutcome::SkipAndAdvance));

    // neither done nor live -> forward, and this latches prefix false
    let body = r#"{"to":"sc-1","msg":"hi"}"#;
    match cursor.classify(3, body).unwrap() {
        ClaimOutcome::Forward(m) => {
            assert!(m.valid);
            assert_eq!(m.partition, 0);
            assert_eq!(m.offset, 3);
        }
        _ => panic!("expected Forward"),
    }

    // now that prefix is false, a later done offset must only Skip, not advance
    assert!(matches!(cursor.classify(2, "{}").unwrap(), ClaimOutcome::Skip));

    // a live offset always just skips and clears prefix (already false here)
    assert!(matches!(cursor.classify(100, "{}").unwrap(), ClaimOutcome::Skip));
}

#[test]
fn classify_marks_message_invalid_when_addressed_elsewhere() {
    let mut cursor = ClaimCursor::new(0, HashSet::new(), HashSet::new(), "sc-1".into(), "greeter".into());
    let body = r#"{"to":"other-service","msg":"hi"}"#;
    match cursor.classify(7, body).unwrap() {
        ClaimOutcome::Forward(m) => assert!(!m.valid),
        _ => panic!("expected Forward"),
    }
}

#[test]
fn classify_accepts_messages_addressed_to_the_owning_service() {
    let mut cursor = ClaimCursor::new(0, HashSet::new(), HashSet::new(), "sc-1".into(), "greeter".into());
    let body = r#"{"to":"greeter"}"#;
    match cursor.classify(7, body).unwrap() {
        ClaimOutcome::Forward(m) => assert!(m.valid),
        _ => panic!("expected Forward"),
    }
}

#[test]
fn classify_surfaces_decode_errors_for_malformed_bodies() {
    let mut cursor = ClaimCursor::new(0, HashSet::new(), HashSet::new(), "sc-1".into(), "greeter".into());
    assert!(cursor.classify(1, "not json").is_err());
}

mod proptests {
    use std::collections::HashSet as StdHashSet;

    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Confirm(i64),
        Mark(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        (0i64..8).prop_flat_map(|offset| prop_oneof![Just(Op::Confirm(offset)), Just(Op::Mark(offset))])
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Random confirm/mark interleavings against one partition must leave
        /// `here.Live` exactly equal to the offsets confirmed so far minus the
        /// offsets marked so far, regardless of ordering or repeats.
        #[test]
        fn here_live_tracks_confirmed_minus_marked(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let t = tracker();
                let mut confirmed: StdHashSet<i64> = StdHashSet::new();
                let mut marked: StdHashSet<i64> = StdHashSet::new();

                for op in ops {
                    match op {
                        Op::Confirm(offset) => {
                            t.confirm(0, offset);
                            confirmed.insert(offset);
                        }
                        Op::Mark(offset) => {
                            t.mark(0, offset).await;
                            marked.insert(offset);
                        }
                    }

                    let expected: StdHashSet<i64> = confirmed.difference(&marked).copied().collect();
                    let actual = t.lock().here_live.get(&0).cloned().unwrap_or_default();
                    assert_eq!(actual, expected);
                }
            });
        }
    }
}
