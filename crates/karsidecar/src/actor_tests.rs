// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn rejects_empty_fields() {
    assert!(Actor::new("", "a").is_err());
    assert!(Actor::new("cart", "").is_err());
}

#[test]
fn rejects_reserved_separator() {
    assert!(Actor::new("cart_v2", "a").is_err());
    assert!(Actor::new("cart", "a_1").is_err());
}

#[test]
fn equality_is_bytewise_on_both_fields() {
    let a = Actor::new("cart", "1").unwrap();
    let b = Actor::new("cart", "1").unwrap();
    let c = Actor::new("cart", "2").unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}
