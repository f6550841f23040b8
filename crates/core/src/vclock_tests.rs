// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use yare::parameterized;

#[test]
fn missing_entry_reads_as_zero() {
    let clock = VectorClock::new();
    assert_eq!(clock.get("alice"), 0);
    assert!(clock.is_empty());
}

#[test]
fn increment_only_touches_own_entry() {
    let mut clock: VectorClock = [("bob", 4)].into_iter().collect();

    assert_eq!(clock.increment("alice"), 1);
    assert_eq!(clock.increment("alice"), 2);
    assert_eq!(clock.get("alice"), 2);
    assert_eq!(clock.get("bob"), 4);
}

#[test]
fn merge_takes_pointwise_max() {
    let mut a: VectorClock = [("alice", 3), ("bob", 1)].into_iter().collect();
    let b: VectorClock = [("alice", 2), ("bob", 5), ("carol", 1)].into_iter().collect();

    a.merge(&b);

    assert_eq!(a.get("alice"), 3);
    assert_eq!(a.get("bob"), 5);
    assert_eq!(a.get("carol"), 1);
}

#[test]
fn merged_leaves_inputs_untouched() {
    let a: VectorClock = [("alice", 1)].into_iter().collect();
    let b: VectorClock = [("bob", 1)].into_iter().collect();

    let m = a.merged(&b);

    assert_eq!(a.get("bob"), 0);
    assert_eq!(m.get("alice"), 1);
    assert_eq!(m.get("bob"), 1);
}

#[test]
fn serializes_as_open_string_keyed_map() {
    let clock: VectorClock = [("did:key:a", 2), ("did:key:b", 7)].into_iter().collect();
    let json = clock.to_json().unwrap();
    assert_eq!(json, r#"{"did:key:a":2,"did:key:b":7}"#);

    let parsed: VectorClock = json.parse().unwrap();
    assert_eq!(parsed, clock);
}

#[test]
fn accepts_foreign_keys_on_parse() {
    let parsed: VectorClock = r#"{"zed":1,"anything goes":9}"#.parse().unwrap();
    assert_eq!(parsed.get("anything goes"), 9);
}

#[parameterized(
    not_json = { "alice:1" },
    negative = { r#"{"alice":-1}"# },
    array = { "[1,2]" },
    string_value = { r#"{"alice":"1"}"# },
)]
fn parse_errors(input: &str) {
    assert!(matches!(input.parse::<VectorClock>(), Err(Error::CorruptedData(_))));
}

#[test]
fn blank_string_parses_as_empty_clock() {
    let parsed: VectorClock = "".parse().unwrap();
    assert!(parsed.is_empty());
}

#[test]
fn display_is_compact() {
    let clock: VectorClock = [("alice", 3), ("bob", 1)].into_iter().collect();
    assert_eq!(clock.to_string(), "{alice:3, bob:1}");
}

#[test]
fn keys_with_is_union() {
    let a: VectorClock = [("alice", 1), ("bob", 1)].into_iter().collect();
    let b: VectorClock = [("bob", 2), ("carol", 1)].into_iter().collect();
    let mut keys = a.keys_with(&b);
    keys.sort_unstable();
    assert_eq!(keys, vec!["alice", "bob", "carol"]);
}
