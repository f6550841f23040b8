// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::sync::Arc;

#[test]
fn manual_clock_set_and_advance() {
    let clock = ManualClock::new(1000);
    assert_eq!(clock.now_ms(), 1000);

    clock.advance(250);
    assert_eq!(clock.now_ms(), 1250);

    clock.set(10);
    assert_eq!(clock.now_ms(), 10);
}

#[test]
fn shared_clock_sees_updates() {
    let clock = Arc::new(ManualClock::new(5));
    let shared: Arc<dyn ClockSource> = clock.clone();

    clock.advance(5);
    assert_eq!(shared.now_ms(), 10);
}

#[test]
fn system_clock_is_after_2020() {
    // 2020-01-01T00:00:00Z
    assert!(SystemClock.now_ms() > 1_577_836_800_000);
}
