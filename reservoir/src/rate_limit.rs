// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

// only pub(crate) so that the macro calls can all use the same epoch static
#[doc(hidden)]
pub(crate) fn time_since_arbitrary_epoch() -> Duration {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    Instant::now().duration_since(*EPOCH.get_or_init(Instant::now))
}

/// `rate_limited!(duration, |suppressed| expr)` evaluates `expr` at most once every `duration` across
/// all threads, binding `suppressed` to the number of calls that were skipped since the last time
/// `expr` ran.
///
/// Used for harvest failure logs: a collector that stays unreachable fails every harvest of every
/// application, and we want one line per interval saying so, not one per application per cycle.
///
/// The rate limit applies to each unique code location of the macro call, not to all code sites
/// using it.
macro_rules! rate_limited {
    ($interval:expr, |$suppressed:ident| $call:expr) => {{
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_CALL: AtomicU64 = AtomicU64::new(u64::MIN);
        static SUPPRESSED: AtomicU64 = AtomicU64::new(0);
        let interval: std::time::Duration = $interval;
        assert!(
            interval >= std::time::Duration::from_secs(1),
            "only second-level granularity supported for rate limiting"
        );

        let time = $crate::rate_limit::time_since_arbitrary_epoch();
        let next = NEXT_CALL.load(Ordering::Relaxed);
        let won = next <= time.as_secs() && {
            let new_next = time
                .checked_add(interval)
                .unwrap_or(std::time::Duration::MAX)
                .as_secs();
            NEXT_CALL
                .compare_exchange(next, new_next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        };
        if won {
            let $suppressed = SUPPRESSED.swap(0, Ordering::Relaxed);
            $call;
        } else {
            SUPPRESSED.fetch_add(1, Ordering::Relaxed);
        }
    }};
}
pub(crate) use rate_limited;
