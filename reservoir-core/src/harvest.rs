// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains [`HarvestResult`], the outcome of one harvest attempt.

/// The outcome of a single harvest attempt for one application.
///
/// This is purely informational (for logging and supportability metrics). A failed send is
/// reported as `sent == 0`; the unsent events have already been merged back into the live
/// reservoir by the time the result is returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HarvestResult {
    /// Number of `add` calls the harvested reservoir observed, including rejected ones and any
    /// tries carried over from a failed previous harvest.
    pub seen: u64,
    /// Number of events actually handed to a sender that reported success.
    pub sent: u32,
}

impl HarvestResult {
    /// Create a new [`HarvestResult`]
    pub const fn new(seen: u64, sent: u32) -> Self {
        Self { seen, sent }
    }

    /// Number of observed events that were not delivered in this harvest, either because they lost
    /// the sampling competition or because the send failed.
    pub const fn discarded(&self) -> u64 {
        self.seen.saturating_sub(self.sent as u64)
    }

    /// True if at least one event was delivered.
    pub const fn delivered(&self) -> bool {
        self.sent > 0
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    #[test]
    fn discarded_never_underflows() {
        check!(HarvestResult::new(10, 4).discarded() == 6);
        check!(HarvestResult::new(0, 0).discarded() == 0);
        // merges can make `sent` look larger than a stale `seen`, never wrap around
        check!(HarvestResult::new(1, 3).discarded() == 0);
    }

    #[test]
    fn delivered_only_when_something_was_sent() {
        check!(!HarvestResult::default().delivered());
        check!(HarvestResult::new(5, 1).delivered());
    }
}
