// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Producer-side priority assignment.
//!
//! Reservoirs never invent priorities; producers assign one when an event (or the transaction that
//! encloses it) starts. [`PrioritySampler`] draws uniformly random priorities in `[0, 1)` and adds
//! [`SAMPLED_PRIORITY_BOOST`] for work the producer decided to sample, so sampled work outranks
//! unsampled work in every reservoir while ties within each class are broken at random.
//!
//! All events of one transaction should share the transaction's priority, so that reservoirs of
//! different event types keep or drop them together.

use std::marker::PhantomData;

use rand::{Rng, RngCore, rngs::ThreadRng};

/// Added to the random priority of sampled work.
pub const SAMPLED_PRIORITY_BOOST: f32 = 1.0;

// priorities travel in trace headers as text, six decimal digits survive every round trip
const PRIORITY_SCALE: f64 = 1_000_000.0;

/// Utility wrapper to impl [`RngCore`] from a stateless random number generator that impls
/// [`Default`], like [`ThreadRng`].
#[derive(Default)]
// PhantomData of fn() -> R instead of R avoids requiring Send bounds on R. It reflects the actual
// usage R::default().next(), where we always create and drop a temporary R.
pub struct DefaultRng<R>(PhantomData<fn() -> R>);

impl<R: RngCore + Default> RngCore for DefaultRng<R> {
    fn next_u32(&mut self) -> u32 {
        R::default().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        R::default().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        R::default().fill_bytes(dest)
    }
}

/// Draws event priorities.
///
/// ```
/// # use reservoir::priority::{PrioritySampler, is_sampled_priority};
/// let mut sampler = PrioritySampler::new();
/// let unsampled = sampler.next_priority_for(false);
/// let sampled = sampler.next_priority_for(true);
/// assert!((0.0..1.0).contains(&unsampled));
/// assert!(is_sampled_priority(sampled));
/// assert!(sampled > unsampled);
/// ```
pub struct PrioritySampler<R = DefaultRng<ThreadRng>> {
    rng: R,
}

impl PrioritySampler {
    /// Create a new [`PrioritySampler`] using the thread-local RNG
    pub fn new() -> Self {
        Self::with_rng(Default::default())
    }
}

impl Default for PrioritySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> PrioritySampler<R> {
    /// Like [`PrioritySampler::new`], but also specify the random number generator. Useful with a
    /// seeded RNG for deterministic tests.
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// A uniformly random priority in `[0, 1)`, truncated to six decimal digits.
    pub fn next_priority(&mut self) -> f32 {
        truncate_priority(self.rng.random::<f32>())
    }

    /// A random priority, boosted by [`SAMPLED_PRIORITY_BOOST`] if `sampled`.
    pub fn next_priority_for(&mut self, sampled: bool) -> f32 {
        let priority = self.next_priority();
        if sampled {
            priority + SAMPLED_PRIORITY_BOOST
        } else {
            priority
        }
    }
}

/// Truncate `priority` to six decimal digits.
pub fn truncate_priority(priority: f32) -> f32 {
    ((f64::from(priority) * PRIORITY_SCALE).trunc() / PRIORITY_SCALE) as f32
}

/// Returns `true` if `priority` was assigned to sampled work.
pub fn is_sampled_priority(priority: f32) -> bool {
    priority >= SAMPLED_PRIORITY_BOOST
}
