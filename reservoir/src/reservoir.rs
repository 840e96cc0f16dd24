// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains [`Reservoir`], a bounded priority sample of events for one application and event type.

use std::{
    borrow::Cow,
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use reservoir_core::PriorityItem;

/// A bounded, priority-ordered sample of the events offered to it.
///
/// `Reservoir` implements priority sampling: until it holds `capacity` items every item is
/// admitted; after that, an item is admitted only if it outranks the current minimum, which is then
/// evicted. Each [`add`](Reservoir::add) costs `O(log capacity)` regardless of how many events
/// arrive, so both memory and CPU stay bounded under bursty load.
///
/// Items are ranked by [`PriorityItem::priority`], then by [`PriorityItem::cmp_secondary`], and
/// finally by insertion order, with the earlier item ranking higher. An item that exactly ties the
/// current minimum is therefore rejected and the resident item is kept.
///
/// Every call to `add` is counted in [`number_of_tries`](Reservoir::number_of_tries), accepted or
/// not, so the sampling ratio can be recovered as `len() / number_of_tries()`.
///
/// All state (the items and the try counter) is guarded by a single mutex, so a `Reservoir` can
/// be shared between any number of producer threads.
///
/// # Example
/// ```
/// # use reservoir::Reservoir;
/// # use reservoir::test_util::TestEvent;
/// let reservoir = Reservoir::new("my-app", "Span", 2);
/// assert!(reservoir.add(TestEvent::new(1, 0.1)));
/// assert!(reservoir.add(TestEvent::new(2, 0.9)));
/// // full: 0.5 beats the minimum (0.1), which is evicted
/// assert!(reservoir.add(TestEvent::new(3, 0.5)));
/// // full: 0.05 loses against the minimum (0.5)
/// assert!(!reservoir.add(TestEvent::new(4, 0.05)));
///
/// let ids: Vec<u64> = reservoir.as_list().iter().map(|e| e.id).collect();
/// assert_eq!(ids, vec![2, 3]);
/// assert_eq!(reservoir.number_of_tries(), 4);
/// ```
pub struct Reservoir<T> {
    app_name: String,
    event_type: Cow<'static, str>,
    capacity: usize,
    state: Mutex<State<T>>,
}

// The contents of a reservoir that was drained, together with the tries it had counted.
pub(crate) struct Drained<T> {
    // highest priority first
    pub(crate) items: Vec<T>,
    pub(crate) tries: u64,
}

struct State<T> {
    // min-heap: the root is the lowest-ranked item, i.e. the next eviction candidate
    heap: BinaryHeap<Reverse<Ranked<T>>>,
    tries: u64,
    next_seq: u64,
    // set once the reservoir can no longer be reached by a harvest
    retired: bool,
}

struct Ranked<T> {
    item: T,
    seq: u64,
}

impl<T: PriorityItem> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .priority()
            .total_cmp(&other.item.priority())
            .then_with(|| self.item.cmp_secondary(&other.item))
            // earlier insertions rank higher
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T: PriorityItem> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: PriorityItem> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: PriorityItem> Eq for Ranked<T> {}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            tries: 0,
            next_seq: 0,
            retired: false,
        }
    }
}

impl<T: PriorityItem> State<T> {
    // retained items, highest rank first
    fn sorted(&self) -> Vec<&T> {
        let mut ranked: Vec<&Ranked<T>> = self.heap.iter().map(|Reverse(r)| r).collect();
        ranked.sort_unstable_by(|a, b| b.cmp(a));
        ranked.into_iter().map(|r| &r.item).collect()
    }

    fn admit(&mut self, item: T, capacity: usize) -> bool {
        if capacity == 0 {
            return false;
        }
        let candidate = Ranked {
            item,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if self.heap.len() < capacity {
            self.heap.push(Reverse(candidate));
            return true;
        }

        match self.heap.peek_mut() {
            Some(mut min) if candidate > min.0 => {
                // replacing through PeekMut re-sifts the heap when `min` is dropped
                *min = Reverse(candidate);
                true
            }
            _ => false,
        }
    }
}

impl<T> State<T> {
    fn take(&mut self) -> Drained<T>
    where
        T: PriorityItem,
    {
        let heap = std::mem::take(&mut self.heap);
        let tries = std::mem::take(&mut self.tries);
        Drained {
            // sorted ascending by Reverse, i.e. highest rank first
            items: heap
                .into_sorted_vec()
                .into_iter()
                .map(|Reverse(ranked)| ranked.item)
                .collect(),
            tries,
        }
    }
}

impl<T: PriorityItem> Reservoir<T> {
    /// Create a new, empty reservoir for `event_type` events of application `app_name`, holding at
    /// most `capacity` items.
    ///
    /// A capacity of 0 is allowed: such a reservoir counts every try and retains nothing.
    pub fn new(
        app_name: impl Into<String>,
        event_type: impl Into<Cow<'static, str>>,
        capacity: usize,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            event_type: event_type.into(),
            capacity,
            state: Mutex::new(State::default()),
        }
    }

    /// Offer `item` to the reservoir.
    ///
    /// Returns `true` if `item` is retained after the call, either because there was room or
    /// because it replaced the lowest-ranked item. Returns `false` if it was rejected. The try is
    /// counted either way.
    ///
    /// A [retired](Reservoir::is_retired) reservoir rejects every item without counting it.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.retired {
            return false;
        }
        state.tries += 1;
        state.admit(item, self.capacity)
    }

    /// Merge a copy of everything held by `source` into this reservoir. `source` is left
    /// unchanged, so the same source can be retried into several targets.
    ///
    /// Each item of `source` goes through the same admission as [`add`](Reservoir::add), highest
    /// priority first, so leftovers from a failed send can be evicted by higher-priority items
    /// already present here. `source`'s tries are added to this reservoir's tries, since they
    /// describe observations this sample now stands for.
    ///
    /// Retried items compete as new arrivals: on an exact tie with an item already in this
    /// reservoir, the resident wins.
    pub fn retry_all(&self, source: &Reservoir<T>)
    where
        T: Clone,
    {
        // snapshot first so the two locks are never held together
        let snapshot = {
            let state = source.lock();
            Drained {
                items: state.sorted().into_iter().cloned().collect(),
                tries: state.tries,
            }
        };
        self.merge(snapshot);
    }

    /// Return the lowest-ranked item (the next eviction candidate) without removing it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.lock()
            .heap
            .peek()
            .map(|Reverse(ranked)| ranked.item.clone())
    }

    /// Remove and return the lowest-ranked item.
    pub fn poll(&self) -> Option<T> {
        self.lock().heap.pop().map(|Reverse(ranked)| ranked.item)
    }

    /// Return a point-in-time copy of the retained items, highest priority first.
    pub fn as_list(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.lock().sorted().into_iter().cloned().collect()
    }

    /// The priority of the lowest-ranked retained item, or `0.0` if the reservoir is empty.
    ///
    /// Check [`is_empty`](Reservoir::is_empty) before relying on this value to make decisions.
    pub fn min_priority(&self) -> f32 {
        self.lock()
            .heap
            .peek()
            .map_or(0.0, |Reverse(ranked)| ranked.item.priority())
    }

    /// Returns `true` if an item with `priority` would currently be admitted by
    /// [`add`](Reservoir::add), ignoring secondary ordering.
    ///
    /// Producers can use this to avoid building an event that would be rejected anyway, in which
    /// case they should still call [`increment_number_of_tries`](Reservoir::increment_number_of_tries).
    /// The answer may be stale by the time the producer acts on it.
    pub fn would_admit(&self, priority: f32) -> bool {
        let state = self.lock();
        if self.capacity == 0 {
            return false;
        }
        match state.heap.peek() {
            Some(Reverse(min)) if state.heap.len() >= self.capacity => {
                priority.total_cmp(&min.item.priority()) == Ordering::Greater
            }
            _ => true,
        }
    }
}

impl<T> Reservoir<T> {
    /// Count an event that was offered to this reservoir but never built, because the producer
    /// already knew it would be rejected.
    pub fn increment_number_of_tries(&self) {
        let mut state = self.lock();
        if !state.retired {
            state.tries += 1;
        }
    }

    /// Number of items offered since creation or the last [`clear`](Reservoir::clear), including
    /// rejected ones and tries merged in by [`retry_all`](Reservoir::retry_all).
    pub fn number_of_tries(&self) -> u64 {
        self.lock().tries
    }

    /// Number of items currently retained.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Returns `true` if no items are retained.
    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Returns `true` if the reservoir holds `capacity` items, so any further admission evicts.
    pub fn is_full(&self) -> bool {
        self.lock().heap.len() >= self.capacity
    }

    /// Drop all retained items and reset the try counter.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.heap.clear();
        state.tries = 0;
    }

    /// Returns `true` once the reservoir was harvested for the last time or removed from its
    /// [`ReservoirManager`](crate::ReservoirManager). A retired reservoir rejects every
    /// [`add`](Reservoir::add); producers holding it should fetch the live reservoir again.
    pub fn is_retired(&self) -> bool {
        self.lock().retired
    }

    /// Maximum number of items this reservoir retains. Fixed at creation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The application this reservoir samples events for.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The event type this reservoir samples.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // the state is consistent between statements, so a panic in a caller's PriorityItem impl
        // must not take every producer down with it
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: PriorityItem> Reservoir<T> {
    pub(crate) fn take(&self) -> Drained<T> {
        self.lock().take()
    }

    /// Drain the reservoir and reject every later `add`, in one critical section.
    pub(crate) fn retire(&self) -> Drained<T> {
        let mut state = self.lock();
        state.retired = true;
        state.take()
    }

    pub(crate) fn merge(&self, drained: Drained<T>) {
        let mut state = self.lock();
        if state.retired {
            return;
        }
        state.tries = state.tries.saturating_add(drained.tries);
        for item in drained.items {
            state.admit(item, self.capacity);
        }
    }
}

impl<T> fmt::Debug for Reservoir<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Reservoir")
            .field("app_name", &self.app_name)
            .field("event_type", &self.event_type)
            .field("capacity", &self.capacity)
            .field("len", &state.heap.len())
            .field("number_of_tries", &state.tries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Barrier},
    };

    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use reservoir_core::test_util::TestEvent;
    use rstest::rstest;

    use super::*;

    fn priorities(reservoir: &Reservoir<TestEvent>) -> Vec<f32> {
        reservoir.as_list().iter().map(|e| e.priority).collect()
    }

    fn ids(reservoir: &Reservoir<TestEvent>) -> Vec<u64> {
        reservoir.as_list().iter().map(|e| e.id).collect()
    }

    fn filled(capacity: usize, priorities: &[f32]) -> Reservoir<TestEvent> {
        let reservoir = Reservoir::new("app", "Test", capacity);
        for (id, priority) in priorities.iter().enumerate() {
            reservoir.add(TestEvent::new(id as u64, *priority));
        }
        reservoir
    }

    #[test]
    fn higher_priority_evicts_minimum() {
        let reservoir = Reservoir::new("app", "Test", 2);
        assert!(reservoir.add(TestEvent::new(0, 0.1)));
        assert!(reservoir.add(TestEvent::new(1, 0.9)));
        assert!(reservoir.add(TestEvent::new(2, 0.5)));
        assert_eq!(priorities(&reservoir), vec![0.9, 0.5]);
        assert_eq!(reservoir.number_of_tries(), 3);
    }

    #[test]
    fn lower_priority_is_rejected_when_full() {
        let reservoir = Reservoir::new("app", "Test", 2);
        assert!(reservoir.add(TestEvent::new(0, 0.9)));
        assert!(reservoir.add(TestEvent::new(1, 0.5)));
        assert!(!reservoir.add(TestEvent::new(2, 0.1)));
        assert_eq!(priorities(&reservoir), vec![0.9, 0.5]);
        assert_eq!(reservoir.number_of_tries(), 3);
    }

    #[test]
    fn rejection_only_counts_the_try() {
        let reservoir = filled(3, &[0.4, 0.6, 0.8]);
        let before = reservoir.as_list();
        assert!(reservoir.min_priority() > 0.2);
        assert!(!reservoir.add(TestEvent::new(99, 0.2)));
        assert_eq!(reservoir.as_list(), before);
        assert_eq!(reservoir.number_of_tries(), 4);
    }

    #[test]
    fn equal_priority_keeps_the_resident() {
        let reservoir = filled(2, &[0.5, 0.7]);
        assert!(!reservoir.add(TestEvent::new(10, 0.5)));
        assert_eq!(ids(&reservoir), vec![1, 0]);
    }

    #[test]
    fn equal_priority_evicts_the_newest_resident_first() {
        let reservoir = filled(3, &[0.5, 0.5, 0.5]);
        assert!(reservoir.add(TestEvent::new(10, 0.6)));
        // 2 was the most recent of the tied residents
        assert_eq!(ids(&reservoir), vec![10, 0, 1]);
    }

    #[test]
    fn secondary_order_breaks_priority_ties() {
        let reservoir = Reservoir::new("app", "Span", 2);
        reservoir.add(TestEvent::new(0, 0.5).with_rank(1));
        reservoir.add(TestEvent::new(1, 0.5).with_rank(1));
        // same priority, but a better secondary rank than both residents
        assert!(reservoir.add(TestEvent::new(2, 0.5).with_rank(2)));
        // worse secondary rank than the minimum
        assert!(!reservoir.add(TestEvent::new(3, 0.5).with_rank(0)));
        assert_eq!(ids(&reservoir), vec![2, 0]);
    }

    #[rstest]
    #[case(0, 33)]
    #[case(1, 50)]
    #[case(10, 100)]
    fn size_never_exceeds_capacity(#[case] capacity: usize, #[case] count: u64) {
        let reservoir = Reservoir::new("app", "Test", capacity);
        for id in 0..count {
            reservoir.add(TestEvent::new(id, 1.0));
            assert!(reservoir.len() <= capacity);
        }
        assert_eq!(reservoir.len(), capacity.min(count as usize));
        assert_eq!(reservoir.number_of_tries(), count);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let reservoir = Reservoir::new("app", "Test", 0);
        assert!(reservoir.is_full());
        assert!(!reservoir.would_admit(f32::MAX));
        assert!(!reservoir.add(TestEvent::new(0, 2.0)));
        assert!(reservoir.is_empty());
        assert_eq!(reservoir.number_of_tries(), 1);
    }

    #[test]
    fn keeps_the_top_priorities_of_a_random_stream() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let reservoir = Reservoir::new("app", "Test", 50);
        let mut all = Vec::new();
        for id in 0..10_000 {
            let priority: f32 = rng.random();
            all.push(priority);
            reservoir.add(TestEvent::new(id, priority));
        }
        all.sort_by(|a, b| b.total_cmp(a));
        all.truncate(50);
        assert_eq!(priorities(&reservoir), all);
        assert_eq!(reservoir.number_of_tries(), 10_000);
    }

    #[test]
    fn retry_all_merges_by_priority_and_sums_tries() {
        let source = filled(5, &[1.2, 0.1, 1.3, 1.4, 1.5, 1.6, 0.7, 2.3]);
        assert_eq!(source.len(), 5);

        let target = Reservoir::new("app", "Test", 5);
        for (id, priority) in [(100, 1.1), (101, 0.9), (102, 1.7)] {
            target.add(TestEvent::new(id, priority));
        }

        target.retry_all(&source);

        assert_eq!(priorities(&target), vec![2.3, 1.7, 1.6, 1.5, 1.4]);
        assert_eq!(target.number_of_tries(), 8 + 3);
        assert_eq!(priorities(&source), vec![2.3, 1.6, 1.5, 1.4, 1.3]);
        assert_eq!(source.number_of_tries(), 8);
    }

    #[test]
    fn same_source_retried_into_two_targets_gives_the_same_result() {
        let source = filled(5, &[1.2, 0.1, 1.3, 1.4, 1.5, 1.6, 0.7, 2.3]);
        let targets: Vec<Reservoir<TestEvent>> = (0..2)
            .map(|_| {
                let target = Reservoir::new("app", "Test", 5);
                for (id, priority) in [(100, 1.1), (101, 0.9), (102, 1.7)] {
                    target.add(TestEvent::new(id, priority));
                }
                target.retry_all(&source);
                target
            })
            .collect();

        for target in &targets {
            assert_eq!(priorities(target), vec![2.3, 1.7, 1.6, 1.5, 1.4]);
            assert_eq!(target.number_of_tries(), 11);
        }
        assert_eq!(source.len(), 5);
    }

    #[test]
    fn retry_all_into_itself_keeps_contents() {
        let reservoir = filled(3, &[0.3, 0.2, 0.1]);
        reservoir.retry_all(&reservoir);
        // every copy ties with its resident and loses
        assert_eq!(priorities(&reservoir), vec![0.3, 0.2, 0.1]);
        assert_eq!(reservoir.number_of_tries(), 6);
    }

    #[test]
    fn retried_items_lose_ties_against_residents() {
        let source = filled(1, &[0.7]);
        let target = Reservoir::new("app", "Test", 1);
        target.add(TestEvent::new(50, 0.7));
        target.retry_all(&source);
        assert_eq!(ids(&target), vec![50]);
        assert_eq!(target.number_of_tries(), 2);
    }

    #[test]
    fn peek_and_poll_return_the_minimum() {
        let reservoir = filled(4, &[0.4, 0.1, 0.9, 0.3]);
        assert_eq!(reservoir.peek().map(|e| e.id), Some(1));
        assert_eq!(reservoir.min_priority(), 0.1);
        assert_eq!(reservoir.poll().map(|e| e.id), Some(1));
        assert_eq!(reservoir.poll().map(|e| e.id), Some(3));
        assert_eq!(reservoir.len(), 2);
        // polling does not undo tries
        assert_eq!(reservoir.number_of_tries(), 4);
    }

    #[test]
    fn empty_reservoir_reports_sentinel_minimum() {
        let reservoir: Reservoir<TestEvent> = Reservoir::new("app", "Test", 4);
        assert!(reservoir.is_empty());
        assert_eq!(reservoir.min_priority(), 0.0);
        assert!(reservoir.peek().is_none());
        assert!(reservoir.poll().is_none());
    }

    #[test]
    fn would_admit_matches_add() {
        let reservoir = filled(2, &[0.4, 0.6]);
        assert!(!reservoir.would_admit(0.4));
        assert!(!reservoir.would_admit(0.3));
        assert!(reservoir.would_admit(0.41));
        assert!(filled(3, &[0.4]).would_admit(0.0));
    }

    #[test]
    fn increment_number_of_tries_counts_skipped_events() {
        let reservoir = filled(1, &[0.9]);
        reservoir.increment_number_of_tries();
        reservoir.increment_number_of_tries();
        assert_eq!(reservoir.number_of_tries(), 3);
        assert_eq!(reservoir.len(), 1);
    }

    #[test]
    fn clear_resets_items_and_tries() {
        let reservoir = filled(2, &[0.4, 0.6, 0.8]);
        reservoir.clear();
        assert!(reservoir.is_empty());
        assert_eq!(reservoir.number_of_tries(), 0);
        assert!(reservoir.add(TestEvent::new(5, 0.01)));
    }

    #[test]
    fn take_drains_highest_first() {
        let reservoir = filled(3, &[0.2, 0.8, 0.5, 0.1]);
        let drained = reservoir.take();
        let taken: Vec<f32> = drained.items.iter().map(|e| e.priority).collect();
        assert_eq!(taken, vec![0.8, 0.5, 0.2]);
        assert_eq!(drained.tries, 4);
        assert!(reservoir.is_empty());
        assert_eq!(reservoir.number_of_tries(), 0);
    }

    #[test]
    fn concurrent_adds_keep_invariants() {
        const THREADS: u64 = 16;
        const PER_THREAD: u64 = 2_000;
        let reservoir = Arc::new(Reservoir::new("app", "Test", 100));
        let barrier = Arc::new(Barrier::new(THREADS as usize));

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let reservoir = Arc::clone(&reservoir);
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    let mut rng = ChaCha8Rng::seed_from_u64(t);
                    barrier.wait();
                    for i in 0..PER_THREAD {
                        reservoir.add(TestEvent::new(t * PER_THREAD + i, rng.random()));
                        assert!(reservoir.len() <= 100);
                    }
                });
            }
        });

        assert_eq!(reservoir.number_of_tries(), THREADS * PER_THREAD);
        assert_eq!(reservoir.len(), 100);

        // the retained sample is exactly the top 100 of everything that was offered
        let mut expected: Vec<f32> = (0..THREADS)
            .flat_map(|t| {
                let mut rng = ChaCha8Rng::seed_from_u64(t);
                (0..PER_THREAD)
                    .map(|_| rng.random::<f32>())
                    .collect::<Vec<_>>()
            })
            .collect();
        expected.sort_by(|a, b| b.total_cmp(a));
        expected.truncate(100);
        let retained: HashSet<u32> = priorities(&reservoir).iter().map(|p| p.to_bits()).collect();
        assert!(expected.iter().all(|p| retained.contains(&p.to_bits())));
    }

    #[test]
    fn debug_shows_identity_and_counts() {
        let reservoir = filled(2, &[0.1, 0.2, 0.3]);
        let debug = format!("{reservoir:?}");
        assert!(debug.contains("app_name: \"app\""));
        assert!(debug.contains("len: 2"));
        assert!(debug.contains("number_of_tries: 3"));
    }
}
