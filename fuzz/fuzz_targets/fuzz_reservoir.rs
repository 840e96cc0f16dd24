// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![no_main]

use std::cmp::Ordering;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use reservoir::{PriorityItem, Reservoir};

#[derive(Clone, Debug)]
struct Event {
    id: u64,
    priority: f32,
    rank: u8,
}

impl PriorityItem for Event {
    fn priority(&self) -> f32 {
        self.priority
    }

    fn cmp_secondary(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

#[derive(Arbitrary, Debug)]
enum Op {
    Add { priority: f32, rank: u8 },
    Poll,
    Clear,
    Retry(Vec<(f32, u8)>),
    IncrementTries,
}

#[derive(Arbitrary, Debug)]
struct Input {
    capacity: u8,
    ops: Vec<Op>,
}

// straightforward O(n) model of the reservoir
#[derive(Default)]
struct Model {
    items: Vec<(Event, u64)>,
    tries: u64,
    next_seq: u64,
}

fn cmp_rank(a: &(Event, u64), b: &(Event, u64)) -> Ordering {
    a.0.priority
        .total_cmp(&b.0.priority)
        .then(a.0.rank.cmp(&b.0.rank))
        .then(b.1.cmp(&a.1))
}

impl Model {
    fn admit(&mut self, event: Event, capacity: usize) -> bool {
        if capacity == 0 {
            return false;
        }
        let candidate = (event, self.next_seq);
        self.next_seq += 1;
        if self.items.len() < capacity {
            self.items.push(candidate);
            return true;
        }
        let min = self.min_index().expect("full and non-empty");
        if cmp_rank(&candidate, &self.items[min]) == Ordering::Greater {
            self.items[min] = candidate;
            true
        } else {
            false
        }
    }

    fn min_index(&self) -> Option<usize> {
        (0..self.items.len()).min_by(|&a, &b| cmp_rank(&self.items[a], &self.items[b]))
    }

    fn sorted_ids(&self) -> Vec<u64> {
        let mut items = self.items.clone();
        items.sort_by(|a, b| cmp_rank(b, a));
        items.into_iter().map(|(e, _)| e.id).collect()
    }
}

fuzz_target!(|input: Input| {
    let capacity = usize::from(input.capacity % 32);
    let reservoir = Reservoir::new("fuzz", "Fuzz", capacity);
    let mut model = Model::default();
    let mut next_id = 0_u64;
    let mut event = |priority: f32, rank: u8| {
        next_id += 1;
        Event {
            id: next_id,
            priority,
            rank,
        }
    };

    for op in input.ops {
        match op {
            Op::Add { priority, rank } => {
                let e = event(priority, rank);
                model.tries += 1;
                assert_eq!(reservoir.add(e.clone()), model.admit(e, capacity));
            }
            Op::Poll => {
                let expected = model.min_index().map(|i| model.items.swap_remove(i).0.id);
                assert_eq!(reservoir.poll().map(|e| e.id), expected);
            }
            Op::Clear => {
                reservoir.clear();
                model.items.clear();
                model.tries = 0;
            }
            Op::Retry(source_events) => {
                let source = Reservoir::new("fuzz", "Fuzz", source_events.len());
                let mut source_model = Model::default();
                for (priority, rank) in source_events {
                    let e = event(priority, rank);
                    source.add(e.clone());
                    source_model.tries += 1;
                    source_model.admit(e, usize::MAX);
                }
                let mut snapshot = source_model.items.clone();
                snapshot.sort_by(|a, b| cmp_rank(b, a));
                model.tries += source_model.tries;
                for (e, _) in snapshot {
                    model.admit(e, capacity);
                }

                reservoir.retry_all(&source);
                // the source is only read
                let source_ids: Vec<u64> = source.as_list().into_iter().map(|e| e.id).collect();
                assert_eq!(source_ids, source_model.sorted_ids());
                assert_eq!(source.number_of_tries(), source_model.tries);
            }
            Op::IncrementTries => {
                reservoir.increment_number_of_tries();
                model.tries += 1;
            }
        }

        assert!(reservoir.len() <= capacity);
        assert_eq!(reservoir.number_of_tries(), model.tries);
        let ids: Vec<u64> = reservoir.as_list().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, model.sorted_ids());
    }
});
