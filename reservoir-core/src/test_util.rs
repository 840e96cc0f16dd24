// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    cmp::Ordering,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{EventSender, PriorityItem, SendError};

/// A minimal event with an identity and a priority.
///
/// The `rank` field is used as the secondary ordering, so tests can exercise tie-breaking between
/// events of equal priority.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TestEvent {
    /// Identity of the event, used to check that nothing is sent twice.
    pub id: u64,
    /// Retention priority.
    pub priority: f32,
    /// Secondary ordering among events of equal priority. Higher is retained first.
    pub rank: u8,
}

impl TestEvent {
    /// Create a new [`TestEvent`] with a neutral secondary rank
    pub const fn new(id: u64, priority: f32) -> Self {
        Self {
            id,
            priority,
            rank: 0,
        }
    }

    /// Set the secondary rank
    pub const fn with_rank(mut self, rank: u8) -> Self {
        self.rank = rank;
        self
    }
}

impl PriorityItem for TestEvent {
    fn priority(&self) -> f32 {
        self.priority
    }

    fn cmp_secondary(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

/// One call to [`TestSender::send_events`]
#[derive(Clone, Debug)]
pub struct SentBatch<T> {
    /// Application the batch was sent for
    pub app_name: String,
    /// Capacity of the reservoir the batch came from
    pub reservoir_size: usize,
    /// Number of events the reservoir observed
    pub events_seen: u64,
    /// The events, in the order they were handed to the sender
    pub events: Vec<T>,
    /// Whether the sender reported success for this batch
    pub delivered: bool,
}

/// Shared state of a [`TestSender`]
pub struct TestSenderState<T> {
    /// Every batch the sender was asked to send, including failed ones
    pub batches: Vec<SentBatch<T>>,
    /// Error to return from the next send, consumed by that send
    pub error: Option<SendError>,
    /// Fail every send with an IO error
    pub fail_always: bool,
    /// Panic on the next send, consumed by that send
    pub panic_next: bool,
    hook: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl<T> Default for TestSenderState<T> {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
            error: None,
            fail_always: false,
            panic_next: false,
            hook: None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for TestSenderState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSenderState")
            .field("batches", &self.batches)
            .field("error", &self.error)
            .field("fail_always", &self.fail_always)
            .field("panic_next", &self.panic_next)
            .finish_non_exhaustive()
    }
}

/// An [`EventSender`] that records batches in memory and can be told to fail.
///
/// Cloning gives another handle to the same recorded state.
///
/// ```
/// # use reservoir_core::{EventSender, SendError};
/// # use reservoir_core::test_util::{TestEvent, TestSender};
/// let sender: TestSender = TestSender::default();
/// sender.fail_next(SendError::collector(503, "unavailable"));
/// assert!(sender.send_events("app", 10, 1, &[TestEvent::new(1, 0.5)]).is_err());
/// assert!(sender.send_events("app", 10, 1, &[TestEvent::new(1, 0.5)]).is_ok());
/// assert_eq!(sender.delivered_ids(), vec![1]);
/// ```
pub struct TestSender<T = TestEvent>(Arc<Mutex<TestSenderState<T>>>);

impl<T> Default for TestSender<T> {
    fn default() -> Self {
        Self(Default::default())
    }
}

impl<T> Clone for TestSender<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> TestSender<T> {
    /// Create a new, succeeding [`TestSender`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock and return the recorded state
    pub fn state(&self) -> MutexGuard<'_, TestSenderState<T>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next send fail with `error`
    pub fn fail_next(&self, error: SendError) {
        self.state().error = Some(error);
    }

    /// Make every send fail (or succeed again)
    pub fn set_fail_always(&self, fail: bool) {
        self.state().fail_always = fail;
    }

    /// Make the next send panic
    pub fn panic_next(&self) {
        self.state().panic_next = true;
    }

    /// Run `hook` inside every send, after the batch is recorded and before the result is
    /// decided. The hook receives the application name.
    ///
    /// This is how tests make producers run "concurrently" with a send in a deterministic way.
    pub fn set_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.state().hook = Some(Box::new(hook));
    }

    /// Total number of send attempts
    pub fn attempts(&self) -> usize {
        self.state().batches.len()
    }

    /// Take the recorded batches out of the sender
    pub fn drain(&self) -> Vec<SentBatch<T>> {
        std::mem::take(&mut self.state().batches)
    }
}

impl TestSender<TestEvent> {
    /// Ids of every event in a batch that was delivered successfully, in send order
    pub fn delivered_ids(&self) -> Vec<u64> {
        self.state()
            .batches
            .iter()
            .filter(|batch| batch.delivered)
            .flat_map(|batch| batch.events.iter().map(|event| event.id))
            .collect()
    }
}

impl<T: Clone> EventSender<T> for TestSender<T> {
    fn send_events(
        &self,
        app_name: &str,
        reservoir_size: usize,
        events_seen: u64,
        events: &[T],
    ) -> Result<(), SendError> {
        // the hook may call back into code that uses this sender, so don't hold the lock across it
        let hook = self.state().hook.take();
        if let Some(hook) = &hook {
            hook(app_name);
        }

        let mut state = self.state();
        if hook.is_some() && state.hook.is_none() {
            state.hook = hook;
        }
        if std::mem::take(&mut state.panic_next) {
            state.batches.push(SentBatch {
                app_name: app_name.to_owned(),
                reservoir_size,
                events_seen,
                events: events.to_vec(),
                delivered: false,
            });
            drop(state);
            panic!("test sender asked to panic");
        }
        let result = match state.error.take() {
            Some(err) => Err(err),
            None if state.fail_always => Err(SendError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "test sender is failing",
            ))),
            None => Ok(()),
        };
        state.batches.push(SentBatch {
            app_name: app_name.to_owned(),
            reservoir_size,
            events_seen,
            events: events.to_vec(),
            delivered: result.is_ok(),
        });
        result
    }
}
