// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::sync::{Parker, Unparker};
use reservoir_core::{EventSender, PriorityItem};

use crate::{config::DEFAULT_HARVEST_INTERVAL, manager::ReservoirManager};

/// Builder for a background [`Harvester`]
#[derive(Clone, Debug)]
pub struct HarvesterBuilder {
    interval: Duration,
    thread_name: String,
}

impl Default for HarvesterBuilder {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HARVEST_INTERVAL,
            thread_name: "reservoir-harvester".to_owned(),
        }
    }
}

impl HarvesterBuilder {
    /// Create a new builder with the default interval of 60 seconds
    pub fn new() -> Self {
        Self::default()
    }

    /// Time between two harvest passes. Must be non-zero.
    pub fn interval(mut self, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "harvest interval must be non-zero");
        self.interval = interval;
        self
    }

    /// Name of the background thread. Defaults to `reservoir-harvester`.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Spawn a thread that harvests every application of `manager` through `sender` once per
    /// interval.
    ///
    /// The thread keeps a reference to `manager`. It stops once it holds the last one, or when the
    /// returned [`HarvesterJoinHandle`] is dropped. Either way it runs one final pass before
    /// exiting, so events collected since the last pass are not lost.
    ///
    /// # Panics
    ///
    /// Panics if the thread can't be spawned.
    pub fn build<T, S>(
        self,
        manager: Arc<ReservoirManager<T>>,
        sender: S,
    ) -> (Harvester, HarvesterJoinHandle)
    where
        T: PriorityItem + Send + 'static,
        S: EventSender<T> + Send + 'static,
    {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let (requests, request_receiver) = mpsc::channel();
        let shutdown_signal = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            manager,
            sender,
            interval: self.interval,
            shutdown_signal: Arc::clone(&shutdown_signal),
            parker,
        };
        let handle = thread::Builder::new()
            .name(self.thread_name)
            .spawn(move || worker.run(request_receiver))
            .expect("failed to spawn the harvester thread");

        (
            Harvester(Arc::new(Shared {
                requests,
                unparker: unparker.clone(),
            })),
            HarvesterJoinHandle {
                handle: Some(handle),
                shutdown_signal,
                unparker,
            },
        )
    }
}

/// A handle to a background harvest thread created by [`HarvesterBuilder::build`].
///
/// Cloning is cheap and refers to the same thread.
#[derive(Clone)]
pub struct Harvester(Arc<Shared>);

impl Harvester {
    /// Spawn a harvester with the [`HarvesterBuilder`] defaults.
    pub fn new<T, S>(manager: Arc<ReservoirManager<T>>, sender: S) -> (Self, HarvesterJoinHandle)
    where
        T: PriorityItem + Send + 'static,
        S: EventSender<T> + Send + 'static,
    {
        HarvesterBuilder::new().build(manager, sender)
    }

    /// Ask the thread for a harvest pass now, instead of waiting for the interval.
    ///
    /// The returned future completes once a pass that started after this call has finished, or
    /// once the thread has exited. In synchronous code, use `futures::executor::block_on` to wait
    /// for it.
    pub fn harvest_now(&self) -> HarvestWait {
        let (channel, receiver) = tokio::sync::oneshot::channel();
        // the send only fails once the thread is gone, and then the dropped signal completes the wait
        self.0.requests.send(HarvestSignal { channel }).ok();
        self.0.unparker.unpark();
        HarvestWait(Box::pin(async move {
            let _ = receiver.await;
        }))
    }
}

impl fmt::Debug for Harvester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Harvester").finish()
    }
}

/// Future returned by [`Harvester::harvest_now`]
#[must_use = "future does nothing unless polled"]
pub struct HarvestWait(Pin<Box<dyn Future<Output = ()> + Send + 'static>>);

impl Future for HarvestWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

impl fmt::Debug for HarvestWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HarvestWait").finish()
    }
}

/// Guard handle that, when dropped, stops the harvest thread after a final pass and blocks until it
/// has exited.
///
/// Keep it alive for as long as the service runs, and drop it on shutdown so the last reservoirs
/// are sent.
pub struct HarvesterJoinHandle {
    handle: Option<thread::JoinHandle<()>>,
    shutdown_signal: Arc<AtomicBool>,
    unparker: Unparker,
}

impl HarvesterJoinHandle {
    /// Drop the handle but let the thread keep running until no other reference to the manager
    /// exists.
    pub fn forget(mut self) {
        self.handle = None;
    }

    /// Alias for `drop(handle)`. Runs a final harvest pass and stops the thread.
    pub fn shut_down(self) {}
}

impl Drop for HarvesterJoinHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shutdown_signal.store(true, Ordering::Relaxed);
            self.unparker.unpark();
            tracing::info!("awaiting reservoir harvester shutdown");
            if handle.join().is_err() {
                tracing::error!("reservoir harvester thread panicked");
            } else {
                tracing::info!("reservoir harvester shut down");
            }
        }
    }
}

impl fmt::Debug for HarvesterJoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarvesterJoinHandle")
            .field("attached", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

struct Shared {
    requests: mpsc::Sender<HarvestSignal>,
    // wakes the thread up for a requested pass or shutdown
    unparker: Unparker,
}

struct HarvestSignal {
    // dropped once the pass is done
    #[allow(unused)]
    channel: tokio::sync::oneshot::Sender<()>,
}

struct Worker<T, S> {
    manager: Arc<ReservoirManager<T>>,
    sender: S,
    interval: Duration,
    shutdown_signal: Arc<AtomicBool>,
    parker: Parker,
}

impl<T: PriorityItem, S: EventSender<T>> Worker<T, S> {
    fn run(self, requests: mpsc::Receiver<HarvestSignal>) {
        let span = tracing::span!(
            tracing::Level::TRACE,
            "reservoir harvester",
            event_type = self.manager.event_type()
        );
        let _enter = span.enter();

        loop {
            let next_pass = Instant::now() + self.interval;
            let mut waiting: Vec<HarvestSignal> = Vec::new();
            loop {
                waiting.extend(requests.try_iter());
                if !waiting.is_empty() || self.shutdown_signal.load(Ordering::Relaxed) {
                    break;
                }
                self.parker.park_deadline(next_pass);
                if Instant::now() >= next_pass {
                    break;
                }
            }

            self.harvest();
            drop(waiting);

            if self.shutdown_signal.load(Ordering::Relaxed) {
                tracing::info!("caught shutdown signal, shutting down reservoir harvester");
                return;
            }
            if Arc::strong_count(&self.manager) == 1 {
                tracing::info!("no producers left, shutting down reservoir harvester");
                return;
            }
        }
        // waiters still queued in `requests` are released when it is dropped
    }

    fn harvest(&self) {
        let start = Instant::now();
        let results = self.manager.harvest_pending(&self.sender);
        let (seen, sent) = results
            .iter()
            .fold((0_u64, 0_u64), |(seen, sent), (_, result)| {
                (seen + result.seen, sent + u64::from(result.sent))
            });
        tracing::debug!(
            apps = results.len(),
            seen,
            sent,
            elapsed = ?start.elapsed(),
            "harvest pass complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use futures::executor::block_on;
    use reservoir_core::test_util::{TestEvent, TestSender};

    use super::*;

    fn manager(capacity: usize) -> Arc<ReservoirManager<TestEvent>> {
        Arc::new(ReservoirManager::new("Test", capacity))
    }

    fn idle_builder() -> HarvesterBuilder {
        // long enough that only requested passes run during a test
        HarvesterBuilder::new().interval(Duration::from_secs(3600))
    }

    #[test]
    fn harvest_now_sends_pending_events() {
        let manager = manager(10);
        let sender: TestSender = TestSender::new();
        let (harvester, _handle) = idle_builder().build(Arc::clone(&manager), sender.clone());

        manager.add("a", TestEvent::new(1, 0.5));
        manager.add("b", TestEvent::new(2, 0.7));
        block_on(harvester.harvest_now());

        let mut delivered = sender.delivered_ids();
        delivered.sort_unstable();
        assert_eq!(delivered, vec![1, 2]);
    }

    #[test]
    fn harvests_periodically() {
        let manager = manager(10);
        let sender: TestSender = TestSender::new();
        let (_harvester, _handle) = HarvesterBuilder::new()
            .interval(Duration::from_millis(5))
            .build(Arc::clone(&manager), sender.clone());

        manager.add("a", TestEvent::new(1, 0.5));
        for _ in 0..2_000 {
            if !sender.delivered_ids().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sender.delivered_ids(), vec![1]);
    }

    #[test]
    fn shut_down_runs_a_final_pass() {
        let manager = manager(10);
        let sender: TestSender = TestSender::new();
        let (_harvester, handle) = idle_builder().build(Arc::clone(&manager), sender.clone());

        manager.add("a", TestEvent::new(1, 0.5));
        handle.shut_down();
        assert_eq!(sender.delivered_ids(), vec![1]);
    }

    #[test]
    fn harvest_now_completes_after_shutdown() {
        let manager = manager(10);
        let sender: TestSender = TestSender::new();
        let (harvester, handle) = idle_builder().build(manager, sender);
        drop(handle);
        block_on(harvester.harvest_now());
    }

    #[test]
    fn failed_passes_are_retried_by_the_next_pass() {
        let manager = manager(10);
        let sender: TestSender = TestSender::new();
        sender.set_fail_always(true);
        let (harvester, _handle) = idle_builder().build(Arc::clone(&manager), sender.clone());

        manager.add("a", TestEvent::new(1, 0.5));
        block_on(harvester.harvest_now());
        assert!(sender.delivered_ids().is_empty());
        assert_eq!(manager.get_or_create_reservoir("a").len(), 1);

        sender.set_fail_always(false);
        block_on(harvester.harvest_now());
        assert_eq!(sender.delivered_ids(), vec![1]);
    }

    #[test]
    fn forgotten_harvester_stops_when_the_manager_is_dropped() {
        let manager = manager(10);
        let weak = Arc::downgrade(&manager);
        let sender: TestSender = TestSender::new();
        let (_harvester, handle) = HarvesterBuilder::new()
            .interval(Duration::from_millis(5))
            .thread_name("forgotten-harvester")
            .build(Arc::clone(&manager), sender.clone());
        handle.forget();

        manager.add("a", TestEvent::new(1, 0.5));
        drop(manager);
        for _ in 0..2_000 {
            if weak.upgrade().is_none() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(weak.upgrade().is_none());
        assert_eq!(sender.delivered_ids(), vec![1]);
    }

    #[test]
    #[should_panic(expected = "harvest interval must be non-zero")]
    fn zero_interval_is_rejected() {
        let _ = HarvesterBuilder::new().interval(Duration::ZERO);
    }
}
