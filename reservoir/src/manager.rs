// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains [`ReservoirManager`], the per-application registry of live reservoirs and the harvest
//! entry point.

use std::{
    any::Any,
    borrow::Cow,
    fmt,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::HashMap;
use reservoir_core::{EventSender, HarvestResult, PriorityItem, SendError};

use crate::{
    config::{DEFAULT_MAX_SAMPLES_STORED, ReservoirConfig},
    metrics::{
        EVENTS_DISCARDED, EVENTS_SEEN, EVENTS_SENT, GlobalRecorderVersion, HARVEST_TRANSMIT_MS,
        HarvestDimensions, LocalRecorderVersion, MetricRecorder, SEND_FAILURES,
    },
    rate_limit::rate_limited,
    reservoir::{Drained, Reservoir},
};

/// Builder for [`ReservoirManager`]
pub struct ReservoirManagerBuilder<T> {
    event_type: Cow<'static, str>,
    max_samples_stored: usize,
    enabled: bool,
    metric_recorder: Option<Box<dyn MetricRecorder>>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: PriorityItem> ReservoirManagerBuilder<T> {
    /// Create a builder for a manager of `event_type` events (for example `"Span"` or
    /// `"TransactionError"`). The event type is only used to label logs, metrics and reservoirs.
    pub fn new(event_type: impl Into<Cow<'static, str>>) -> Self {
        let event_type = event_type.into();
        assert!(!event_type.is_empty(), "event_type must not be empty");
        Self {
            event_type,
            max_samples_stored: DEFAULT_MAX_SAMPLES_STORED,
            enabled: true,
            metric_recorder: None,
            _phantom: PhantomData,
        }
    }

    /// Sets the capacity of every reservoir the manager creates.
    ///
    /// Defaults to 2000. A capacity of 0 counts events without retaining any.
    pub fn max_samples_stored(mut self, max_samples_stored: usize) -> Self {
        self.max_samples_stored = max_samples_stored;
        self
    }

    /// Sets whether events are collected at all. Defaults to `true`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Take both the capacity and the enabled flag from `config`.
    pub fn config(self, config: &ReservoirConfig) -> Self {
        self.enabled(config.enabled)
            .max_samples_stored(config.max_samples_stored)
    }

    /// If set, every harvest reports its supportability metrics to the recorder. See
    /// [`crate::metrics`] for the list of metrics.
    pub fn metric_recorder(mut self, recorder: Option<Box<dyn MetricRecorder>>) -> Self {
        self.metric_recorder = recorder;
        self
    }

    /// Send metrics to the global recorder. Pass `dyn metrics::Recorder` as a type parameter to
    /// allow it to autodetect the right metrics.rs version.
    #[allow(private_bounds)]
    pub fn metrics_recorder_global<V: GlobalRecorderVersion + ?Sized>(self) -> Self {
        self.metric_recorder(Some(Box::new(V::recorder())))
    }

    /// Send metrics to a local metrics recorder. Pass `dyn metrics::Recorder` as the first type
    /// parameter to allow it to autodetect the right metrics.rs version.
    #[allow(private_bounds)]
    pub fn metrics_recorder_local<V: LocalRecorderVersion<R> + ?Sized, R>(
        self,
        recorder: R,
    ) -> Self {
        self.metric_recorder(Some(Box::new(V::recorder(recorder))))
    }

    /// Build the [`ReservoirManager`]
    pub fn build(self) -> ReservoirManager<T> {
        ReservoirManager {
            event_type: self.event_type,
            max_samples_stored: AtomicUsize::new(self.max_samples_stored),
            enabled: AtomicBool::new(self.enabled),
            apps: RwLock::new(HashMap::default()),
            recorder: self.metric_recorder,
        }
    }
}

/// Maps application names to their live [`Reservoir`] for one event type, and harvests them.
///
/// Producers call [`add`](ReservoirManager::add) from any thread. A harvest
/// ([`attempt_to_send_reservoir`](ReservoirManager::attempt_to_send_reservoir)) swaps the live
/// reservoir of an application for a fresh, empty one and sends the detached sample on the calling
/// thread. Producers are never blocked by the send, only by the swap itself, and only producers of
/// the application being swapped.
///
/// If the send fails, the unsent sample is merged back into the live reservoir, where it competes on
/// priority with whatever arrived during the send.
/// There is no retry queue: a collector that stays unreachable costs at most one reservoir of memory
/// per application.
///
/// The manager is an ordinary value: share it with `Arc` between producers and whatever drives the
/// harvest (for example a [`Harvester`](crate::Harvester)).
pub struct ReservoirManager<T> {
    event_type: Cow<'static, str>,
    max_samples_stored: AtomicUsize,
    enabled: AtomicBool,
    apps: RwLock<HashMap<String, Arc<AppSlot<T>>>>,
    recorder: Option<Box<dyn MetricRecorder>>,
}

// The live reservoir of one application.
//
// Producers add while holding the read lock and the harvest swaps under the write lock, so every
// add through the slot lands in exactly one of the old and new reservoir.
struct AppSlot<T> {
    live: RwLock<Arc<Reservoir<T>>>,
}

impl<T> AppSlot<T> {
    fn read(&self) -> RwLockReadGuard<'_, Arc<Reservoir<T>>> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> Arc<Reservoir<T>> {
        Arc::clone(&self.read())
    }

    // `None` if the slot was removed from the registry
    fn detach(&self, fresh: Reservoir<T>) -> Option<Arc<Reservoir<T>>> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if live.is_retired() {
            return None;
        }
        Some(std::mem::replace(&mut *live, Arc::new(fresh)))
    }
}

impl<T: PriorityItem> AppSlot<T> {
    fn retire(&self) {
        self.read().retire();
    }
}

impl<T: PriorityItem> ReservoirManager<T> {
    /// Create a [`ReservoirManagerBuilder`] for `event_type` events
    pub fn builder(event_type: impl Into<Cow<'static, str>>) -> ReservoirManagerBuilder<T> {
        ReservoirManagerBuilder::new(event_type)
    }

    /// Create a manager with the given capacity and no metric recorder
    pub fn new(event_type: impl Into<Cow<'static, str>>, max_samples_stored: usize) -> Self {
        Self::builder(event_type)
            .max_samples_stored(max_samples_stored)
            .build()
    }

    /// Return the live reservoir of `app_name`, creating it with the configured capacity if the
    /// application has none yet.
    ///
    /// Concurrent first calls for the same application all receive the same reservoir.
    ///
    /// The returned handle stops being the live reservoir at the next harvest. Items added through
    /// it while that harvest is sending are moved to the new live reservoir when the harvest ends.
    /// From then on the handle is [retired](Reservoir::is_retired) and rejects every item, as it
    /// is once the application is removed. Prefer [`add`](ReservoirManager::add), which always
    /// targets the live reservoir.
    pub fn get_or_create_reservoir(&self, app_name: &str) -> Arc<Reservoir<T>> {
        self.slot(app_name).live()
    }

    /// Offer `item` to the live reservoir of `app_name`, creating it if needed.
    ///
    /// Returns `true` if the item was retained. When the manager is
    /// [disabled](ReservoirManager::set_enabled) the item is rejected and not counted.
    pub fn add(&self, app_name: &str, item: T) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let slot = self.slot(app_name);
        let live = slot.read();
        live.add(item)
    }

    /// Harvest `app_name`: detach its live reservoir, send the sample with `sender`, and merge the
    /// sample back into the new live reservoir if the send fails.
    ///
    /// Send errors and panics are absorbed here: they are logged (rate limited), counted, and
    /// reported as a result with `sent == 0`. An empty sample is not sent at all. An application
    /// without a reservoir yields an all-zero result.
    ///
    /// Seen, sent and discarded counts are reported to the metric recorder only once the sample is
    /// delivered (or found empty), since a failed sample's tries are carried into the next harvest.
    ///
    /// While the manager is [disabled](ReservoirManager::set_enabled), this drops the reservoirs of
    /// every application instead of sending anything.
    ///
    /// `reservoir_size` is passed to the sender as the currently configured capacity, and
    /// `events_seen` as the number of tries of the detached reservoir.
    pub fn attempt_to_send_reservoir<S>(&self, app_name: &str, sender: &S) -> HarvestResult
    where
        S: EventSender<T> + ?Sized,
    {
        let Some(slot) = self.existing_slot(app_name) else {
            return HarvestResult::default();
        };
        if !self.is_enabled() {
            tracing::debug!(
                app = app_name,
                event_type = %self.event_type,
                "event type is disabled, dropping all reservoirs instead of sending them"
            );
            self.clear_reservoir();
            return HarvestResult::default();
        }

        let reservoir_size = self.max_samples_stored();
        let Some(detached) = slot.detach(Reservoir::new(
            app_name,
            self.event_type.clone(),
            reservoir_size,
        )) else {
            return HarvestResult::default();
        };
        let Drained { items, tries: seen } = detached.take();
        let dimensions = HarvestDimensions {
            app: app_name,
            event_type: &self.event_type,
        };

        let result = if items.is_empty() {
            let result = HarvestResult::new(seen, 0);
            self.report_delivered(dimensions, result);
            result
        } else {
            let start = Instant::now();
            let outcome = send_catching_panics(sender, app_name, reservoir_size, seen, &items);
            self.record_histogram(
                HARVEST_TRANSMIT_MS,
                dimensions,
                start.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
            );
            match outcome {
                Ok(()) => {
                    let sent = items.len();
                    if (sent as u64) < seen {
                        tracing::debug!(
                            app = app_name,
                            event_type = %self.event_type,
                            "dropped {} events out of {}",
                            seen - sent as u64,
                            seen,
                        );
                    }
                    let result = HarvestResult::new(seen, sent.try_into().unwrap_or(u32::MAX));
                    self.report_delivered(dimensions, result);
                    result
                }
                Err(err) => {
                    rate_limited!(Duration::from_secs(1), |suppressed| tracing::warn!(
                        app = app_name,
                        event_type = %self.event_type,
                        kind = err.kind(),
                        suppressed,
                        "unable to send events, unsent events will be included in the next harvest: {err}"
                    ));
                    self.increment_counter(SEND_FAILURES, dimensions, 1);
                    slot.live().merge(Drained { items, tries: seen });
                    HarvestResult::new(seen, 0)
                }
            }
        };

        // a producer holding a handle from before the swap may have added to the detached reservoir
        // since it was drained. Those events were never sent, so they move to the live one, and the
        // detached reservoir rejects anything later.
        slot.live().merge(detached.retire());
        result
    }

    /// Harvest every application that currently has a reservoir, for example before shutting down.
    pub fn harvest_pending<S>(&self, sender: &S) -> Vec<(String, HarvestResult)>
    where
        S: EventSender<T> + ?Sized,
    {
        self.app_names()
            .into_iter()
            .map(|app_name| {
                let result = self.attempt_to_send_reservoir(&app_name, sender);
                (app_name, result)
            })
            .collect()
    }

    /// Drop every reservoir's items and tries for `app_name`, keeping the application registered.
    pub fn clear_reservoir_for(&self, app_name: &str) {
        if let Some(slot) = self.existing_slot(app_name) {
            slot.read().clear();
        }
    }

    /// Drop the reservoirs of every application, for example on shutdown or a forced reset.
    ///
    /// Handles to the dropped reservoirs are [retired](Reservoir::is_retired). A harvest in flight
    /// keeps its detached sample; if its send fails, the sample is dropped.
    pub fn clear_reservoir(&self) {
        let slots: Vec<_> = self
            .apps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            slot.retire();
        }
    }

    /// Forget `app_name` and drop its reservoir. Returns `true` if the application was known.
    pub fn remove_app(&self, app_name: &str) -> bool {
        let removed = self
            .apps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app_name);
        match removed {
            Some(slot) => {
                slot.retire();
                true
            }
            None => false,
        }
    }

    /// Apply a (possibly changed) configuration. A new capacity takes effect at the next harvest of
    /// each application.
    pub fn apply_config(&self, config: &ReservoirConfig) {
        self.set_enabled(config.enabled);
        self.set_max_samples_stored(config.max_samples_stored);
    }

    fn slot(&self, app_name: &str) -> Arc<AppSlot<T>> {
        if let Some(slot) = self.existing_slot(app_name) {
            return slot;
        }
        let mut apps = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        // another thread may have created the slot between the two locks
        let slot = apps.entry(app_name.to_owned()).or_insert_with(|| {
            Arc::new(AppSlot {
                live: RwLock::new(Arc::new(Reservoir::new(
                    app_name,
                    self.event_type.clone(),
                    self.max_samples_stored(),
                ))),
            })
        });
        Arc::clone(slot)
    }
}

impl<T> ReservoirManager<T> {
    /// Set the capacity of reservoirs created from now on.
    ///
    /// Live reservoirs keep their capacity; each application picks the new one up at its next
    /// harvest.
    pub fn set_max_samples_stored(&self, max_samples_stored: usize) {
        self.max_samples_stored
            .store(max_samples_stored, Ordering::Relaxed);
    }

    /// The capacity of reservoirs created from now on.
    pub fn max_samples_stored(&self) -> usize {
        self.max_samples_stored.load(Ordering::Relaxed)
    }

    /// Enable or disable collection. While disabled, [`add`](ReservoirManager::add) rejects
    /// everything and each harvest drops the application's reservoir instead of sending it.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether collection is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// The event type this manager samples
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Names of all applications that currently have a reservoir
    pub fn app_names(&self) -> Vec<String> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn existing_slot(&self, app_name: &str) -> Option<Arc<AppSlot<T>>> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_name)
            .cloned()
    }

    fn report_delivered(&self, dimensions: HarvestDimensions<'_>, result: HarvestResult) {
        self.increment_counter(EVENTS_SEEN, dimensions, result.seen);
        self.increment_counter(EVENTS_SENT, dimensions, result.sent.into());
        self.increment_counter(EVENTS_DISCARDED, dimensions, result.discarded());
    }

    fn increment_counter(&self, metric: &'static str, dimensions: HarvestDimensions<'_>, value: u64) {
        if let Some(recorder) = &self.recorder {
            recorder.increment_counter(metric, dimensions, value);
        }
    }

    fn record_histogram(&self, metric: &'static str, dimensions: HarvestDimensions<'_>, value: u64) {
        if let Some(recorder) = &self.recorder {
            recorder.record_histogram(metric, dimensions, value);
        }
    }
}

impl<T> fmt::Debug for ReservoirManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservoirManager")
            .field("event_type", &self.event_type)
            .field("max_samples_stored", &self.max_samples_stored())
            .field("enabled", &self.is_enabled())
            .field("apps", &self.app_names())
            .finish_non_exhaustive()
    }
}

fn send_catching_panics<T, S>(
    sender: &S,
    app_name: &str,
    reservoir_size: usize,
    events_seen: u64,
    events: &[T],
) -> Result<(), SendError>
where
    S: EventSender<T> + ?Sized,
{
    // a broken sender for one application must not take the harvest of every other one down
    panic::catch_unwind(AssertUnwindSafe(|| {
        sender.send_events(app_name, reservoir_size, events_seen, events)
    }))
    .unwrap_or_else(|payload| Err(SendError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
