//! Listener registry - reference-counted upstream subscription with fan-out
//!
//! The first `subscribe` opens the upstream feed; the last `unsubscribe`
//! closes it and discards the reconciled store. All subscribers share one
//! upstream subscription.
//!
//! Feed events flow through a bounded channel into a pump task. Each event
//! is reconciled and fanned out under a delivery lock, so every subscriber
//! sees one snapshot completely before the next one is processed.
//!
//! Lock order: `state` before `reconciler`. The event path never holds both.

use crate::domain::types::{epoch_ms, FeedError, FeedEvent, FeedSnapshot, JunctionRecord};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::reconciler::Reconciler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Observer of reconciled traffic state
pub trait Subscriber: Send + Sync {
    /// Full post-reconciliation set for the junctions in one feed push
    fn on_update(&self, records: &[JunctionRecord]);

    /// Called once per junction flagged with an emergency vehicle
    fn on_emergency(&self, record: &JunctionRecord);

    /// Upstream subscription failure; the registry stays active
    fn on_error(&self, _error: &FeedError) {}
}

/// A live upstream subscription returned by [`TrafficFeed::open`]
pub trait FeedConnection: Send {
    /// Tear down this exact subscription
    fn close(self: Box<Self>);
}

/// Push-based source of junction snapshots
pub trait TrafficFeed: Send + Sync {
    /// Start delivering events for `topic` into `events`
    ///
    /// Must not block; delivery happens on the feed's own schedule.
    fn open(
        &self,
        topic: &str,
        events: mpsc::Sender<FeedEvent>,
    ) -> anyhow::Result<Box<dyn FeedConnection>>;
}

/// Token returned by `subscribe`, required to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub topic: String,
    pub reject_stale: bool,
    pub evict_after_ms: u64,
    pub channel_capacity: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            topic: crate::infra::config::DEFAULT_FEED_TOPIC.to_string(),
            reject_stale: true,
            evict_after_ms: 0,
            channel_capacity: 64,
        }
    }
}

impl From<&Config> for RegistryOptions {
    fn from(config: &Config) -> Self {
        Self {
            topic: config.feed_topic().to_string(),
            reject_stale: config.store_reject_stale(),
            evict_after_ms: config.store_evict_after_secs() * 1000,
            channel_capacity: config.feed_channel_capacity(),
        }
    }
}

#[derive(Clone)]
struct Entry {
    handle: SubscriptionHandle,
    subscriber: Arc<dyn Subscriber>,
    /// Cleared on unsubscribe so in-flight fan-outs skip this entry
    live: Arc<AtomicBool>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

struct ActiveFeed {
    connection: Option<Box<dyn FeedConnection>>,
    pump: Option<JoinHandle<()>>,
}

struct RegistryState {
    /// Copy-on-write list; fan-out iterates a cloned `Arc`
    subscribers: Arc<[Entry]>,
    next_handle: u64,
    generation: u64,
    active: Option<ActiveFeed>,
}

struct ReconcileState {
    /// Generation of the subscription whose events may touch the store
    generation: u64,
    reconciler: Reconciler,
}

struct Shared {
    feed: Arc<dyn TrafficFeed>,
    options: RegistryOptions,
    metrics: Arc<Metrics>,
    state: Mutex<RegistryState>,
    reconcile: Mutex<ReconcileState>,
    delivery: Mutex<()>,
}

/// Explicitly constructed registry; clone to share
#[derive(Clone)]
pub struct TrafficRegistry {
    shared: Arc<Shared>,
}

impl TrafficRegistry {
    pub fn new(feed: Arc<dyn TrafficFeed>, options: RegistryOptions, metrics: Arc<Metrics>) -> Self {
        let reconciler = Reconciler::new(options.reject_stale, options.evict_after_ms);
        Self {
            shared: Arc::new(Shared {
                feed,
                options,
                metrics,
                state: Mutex::new(RegistryState {
                    subscribers: Arc::from(Vec::new()),
                    next_handle: 1,
                    generation: 0,
                    active: None,
                }),
                reconcile: Mutex::new(ReconcileState { generation: 0, reconciler }),
                delivery: Mutex::new(()),
            }),
        }
    }

    /// Register a subscriber, opening the upstream feed if it is the first
    ///
    /// Opening the feed spawns a pump task, so the first subscribe must run
    /// inside a Tokio runtime.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionHandle {
        let (handle, open_error) = {
            let mut state = self.shared.state.lock();
            let handle = SubscriptionHandle(state.next_handle);
            state.next_handle += 1;

            let mut entries = state.subscribers.to_vec();
            entries.push(Entry { handle, subscriber, live: Arc::new(AtomicBool::new(true)) });
            state.subscribers = entries.into();

            let count = state.subscribers.len();
            self.shared.metrics.set_subscribers(count as u64);
            info!(handle = %handle, subscribers = %count, "subscriber_added");

            let open_error = if count == 1 { self.shared.activate(&mut state) } else { None };
            (handle, open_error)
        };

        if let Some(err) = open_error {
            self.shared.notify_error(&err);
        }
        handle
    }

    /// Remove a subscriber; the last one closes the feed and clears the store
    ///
    /// Returns false if the handle was not registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut state = self.shared.state.lock();

        let Some(entry) = state.subscribers.iter().find(|e| e.handle == handle) else {
            debug!(handle = %handle, "unsubscribe_unknown_handle");
            return false;
        };
        entry.live.store(false, Ordering::Release);

        let remaining: Vec<Entry> =
            state.subscribers.iter().filter(|e| e.handle != handle).cloned().collect();
        state.subscribers = remaining.into();

        let count = state.subscribers.len();
        self.shared.metrics.set_subscribers(count as u64);
        info!(handle = %handle, subscribers = %count, "subscriber_removed");

        if count == 0 {
            self.shared.deactivate(&mut state);
        }
        true
    }

    /// Drop every subscriber and close the feed
    pub fn unsubscribe_all(&self) {
        let handles: Vec<SubscriptionHandle> =
            self.shared.state.lock().subscribers.iter().map(|e| e.handle).collect();
        for handle in handles {
            self.unsubscribe(handle);
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// Owned copy of the reconciled store
    pub fn snapshot(&self) -> Vec<JunctionRecord> {
        self.shared.reconcile.lock().reconciler.snapshot()
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.shared.reconcile.lock().generation
    }

    #[cfg(test)]
    fn handle_event(&self, generation: u64, event: FeedEvent) {
        self.shared.handle_event(generation, event);
    }
}

impl Shared {
    /// Open the upstream feed; returns an error to report once the state lock is released
    fn activate(self: &Arc<Self>, state: &mut RegistryState) -> Option<FeedError> {
        state.generation += 1;
        let generation = state.generation;
        {
            let mut reconcile = self.reconcile.lock();
            reconcile.generation = generation;
            reconcile.reconciler.clear();
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(e) => {
                error!(error = %e, "feed_open_without_runtime");
                state.active = Some(ActiveFeed { connection: None, pump: None });
                return Some(FeedError::Transport(format!("no async runtime: {e}")));
            }
        };

        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let pump = runtime.spawn(pump_events(Arc::downgrade(self), generation, rx));

        match self.feed.open(&self.options.topic, tx) {
            Ok(connection) => {
                info!(topic = %self.options.topic, generation = %generation, "feed_opened");
                state.active = Some(ActiveFeed { connection: Some(connection), pump: Some(pump) });
                None
            }
            Err(e) => {
                error!(topic = %self.options.topic, error = %e, "feed_open_failed");
                self.metrics.record_feed_error();
                state.active = Some(ActiveFeed { connection: None, pump: Some(pump) });
                Some(FeedError::Transport(e.to_string()))
            }
        }
    }

    fn deactivate(&self, state: &mut RegistryState) {
        state.generation += 1;
        let generation = state.generation;

        if let Some(active) = state.active.take() {
            if let Some(connection) = active.connection {
                connection.close();
            }
            if let Some(pump) = active.pump {
                pump.abort();
            }
        }

        let mut reconcile = self.reconcile.lock();
        reconcile.generation = generation;
        reconcile.reconciler.clear();
        self.metrics.set_junctions(0);

        info!(topic = %self.options.topic, "feed_closed");
    }

    fn subscribers(&self) -> Arc<[Entry]> {
        self.state.lock().subscribers.clone()
    }

    /// Subscriber list, provided `generation` is still the active subscription
    fn subscribers_for(&self, generation: u64) -> Option<Arc<[Entry]>> {
        let state = self.state.lock();
        (state.generation == generation).then(|| state.subscribers.clone())
    }

    fn handle_event(&self, generation: u64, event: FeedEvent) {
        let _turn = self.delivery.lock();
        match event {
            FeedEvent::Snapshot(snapshot) => self.handle_snapshot(generation, snapshot),
            FeedEvent::Error(err) => {
                if self.reconcile.lock().generation != generation {
                    return;
                }
                warn!(error = %err, "feed_error");
                self.metrics.record_feed_error();
                let Some(subscribers) = self.subscribers_for(generation) else { return };
                for entry in subscribers.iter().filter(|e| e.is_live()) {
                    entry.subscriber.on_error(&err);
                }
            }
        }
    }

    fn handle_snapshot(&self, generation: u64, snapshot: FeedSnapshot) {
        let start = Instant::now();

        if snapshot.skipped > 0 {
            warn!(skipped = %snapshot.skipped, "junction_entries_skipped");
            self.metrics.record_malformed(snapshot.skipped as u64);
        }

        let result = {
            let mut reconcile = self.reconcile.lock();
            if reconcile.generation != generation {
                debug!(generation = %generation, "feed_event_from_closed_subscription");
                return;
            }
            let now_ms = if snapshot.received_at_ms > 0 { snapshot.received_at_ms } else { epoch_ms() };
            let result = reconcile.reconciler.reconcile(snapshot.records, now_ms);
            self.metrics.set_junctions(reconcile.reconciler.junction_count() as u64);
            result
        };

        self.metrics.record_snapshot(
            start.elapsed().as_micros() as u64,
            result.updated.len() as u64,
            result.stale as u64,
        );

        // The subscription may have been replaced since the store was updated
        let Some(subscribers) = self.subscribers_for(generation) else {
            debug!(generation = %generation, "feed_event_from_closed_subscription");
            return;
        };
        for entry in subscribers.iter().filter(|e| e.is_live()) {
            entry.subscriber.on_update(&result.updated);
        }

        for record in &result.emergencies {
            self.metrics.record_emergency();
            info!(
                junction_id = %record.junction_id,
                density = %record.vehicle_density,
                "emergency_vehicle_detected"
            );
            for entry in subscribers.iter().filter(|e| e.is_live()) {
                entry.subscriber.on_emergency(record);
            }
        }

        debug!(
            junctions = %result.updated.len(),
            emergencies = %result.emergencies.len(),
            subscribers = %subscribers.len(),
            latency_us = %start.elapsed().as_micros(),
            "snapshot_delivered"
        );
    }

    fn notify_error(&self, err: &FeedError) {
        for entry in self.subscribers().iter().filter(|e| e.is_live()) {
            entry.subscriber.on_error(err);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last registry handle gone while still subscribed
        if let Some(active) = self.state.get_mut().active.take() {
            if let Some(connection) = active.connection {
                connection.close();
            }
            if let Some(pump) = active.pump {
                pump.abort();
            }
            debug!(topic = %self.options.topic, "feed_closed_on_drop");
        }
    }
}

/// Drain feed events for one activation generation
async fn pump_events(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::Receiver<FeedEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        shared.handle_event(generation, event);
    }
    debug!(generation = %generation, "feed_pump_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct MockConnection {
        closed: Arc<AtomicUsize>,
    }

    impl FeedConnection for MockConnection {
        fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockFeed {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        senders: Mutex<Vec<mpsc::Sender<FeedEvent>>>,
        fail_open: AtomicBool,
    }

    impl MockFeed {
        fn latest_sender(&self) -> mpsc::Sender<FeedEvent> {
            self.senders.lock().last().cloned().expect("feed was opened")
        }
    }

    impl TrafficFeed for MockFeed {
        fn open(
            &self,
            topic: &str,
            events: mpsc::Sender<FeedEvent>,
        ) -> anyhow::Result<Box<dyn FeedConnection>> {
            assert_eq!(topic, "traffic_junctions");
            if self.fail_open.load(Ordering::SeqCst) {
                anyhow::bail!("permission denied");
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.senders.lock().push(events);
            Ok(Box::new(MockConnection { closed: self.closed.clone() }))
        }
    }

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<Vec<JunctionRecord>>>,
        emergencies: Mutex<Vec<JunctionRecord>>,
        errors: Mutex<Vec<FeedError>>,
    }

    impl Subscriber for Recorder {
        fn on_update(&self, records: &[JunctionRecord]) {
            self.updates.lock().push(records.to_vec());
        }

        fn on_emergency(&self, record: &JunctionRecord) {
            self.emergencies.lock().push(record.clone());
        }

        fn on_error(&self, error: &FeedError) {
            self.errors.lock().push(error.clone());
        }
    }

    /// Forwards updates to a channel so async tests can await delivery
    struct Forwarder {
        tx: mpsc::UnboundedSender<Vec<JunctionRecord>>,
    }

    impl Subscriber for Forwarder {
        fn on_update(&self, records: &[JunctionRecord]) {
            let _ = self.tx.send(records.to_vec());
        }

        fn on_emergency(&self, _record: &JunctionRecord) {}
    }

    fn setup() -> (TrafficRegistry, Arc<MockFeed>) {
        let feed = Arc::new(MockFeed::default());
        let registry =
            TrafficRegistry::new(feed.clone(), RegistryOptions::default(), Arc::new(Metrics::new()));
        (registry, feed)
    }

    fn scenario_snapshot() -> FeedEvent {
        FeedEvent::Snapshot(FeedSnapshot::new(vec![
            JunctionRecord::new("J1", 12.97, 77.59, 45),
            JunctionRecord::new("J2", 12.98, 77.60, 65).with_emergency(true),
        ]))
    }

    #[tokio::test]
    async fn test_single_upstream_subscription() {
        let (registry, feed) = setup();
        assert!(!registry.is_active());

        let a = registry.subscribe(Arc::new(Recorder::default()));
        let b = registry.subscribe(Arc::new(Recorder::default()));
        assert!(registry.is_active());
        assert_eq!(feed.opened.load(Ordering::SeqCst), 1);

        assert!(registry.unsubscribe(a));
        assert!(registry.is_active());
        assert_eq!(feed.closed.load(Ordering::SeqCst), 0);

        assert!(registry.unsubscribe(b));
        assert!(!registry.is_active());
        assert_eq!(feed.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_two_subscribers_see_identical_update() {
        let (registry, _feed) = setup();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        registry.subscribe(first.clone());
        registry.subscribe(second.clone());

        registry.handle_event(registry.generation(), scenario_snapshot());

        let a = first.updates.lock().clone();
        let b = second.updates.lock().clone();
        assert_eq!(a.len(), 1);
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 2);
    }

    #[tokio::test]
    async fn test_scenario_emergency_once() {
        let (registry, _feed) = setup();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        registry.handle_event(registry.generation(), scenario_snapshot());

        let emergencies = recorder.emergencies.lock().clone();
        assert_eq!(emergencies.len(), 1);
        assert_eq!(emergencies[0].junction_id.as_str(), "J2");
        assert_eq!(recorder.updates.lock()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribed_observer_gets_nothing() {
        let (registry, _feed) = setup();
        let recorder = Arc::new(Recorder::default());
        let handle = registry.subscribe(recorder.clone());
        let generation = registry.generation();

        registry.handle_event(generation, scenario_snapshot());
        assert!(registry.unsubscribe(handle));

        // Upstream keeps pushing on the old subscription
        registry.handle_event(generation, scenario_snapshot());
        registry.handle_event(generation, FeedEvent::Error(FeedError::Transport("x".into())));

        assert_eq!(recorder.updates.lock().len(), 1);
        assert!(recorder.errors.lock().is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_starts_from_scratch() {
        let (registry, feed) = setup();
        let handle = registry.subscribe(Arc::new(Recorder::default()));
        let old_generation = registry.generation();
        registry.handle_event(old_generation, scenario_snapshot());
        assert_eq!(registry.snapshot().len(), 2);

        registry.unsubscribe(handle);
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        assert_eq!(feed.opened.load(Ordering::SeqCst), 2);
        assert!(registry.snapshot().is_empty());

        // Late delivery from the first subscription must not leak in
        registry.handle_event(old_generation, scenario_snapshot());
        assert!(registry.snapshot().is_empty());
        assert!(recorder.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fanout_skips_subscribers_of_a_newer_subscription() {
        let (registry, _feed) = setup();
        let handle = registry.subscribe(Arc::new(Recorder::default()));
        let old_generation = registry.generation();
        assert!(registry.shared.subscribers_for(old_generation).is_some());

        registry.unsubscribe(handle);
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        assert!(registry.shared.subscribers_for(old_generation).is_none());
        let current = registry.shared.subscribers_for(registry.generation()).unwrap();
        assert_eq!(current.len(), 1);

        registry.handle_event(old_generation, FeedEvent::Error(FeedError::Transport("late".into())));
        assert!(recorder.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_feed() {
        let (registry, feed) = setup();
        registry.subscribe(Arc::new(Recorder::default()));
        let clone = registry.clone();

        drop(registry);
        assert_eq!(feed.closed.load(Ordering::SeqCst), 0);

        drop(clone);
        assert_eq!(feed.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_feed_error_reaches_everyone() {
        let (registry, _feed) = setup();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        registry.subscribe(first.clone());
        registry.subscribe(second.clone());

        let err = FeedError::Permission("denied".into());
        registry.handle_event(registry.generation(), FeedEvent::Error(err.clone()));

        assert_eq!(first.errors.lock().as_slice(), &[err.clone()]);
        assert_eq!(second.errors.lock().as_slice(), &[err]);
        assert!(registry.is_active());
    }

    #[tokio::test]
    async fn test_open_failure_reported_and_registry_stays_active() {
        let (registry, feed) = setup();
        feed.fail_open.store(true, Ordering::SeqCst);

        let recorder = Arc::new(Recorder::default());
        let handle = registry.subscribe(recorder.clone());

        assert!(registry.is_active());
        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(registry.unsubscribe(handle));
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let (registry, _feed) = setup();
        let handle = registry.subscribe(Arc::new(Recorder::default()));
        assert!(registry.unsubscribe(handle));
        assert!(!registry.unsubscribe(handle));
    }

    #[tokio::test]
    async fn test_pump_delivers_pushed_snapshots() {
        let (registry, feed) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.subscribe(Arc::new(Forwarder { tx }));

        feed.latest_sender().send(scenario_snapshot()).await.unwrap();

        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("update delivered")
            .expect("channel open");
        assert_eq!(update.len(), 2);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_during_fanout_does_not_deadlock() {
        struct Nested {
            registry: TrafficRegistry,
            added: AtomicBool,
        }

        impl Subscriber for Nested {
            fn on_update(&self, _records: &[JunctionRecord]) {
                if !self.added.swap(true, Ordering::SeqCst) {
                    self.registry.subscribe(Arc::new(Recorder::default()));
                    let _ = self.registry.snapshot();
                }
            }

            fn on_emergency(&self, _record: &JunctionRecord) {}
        }

        let (registry, _feed) = setup();
        registry.subscribe(Arc::new(Nested { registry: registry.clone(), added: AtomicBool::new(false) }));
        registry.handle_event(registry.generation(), scenario_snapshot());
        assert_eq!(registry.subscriber_count(), 2);
    }
}
