//! nswarden store: the list/watch informer.
//!
//! One background task owns the whole loop: full list, long-lived watch,
//! periodic resync, and re-list on expired watermarks. Cache mutations are
//! committed before the corresponding event is dispatched, and the cache is
//! never read from outside the task while it runs, so no locking is needed.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use nswarden_core::{Event, EventHandler, NamespaceClient, NsObject, WatchEvent};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Ordered set of event handlers. Registration happens before the informer
/// starts; delivery is synchronous and in registration order, and one
/// handler's failure never blocks the others.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn dispatch(&self, event: &Event) {
        counter!("nswarden_events_dispatched", 1u64);
        for handler in &self.handlers {
            let res = match event {
                Event::Added(obj) => handler.on_add(obj).await,
                Event::Updated { old, new } => handler.on_update(old, new).await,
                Event::Deleted(obj) => handler.on_delete(obj).await,
            };
            if let Err(err) = res {
                counter!("nswarden_handler_failures", 1u64);
                warn!(object = event.name(), error = %err, "event handler failed");
            }
        }
    }
}

/// Last-known state of every watched object plus the resume watermark.
#[derive(Debug, Default)]
pub struct CacheState {
    objects: FxHashMap<String, NsObject>,
    watermark: String,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NsObject> {
        self.objects.get(name)
    }

    pub fn watermark(&self) -> &str {
        &self.watermark
    }

    /// Apply one watch event. Returns the cache event to dispatch, or `None`
    /// when the delivery is a duplicate or otherwise not a state transition.
    pub fn apply_watch(&mut self, ev: WatchEvent) -> Option<Event> {
        match ev {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                self.watermark = obj.resource_version.clone();
                match self.objects.insert(obj.name.clone(), obj.clone()) {
                    None => Some(Event::Added(obj)),
                    Some(old) if old.resource_version == obj.resource_version => None,
                    Some(old) => Some(Event::Updated { old, new: obj }),
                }
            }
            WatchEvent::Deleted(obj) => {
                self.watermark = obj.resource_version.clone();
                // Emit the final snapshot the remote reported, not our stale copy.
                self.objects.remove(&obj.name).map(|_| Event::Deleted(obj))
            }
        }
    }

    /// Reconcile against a fresh full list: add what is missing, drop what
    /// vanished, surface changed entries as updates, and redeliver unchanged
    /// entries as adds so every live object is observed at least once per
    /// resync. Events come out in name order for determinism.
    pub fn apply_list(&mut self, mut items: Vec<NsObject>, watermark: String) -> Vec<Event> {
        let mut prev = std::mem::take(&mut self.objects);
        let mut events = Vec::with_capacity(items.len());
        items.sort_by(|a, b| a.name.cmp(&b.name));
        for item in items {
            match prev.remove(&item.name) {
                None => events.push(Event::Added(item.clone())),
                Some(old) if old.resource_version != item.resource_version => {
                    events.push(Event::Updated { old, new: item.clone() })
                }
                Some(_) => events.push(Event::Added(item.clone())),
            }
            self.objects.insert(item.name.clone(), item);
        }
        let mut gone: Vec<NsObject> = prev.into_values().collect();
        gone.sort_by(|a, b| a.name.cmp(&b.name));
        events.extend(gone.into_iter().map(Event::Deleted));
        self.watermark = watermark;
        events
    }
}

/// Phase of the synchronization state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Listing,
    Watching,
    Resyncing,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Full re-list cadence bounding staleness from missed watch events.
    pub resync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(180),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

struct Backoff {
    base: Duration,
    cap: Duration,
    cur: Duration,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, cur: base }
    }

    fn next(&mut self) -> Duration {
        let d = self.cur;
        self.cur = (self.cur * 2).min(self.cap);
        d
    }

    fn reset(&mut self) {
        self.cur = self.base;
    }
}

/// The informer: owns `CacheState`, drives list/watch/resync against the
/// remote client, and feeds the dispatcher. `run` consumes the informer and
/// hands it back on shutdown so callers (and tests) can inspect final state.
pub struct Informer {
    client: Arc<dyn NamespaceClient>,
    dispatcher: Dispatcher,
    state: CacheState,
    cfg: InformerConfig,
    phase: Phase,
}

impl Informer {
    pub fn new(client: Arc<dyn NamespaceClient>, dispatcher: Dispatcher, cfg: InformerConfig) -> Self {
        Self {
            client,
            dispatcher,
            state: CacheState::new(),
            cfg,
            phase: Phase::Listing,
        }
    }

    /// Register an additional handler. `run` consumes the informer, so all
    /// registration necessarily happens before delivery starts.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.dispatcher.register(handler);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &CacheState {
        &self.state
    }

    fn transition(&mut self, next: Phase) {
        if self.phase != next {
            debug!(from = ?self.phase, to = ?next, "sync phase transition");
            self.phase = next;
        }
    }

    /// Sleep for `dur` unless stop fires first; true means stop.
    async fn pause(&self, dur: Duration, stop: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = stop.changed() => true,
            _ = tokio::time::sleep(dur) => false,
        }
    }

    /// Apply a batch of list-diff events and dispatch each one. Checks the
    /// stop flag between events so shutdown stays prompt on large clusters.
    async fn dispatch_all(&mut self, events: Vec<Event>, stop: &watch::Receiver<bool>) -> bool {
        for ev in events {
            if *stop.borrow() {
                return true;
            }
            self.dispatcher.dispatch(&ev).await;
        }
        false
    }

    /// Run until `stop` flips true. Returns the informer with its final
    /// cache state for post-shutdown inspection.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Self {
        let mut backoff = Backoff::new(self.cfg.backoff_base, self.cfg.backoff_cap);
        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + self.cfg.resync_interval,
            self.cfg.resync_interval,
        );
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'machine: while !*stop.borrow() {
            match self.phase {
                Phase::Listing | Phase::Resyncing => {
                    counter!("nswarden_list_total", 1u64);
                    let listed = tokio::select! {
                        _ = stop.changed() => break 'machine,
                        res = self.client.list() => res,
                    };
                    match listed {
                        Ok((items, rv)) => {
                            let events = self.state.apply_list(items, rv);
                            info!(
                                objects = self.state.len(),
                                watermark = %self.state.watermark(),
                                events = events.len(),
                                "list complete"
                            );
                            if self.dispatch_all(events, &stop).await {
                                break 'machine;
                            }
                            backoff.reset();
                            resync.reset();
                            self.transition(Phase::Watching);
                        }
                        Err(err) => {
                            let wait = backoff.next();
                            warn!(error = %err, retry_in = ?wait, "list failed");
                            if self.pause(wait, &mut stop).await {
                                break 'machine;
                            }
                        }
                    }
                }
                Phase::Watching => {
                    counter!("nswarden_watch_total", 1u64);
                    let opened = tokio::select! {
                        _ = stop.changed() => break 'machine,
                        res = self.client.watch(self.state.watermark()) => res,
                    };
                    let mut stream = match opened {
                        Ok(stream) => stream,
                        Err(err) if err.is_expired() => {
                            counter!("nswarden_relist_on_expired", 1u64);
                            warn!(watermark = %self.state.watermark(), "watch watermark expired; re-listing");
                            self.transition(Phase::Resyncing);
                            continue 'machine;
                        }
                        Err(err) => {
                            let wait = backoff.next();
                            warn!(error = %err, retry_in = ?wait, "watch open failed");
                            if self.pause(wait, &mut stop).await {
                                break 'machine;
                            }
                            continue 'machine;
                        }
                    };
                    loop {
                        tokio::select! {
                            _ = stop.changed() => break 'machine,
                            _ = resync.tick() => {
                                debug!("resync interval elapsed");
                                self.transition(Phase::Resyncing);
                                continue 'machine;
                            }
                            item = stream.next() => match item {
                                Some(Ok(wev)) => {
                                    backoff.reset();
                                    if let Some(ev) = self.state.apply_watch(wev) {
                                        self.dispatcher.dispatch(&ev).await;
                                    }
                                }
                                Some(Err(err)) if err.is_expired() => {
                                    counter!("nswarden_relist_on_expired", 1u64);
                                    warn!(watermark = %self.state.watermark(), "watch watermark expired; re-listing");
                                    self.transition(Phase::Resyncing);
                                    continue 'machine;
                                }
                                Some(Err(err)) => {
                                    let wait = backoff.next();
                                    warn!(error = %err, retry_in = ?wait, "watch stream error; reconnecting");
                                    if self.pause(wait, &mut stop).await {
                                        break 'machine;
                                    }
                                    continue 'machine;
                                }
                                None => {
                                    let wait = backoff.next();
                                    debug!(retry_in = ?wait, "watch stream ended; reconnecting");
                                    if self.pause(wait, &mut stop).await {
                                        break 'machine;
                                    }
                                    continue 'machine;
                                }
                            }
                        }
                    }
                }
                Phase::Stopped => break 'machine,
            }
        }
        self.transition(Phase::Stopped);
        info!(objects = self.state.len(), "informer stopped");
        self
    }
}
