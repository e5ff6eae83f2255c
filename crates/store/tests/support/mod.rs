//! Scripted fake of the remote namespace service for informer tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::stream;
use futures::StreamExt;
use nswarden_core::{
    ClientError, Event, EventHandler, NamespaceClient, NsObject, WatchEvent, WatchEventStream,
};

/// One scripted answer to a `watch` call. `Events` yields the given items
/// and then hangs like a healthy idle watch; an unscripted call also hangs.
pub enum WatchPlan {
    Fail(ClientError),
    Events(Vec<Result<WatchEvent, ClientError>>),
}

#[derive(Default)]
pub struct FakeClient {
    pub list_calls: AtomicUsize,
    pub watch_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    /// Watermarks each watch call resumed from, in call order.
    pub watch_from: Mutex<Vec<String>>,
    /// Objects passed to `update`, in call order.
    pub updates: Mutex<Vec<NsObject>>,
    list_plan: Mutex<VecDeque<Result<(Vec<NsObject>, String), ClientError>>>,
    default_list: Mutex<(Vec<NsObject>, String)>,
    watch_plan: Mutex<VecDeque<WatchPlan>>,
    update_plan: Mutex<VecDeque<Result<(), ClientError>>>,
}

impl FakeClient {
    pub fn new(objects: Vec<NsObject>, rv: &str) -> Self {
        let fake = Self::default();
        *fake.default_list.lock().unwrap() = (objects, rv.to_string());
        fake
    }

    /// Queue a one-shot list response consumed before the default.
    pub fn queue_list(&self, res: Result<(Vec<NsObject>, String), ClientError>) {
        self.list_plan.lock().unwrap().push_back(res);
    }

    pub fn set_default_list(&self, objects: Vec<NsObject>, rv: &str) {
        *self.default_list.lock().unwrap() = (objects, rv.to_string());
    }

    pub fn queue_watch(&self, plan: WatchPlan) {
        self.watch_plan.lock().unwrap().push_back(plan);
    }

    pub fn queue_update(&self, res: Result<(), ClientError>) {
        self.update_plan.lock().unwrap().push_back(res);
    }

    pub fn total_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
            + self.watch_calls.load(Ordering::SeqCst)
            + self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NamespaceClient for FakeClient {
    async fn list(&self) -> Result<(Vec<NsObject>, String), ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(step) = self.list_plan.lock().unwrap().pop_front() {
            return step;
        }
        Ok(self.default_list.lock().unwrap().clone())
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchEventStream, ClientError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.watch_from
            .lock()
            .unwrap()
            .push(resource_version.to_string());
        match self.watch_plan.lock().unwrap().pop_front() {
            Some(WatchPlan::Fail(err)) => Err(err),
            Some(WatchPlan::Events(items)) => {
                Ok(Box::pin(stream::iter(items).chain(stream::pending())))
            }
            None => Ok(Box::pin(stream::pending())),
        }
    }

    async fn update(&self, desired: &NsObject) -> Result<NsObject, ClientError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(step) = self.update_plan.lock().unwrap().pop_front() {
            step?;
        }
        self.updates.lock().unwrap().push(desired.clone());
        let mut stored = desired.clone();
        stored.resource_version = format!("{}+", desired.resource_version);
        Ok(stored)
    }
}

/// Handler that records every event it sees.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EventHandler for Recorder {
    async fn on_add(&self, obj: &NsObject) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(Event::Added(obj.clone()));
        Ok(())
    }

    async fn on_update(&self, old: &NsObject, new: &NsObject) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(Event::Updated {
            old: old.clone(),
            new: new.clone(),
        });
        Ok(())
    }

    async fn on_delete(&self, obj: &NsObject) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(Event::Deleted(obj.clone()));
        Ok(())
    }
}

/// Handler that always errors, for dispatcher isolation tests.
pub struct Exploder;

#[async_trait::async_trait]
impl EventHandler for Exploder {
    async fn on_add(&self, _obj: &NsObject) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }

    async fn on_update(&self, _old: &NsObject, _new: &NsObject) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }
}

pub fn obj(name: &str, rv: &str) -> NsObject {
    NsObject::new(name, rv)
}

pub fn labeled(name: &str, rv: &str, pairs: &[(&str, &str)]) -> NsObject {
    let mut o = NsObject::new(name, rv);
    for (k, v) in pairs {
        o.labels.insert((*k).to_string(), (*v).to_string());
    }
    o
}
