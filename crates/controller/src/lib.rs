//! nswarden lifecycle controller: wires the remote client, policy store, and
//! reconciler into an informer, then runs it until a shutdown signal fires.
//!
//! Policy loading stays with the binary (`Policy::load`), which decides to
//! abort the process on an invalid file; by the time a `Controller` exists
//! everything is validated and ready to run.

#![forbid(unsafe_code)]

use std::sync::Arc;

use nswarden_core::{EventHandler, NamespaceClient};
use nswarden_policy::Policy;
use nswarden_reconcile::Reconciler;
use nswarden_store::{Dispatcher, Informer, InformerConfig};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

pub struct Controller {
    informer: Informer,
}

impl Controller {
    /// Wire the reconciler into a fresh dispatcher and build the informer.
    /// The reconciler is registered before anything can start, so it sees
    /// every object the initial list seeds.
    pub fn new(client: Arc<dyn NamespaceClient>, policy: Arc<Policy>, cfg: InformerConfig) -> Self {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(Reconciler::new(client.clone(), policy)));
        Self {
            informer: Informer::new(client, dispatcher, cfg),
        }
    }

    /// Register an extra handler alongside the reconciler.
    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.informer.register(handler);
    }

    /// Start the informer's background task and block until `stop` fires,
    /// then wait for the task to unwind and signal `done` for coordinated
    /// shutdown with other subsystems.
    pub async fn run(self, stop: watch::Receiver<bool>, done: oneshot::Sender<()>) {
        let mut stop_wait = stop.clone();
        let task = tokio::spawn(self.informer.run(stop));

        if !*stop_wait.borrow() {
            // Sender dropped counts as a stop request too.
            let _ = stop_wait.changed().await;
        }
        info!("shutdown requested; waiting for informer");
        match task.await {
            Ok(informer) => info!(objects = informer.state().len(), "controller stopped"),
            Err(err) => warn!(error = %err, "informer task failed"),
        }
        let _ = done.send(());
    }
}
