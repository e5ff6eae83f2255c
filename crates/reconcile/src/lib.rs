//! nswarden reconciler: checks observed namespace objects against the policy
//! store and corrects drift with an optimistic-concurrency update.
//!
//! Adds and updates both funnel into the same check; applying the same
//! observation twice converges without re-issuing updates, which is what
//! makes resync redelivery safe.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use nswarden_core::{EventHandler, NamespaceClient, NsObject};
use nswarden_policy::Policy;
use tracing::{debug, info, warn};

pub struct Reconciler {
    client: Arc<dyn NamespaceClient>,
    policy: Arc<Policy>,
}

impl Reconciler {
    pub fn new(client: Arc<dyn NamespaceClient>, policy: Arc<Policy>) -> Self {
        Self { client, policy }
    }

    /// Evaluate one observed snapshot and issue a corrective update when its
    /// state drifts from the first matching rule. No matching rule and an
    /// already-compliant object are both clean no-ops.
    async fn check_and_update(&self, obj: &NsObject) -> Result<()> {
        let Some(rule) = self.policy.first_match(obj) else {
            debug!(object = %obj.name, "no policy rule matches");
            return Ok(());
        };
        let desired = rule.desired(obj);
        if desired == *obj {
            debug!(object = %obj.name, rule = %rule.name, "compliant");
            return Ok(());
        }
        // Carries the observed resource version; a stale one gets a conflict.
        match self.client.update(&desired).await {
            Ok(stored) => {
                counter!("nswarden_updates_applied", 1u64);
                info!(
                    object = %obj.name,
                    rule = %rule.name,
                    resource_version = %stored.resource_version,
                    "corrected policy drift"
                );
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                // Superseded: a fresher watch event will retrigger us.
                counter!("nswarden_update_conflicts", 1u64);
                debug!(object = %obj.name, "update conflicted; dropping as stale");
                Ok(())
            }
            Err(err) => {
                counter!("nswarden_update_failures", 1u64);
                warn!(object = %obj.name, error = %err, "corrective update failed");
                Err(err).with_context(|| format!("updating namespace {}", obj.name))
            }
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for Reconciler {
    async fn on_add(&self, obj: &NsObject) -> Result<()> {
        self.check_and_update(obj).await
    }

    async fn on_update(&self, _old: &NsObject, new: &NsObject) -> Result<()> {
        self.check_and_update(new).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use nswarden_core::{ClientError, WatchEventStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubClient {
        update_calls: AtomicUsize,
        updates: Mutex<Vec<NsObject>>,
        fail_next: Mutex<Option<ClientError>>,
    }

    #[async_trait::async_trait]
    impl NamespaceClient for StubClient {
        async fn list(&self) -> Result<(Vec<NsObject>, String), ClientError> {
            Ok((Vec::new(), "0".into()))
        }

        async fn watch(&self, _rv: &str) -> Result<WatchEventStream, ClientError> {
            Ok(Box::pin(stream::pending()))
        }

        async fn update(&self, desired: &NsObject) -> Result<NsObject, ClientError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_next.lock().unwrap().take() {
                return Err(err);
            }
            self.updates.lock().unwrap().push(desired.clone());
            Ok(desired.clone())
        }
    }

    fn policy(yaml: &str) -> Arc<Policy> {
        Arc::new(Policy::from_yaml(yaml).unwrap())
    }

    fn labeled(name: &str, rv: &str, pairs: &[(&str, &str)]) -> NsObject {
        let mut o = NsObject::new(name, rv);
        for (k, v) in pairs {
            o.labels.insert((*k).to_string(), (*v).to_string());
        }
        o
    }

    #[tokio::test]
    async fn drift_triggers_one_corrective_update() {
        let client = Arc::new(StubClient::default());
        let p = policy(
            r#"
rules:
  - name: team
    set:
      labels:
        team: infra
"#,
        );
        let r = Reconciler::new(client.clone(), p);

        let obj = NsObject::new("ns-1", "4");
        r.on_add(&obj).await.unwrap();
        assert_eq!(client.update_calls.load(Ordering::SeqCst), 1);
        let sent = client.updates.lock().unwrap().clone();
        assert_eq!(sent[0].labels.get("team").map(String::as_str), Some("infra"));
        assert_eq!(sent[0].resource_version, "4");
    }

    #[tokio::test]
    async fn compliant_object_issues_no_update() {
        let client = Arc::new(StubClient::default());
        let p = policy(
            r#"
rules:
  - name: team
    set:
      labels:
        team: infra
"#,
        );
        let r = Reconciler::new(client.clone(), p);

        let obj = labeled("ns-1", "4", &[("team", "infra")]);
        // Redelivered adds (resync) must not re-issue updates.
        r.on_add(&obj).await.unwrap();
        r.on_add(&obj).await.unwrap();
        r.on_update(&obj, &obj).await.unwrap();
        assert_eq!(client.update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let client = Arc::new(StubClient::default());
        let p = policy(
            r#"
rules:
  - name: r1
    match:
      labels:
        x: "true"
    set:
      labels:
        tier: gold
  - name: r2
    set:
      labels:
        tier: default
"#,
        );
        let r = Reconciler::new(client.clone(), p);

        let obj = labeled("ns-a", "1", &[("x", "true")]);
        r.on_add(&obj).await.unwrap();
        let sent = client.updates.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].labels.get("tier").map(String::as_str), Some("gold"));
    }

    #[tokio::test]
    async fn no_matching_rule_is_a_noop() {
        let client = Arc::new(StubClient::default());
        let p = policy(
            r#"
rules:
  - name: prod-only
    match:
      labels:
        env: prod
    set:
      labels:
        team: infra
"#,
        );
        let r = Reconciler::new(client.clone(), p);
        r.on_add(&NsObject::new("ns-dev", "1")).await.unwrap();
        assert_eq!(client.update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn conflict_is_dropped_without_retry() {
        let client = Arc::new(StubClient::default());
        *client.fail_next.lock().unwrap() = Some(ClientError::Conflict("ns-1".into()));
        let p = policy(
            r#"
rules:
  - name: team
    set:
      labels:
        team: infra
"#,
        );
        let r = Reconciler::new(client.clone(), p);

        // Conflict means superseded: swallowed, no immediate retry.
        r.on_add(&NsObject::new("ns-1", "4")).await.unwrap();
        assert_eq!(client.update_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_handler_error() {
        let client = Arc::new(StubClient::default());
        *client.fail_next.lock().unwrap() = Some(ClientError::Transport("boom".into()));
        let p = policy(
            r#"
rules:
  - name: team
    set:
      labels:
        team: infra
"#,
        );
        let r = Reconciler::new(client.clone(), p);
        assert!(r.on_add(&NsObject::new("ns-1", "4")).await.is_err());
    }
}
