//! nswarden kube integration: the production `NamespaceClient` backed by the
//! cluster's namespace API. Maps kube status codes onto the domain error
//! taxonomy (410 Gone drives the re-list path, 409 the conflict drop).

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams, WatchParams};
use kube::core::WatchEvent as KubeWatchEvent;
use kube::Client;
use nswarden_core::{ClientError, NamespaceClient, NsObject, WatchEvent, WatchEventStream};
use tracing::{debug, info};

pub struct KubeNamespaceClient {
    api: Api<Namespace>,
}

impl KubeNamespaceClient {
    /// Connect using the ambient kubeconfig/in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("building kube client from environment")?;
        info!("connected to cluster API");
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

fn to_ns_object(ns: &Namespace) -> Result<NsObject, ClientError> {
    let meta = &ns.metadata;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| ClientError::Decode("namespace missing metadata.name".into()))?;
    Ok(NsObject {
        name,
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
    })
}

fn to_namespace(obj: &NsObject) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(obj.name.clone()),
            resource_version: Some(obj.resource_version.clone()),
            labels: Some(obj.labels.clone()),
            annotations: Some(obj.annotations.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn map_kube_err(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(ae) if ae.code == 410 => ClientError::Expired(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(ae.message),
        kube::Error::SerdeError(e) => ClientError::Decode(e.to_string()),
        other => ClientError::Transport(other.to_string()),
    }
}

#[async_trait::async_trait]
impl NamespaceClient for KubeNamespaceClient {
    async fn list(&self) -> Result<(Vec<NsObject>, String), ClientError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(map_kube_err)?;
        let watermark = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list
            .items
            .iter()
            .map(to_ns_object)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(items = items.len(), watermark = %watermark, "listed namespaces");
        Ok((items, watermark))
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchEventStream, ClientError> {
        let stream = self
            .api
            .watch(&WatchParams::default(), resource_version)
            .await
            .map_err(map_kube_err)?;
        debug!(from = %resource_version, "namespace watch opened");
        let mapped = stream.filter_map(|item| async move {
            match item {
                Ok(KubeWatchEvent::Added(ns)) => Some(to_ns_object(&ns).map(WatchEvent::Added)),
                Ok(KubeWatchEvent::Modified(ns)) => {
                    Some(to_ns_object(&ns).map(WatchEvent::Modified))
                }
                Ok(KubeWatchEvent::Deleted(ns)) => Some(to_ns_object(&ns).map(WatchEvent::Deleted)),
                // Bookmarks only advance the watermark, which real events do anyway.
                Ok(KubeWatchEvent::Bookmark(_)) => None,
                Ok(KubeWatchEvent::Error(er)) if er.code == 410 => {
                    Some(Err(ClientError::Expired(er.message)))
                }
                Ok(KubeWatchEvent::Error(er)) => Some(Err(ClientError::Transport(format!(
                    "{} (status {})",
                    er.message, er.code
                )))),
                Err(e) => Some(Err(map_kube_err(e))),
            }
        });
        Ok(Box::pin(mapped))
    }

    async fn update(&self, desired: &NsObject) -> Result<NsObject, ClientError> {
        let stored = self
            .api
            .replace(&desired.name, &PostParams::default(), &to_namespace(desired))
            .await
            .map_err(map_kube_err)?;
        to_ns_object(&stored)
    }
}
