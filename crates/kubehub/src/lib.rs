//! kmerge kubehub: kube-rs adapters for the watched kind (`v1/Secret`).
//!
//! Annotations carry the tag vocabulary and `data` is the payload.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kmerge_core::{Delta, MergePatch, ObjectRef, ObjectStore, StoreError, WatchedObject};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

pub fn secret_to_object(secret: &Secret) -> WatchedObject {
    let meta = &secret.metadata;
    WatchedObject {
        id: ObjectRef::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default()),
        tags: meta.annotations.clone().unwrap_or_default(),
        payload: secret
            .data
            .as_ref()
            .map(|d| d.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
            .unwrap_or_default(),
        deleting: meta.deletion_timestamp.is_some(),
    }
}

/// JSON merge patch body: annotations plus base64 `data`.
pub fn patch_body(patch: &MergePatch) -> serde_json::Value {
    let data: BTreeMap<&str, ByteString> =
        patch.payload.iter().map(|(k, v)| (k.as_str(), ByteString(v.clone()))).collect();
    serde_json::json!({
        "metadata": { "annotations": patch.tags },
        "data": data,
    })
}

fn store_err(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message),
        other => StoreError::Internal(other.to_string()),
    }
}

/// [`ObjectStore`] over the Secrets API.
#[derive(Clone)]
pub struct SecretStore {
    client: Client,
}

impl SecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: Option<&str>) -> Api<Secret> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for SecretStore {
    async fn get(&self, id: &ObjectRef) -> Result<Option<WatchedObject>, StoreError> {
        let secret = self.api(Some(&id.namespace)).get_opt(&id.name).await.map_err(store_err)?;
        Ok(secret.as_ref().map(secret_to_object))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<WatchedObject>, StoreError> {
        let list = self.api(namespace).list(&ListParams::default()).await.map_err(store_err)?;
        Ok(list.items.iter().map(secret_to_object).collect())
    }

    async fn merge_patch(&self, id: &ObjectRef, patch: &MergePatch) -> Result<(), StoreError> {
        let body = patch_body(patch);
        self.api(Some(&id.namespace))
            .patch(&id.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map(|_| ())
            .map_err(store_err)
    }
}

/// Flatten one watcher event into deltas. A restart re-delivers the full list as applied.
pub fn deltas_from(ev: Event<Secret>) -> Vec<Delta> {
    match ev {
        Event::Applied(s) => vec![Delta::applied(secret_to_object(&s))],
        Event::Deleted(s) => vec![Delta::deleted(secret_to_object(&s))],
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            list.iter().map(|s| Delta::applied(secret_to_object(s))).collect()
        }
    }
}

/// List+watch Secrets (one namespace or all) and send deltas into `tx`. Watch errors are
/// retried with backoff; returns once the receiver is dropped.
pub async fn start_watcher(client: Client, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> Result<()> {
    let api: Api<Secret> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "secret watcher started");
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "watch error");
                continue;
            }
        };
        for d in deltas_from(ev) {
            if tx.send(d).await.is_err() {
                debug!("delta receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}
