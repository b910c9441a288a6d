//! Workload and autoscaler-binding admin
//!
//! [`WorkloadAdmin`] manages the receive adapter Deployment and collects
//! diagnostics from its pods. [`BindingAdmin`] manages the KEDA ScaledObject.

use crate::error::{OperatorError, Result};
use crate::resources::scaled_object_resource;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use std::collections::HashSet;
use tracing::debug;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "rivven-operator";

/// Manages receive adapter Deployments
#[async_trait]
pub trait WorkloadAdmin: Send + Sync {
    async fn list_workloads(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>>;

    async fn create_workload(&self, namespace: &str, deployment: &Deployment)
        -> Result<Deployment>;

    /// Replace a workload; the object carries the resourceVersion it was read at
    async fn update_workload(&self, namespace: &str, deployment: &Deployment)
        -> Result<Deployment>;

    /// Delete a workload; deleting an absent one succeeds
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;

    /// Recent diagnostic messages from the workload's pods
    async fn diagnostics(&self, namespace: &str, selector: &str) -> Result<Vec<String>>;
}

/// Manages the autoscaler binding
#[async_trait]
pub trait BindingAdmin: Send + Sync {
    async fn get_binding(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>>;

    async fn create_or_update_binding(
        &self,
        namespace: &str,
        binding: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete a binding; deleting an absent one succeeds
    async fn delete_binding(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Deployment admin backed by the Kubernetes API
pub struct KubeWorkloadAdmin {
    client: Client,
}

impl KubeWorkloadAdmin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadAdmin for KubeWorkloadAdmin {
    async fn list_workloads(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn create_workload(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), deployment).await?)
    }

    async fn update_workload(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment.metadata.name.as_deref().ok_or_else(|| {
            OperatorError::InvalidConfig("deployment has no name".to_string())
        })?;
        Ok(api.replace(name, &PostParams::default(), deployment).await?)
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn diagnostics(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = pods.list(&ListParams::default().labels(selector)).await?.items;

        let mut messages = Vec::new();
        for pod in &pods {
            messages.extend(pod_messages(pod));
        }

        let pod_names: HashSet<String> = pods.iter().map(|p| p.name_any()).collect();
        if !pod_names.is_empty() {
            let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
            let events = events
                .list(&ListParams::default().fields("involvedObject.kind=Pod,type=Warning"))
                .await?;
            messages.extend(
                events
                    .items
                    .into_iter()
                    .filter(|e| {
                        e.involved_object
                            .name
                            .as_ref()
                            .is_some_and(|n| pod_names.contains(n))
                    })
                    .filter_map(|e| e.message),
            );
        }

        debug!(count = messages.len(), "Collected workload diagnostics");
        Ok(messages)
    }
}

/// Termination and waiting messages of every container in a pod
fn pod_messages(pod: &Pod) -> Vec<String> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());
    let Some(statuses) = statuses else {
        return Vec::new();
    };

    let mut messages = Vec::new();
    for status in statuses {
        let last = status
            .last_state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .and_then(|t| t.message.clone());
        let current = status.state.as_ref().and_then(|s| {
            s.terminated
                .as_ref()
                .and_then(|t| t.message.clone())
                .or_else(|| s.waiting.as_ref().and_then(|w| w.message.clone()))
        });
        messages.extend(last);
        messages.extend(current);
    }
    messages
}

/// ScaledObject admin backed by the Kubernetes API
pub struct KedaBindingAdmin {
    client: Client,
}

impl KedaBindingAdmin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &scaled_object_resource())
    }
}

#[async_trait]
impl BindingAdmin for KedaBindingAdmin {
    async fn get_binding(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create_or_update_binding(
        &self,
        namespace: &str,
        binding: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = binding.metadata.name.as_deref().ok_or_else(|| {
            OperatorError::InvalidConfig("binding has no name".to_string())
        })?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .api(namespace)
            .patch(name, &params, &Patch::Apply(binding))
            .await?)
    }

    async fn delete_binding(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
