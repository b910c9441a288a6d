//! In-memory fakes and fixtures for reconciler tests

use crate::capabilities::SubscriptionOwner;
use crate::crd::{
    Destination, KReference, RivvenPullSubscription, RivvenPullSubscriptionSpec,
    SecretKeyReference,
};
use crate::error::{OperatorError, Result};
use crate::pubsub_client::{MessagingAdmin, MessagingClient, SubscriptionConfig, SubscriptionInfo};
use crate::reconciler::DEFAULT_ADAPTER_IMAGE;
use crate::resolver::{AddressResolver, DesiredConfig, ResolveError};
use crate::workload::{BindingAdmin, WorkloadAdmin};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use url::Url;

pub const TEST_SINK_URI: &str = "http://event-display.testnamespace.svc.cluster.local/";

/// Pull subscription named `my-ps` in `testnamespace` with a Service sink
pub fn test_subscription() -> RivvenPullSubscription {
    RivvenPullSubscription {
        metadata: ObjectMeta {
            name: Some("my-ps".to_string()),
            namespace: Some("testnamespace".to_string()),
            uid: Some("test-uid".to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: RivvenPullSubscriptionSpec {
            topic: "test-topic".to_string(),
            project: Some("test-project-id".to_string()),
            ack_deadline: None,
            retain_acked_messages: false,
            retention_duration: None,
            secret: SecretKeyReference::default(),
            sink: Destination {
                reference: Some(KReference {
                    api_version: "v1".to_string(),
                    kind: "Service".to_string(),
                    name: "event-display".to_string(),
                    namespace: None,
                }),
                uri: None,
            },
            transformer: None,
            ce_overrides: None,
        },
        status: None,
    }
}

/// Desired state for a fixture without going through the resolver
pub fn desired_config(ps: &RivvenPullSubscription) -> DesiredConfig {
    DesiredConfig {
        project_id: ps
            .requested_project()
            .unwrap_or("test-project-id")
            .to_string(),
        derived_subscription_id: ps.derived_subscription_id(),
        subscription: SubscriptionConfig {
            topic: ps.spec.topic.clone(),
            ack_deadline: ps.spec.ack_deadline(),
            retention_duration: ps.spec.retention_duration(),
            retain_acked_messages: ps.spec.retain_acked_messages,
            labels: BTreeMap::new(),
        },
        sink_uri: Url::parse(TEST_SINK_URI).unwrap(),
        transformer_uri: None,
        autoscaling: ps.autoscaling(),
        adapter_image: DEFAULT_ADAPTER_IMAGE.to_string(),
        ce_extensions: BTreeMap::new(),
    }
}

/// A 500 from the API server
pub fn kube_error(message: &str) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

/// Resolver with a fixed table of addressable names
#[derive(Default)]
pub struct FakeResolver {
    addresses: HashMap<String, Url>,
}

impl FakeResolver {
    /// Resolves the fixture's `event-display` Service
    pub fn with_sink() -> Self {
        let mut resolver = Self::default();
        resolver.insert("event-display", TEST_SINK_URI);
        resolver
    }

    pub fn insert(&mut self, name: &str, url: &str) {
        self.addresses
            .insert(name.to_string(), Url::parse(url).unwrap());
    }
}

#[async_trait]
impl AddressResolver for FakeResolver {
    async fn resolve(
        &self,
        _namespace: &str,
        destination: &Destination,
    ) -> std::result::Result<Url, ResolveError> {
        match (&destination.reference, &destination.uri) {
            (Some(r), _) => self.addresses.get(&r.name).cloned().ok_or_else(|| {
                ResolveError::NotFound(format!("services \"{}\" not found", r.name))
            }),
            (None, Some(uri)) => {
                Url::parse(uri).map_err(|e| ResolveError::NotFound(e.to_string()))
            }
            (None, None) => Err(ResolveError::NotFound("empty destination".to_string())),
        }
    }
}

/// Call counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub applies: usize,
}

#[derive(Default)]
struct MessagingState {
    topics: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionInfo>,
    calls: Calls,
    client_error: Option<String>,
    create_error: Option<String>,
    delete_error: Option<String>,
}

/// In-memory Pub/Sub
#[derive(Default, Clone)]
pub struct FakeMessaging {
    state: Arc<Mutex<MessagingState>>,
}

impl FakeMessaging {
    pub fn with_topic(topic: &str) -> Self {
        let fake = Self::default();
        fake.state.lock().topics.insert(topic.to_string());
        fake
    }

    pub fn insert_subscription(&self, id: &str, config: &SubscriptionConfig) {
        self.state
            .lock()
            .subscriptions
            .insert(id.to_string(), info(id, config));
    }

    pub fn subscription(&self, id: &str) -> Option<SubscriptionInfo> {
        self.state.lock().subscriptions.get(id).cloned()
    }

    /// Drop a subscription behind the operator's back
    pub fn remove_subscription(&self, id: &str) {
        self.state.lock().subscriptions.remove(id);
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().calls
    }

    pub fn fail_client_create(&self, message: &str) {
        self.state.lock().client_error = Some(message.to_string());
    }

    pub fn fail_create(&self, message: &str) {
        self.state.lock().create_error = Some(message.to_string());
    }

    pub fn fail_delete(&self, message: &str) {
        self.state.lock().delete_error = Some(message.to_string());
    }
}

fn info(id: &str, config: &SubscriptionConfig) -> SubscriptionInfo {
    SubscriptionInfo {
        id: id.to_string(),
        topic: config.topic.clone(),
        ack_deadline: config.ack_deadline,
        retention_duration: config.retention_duration,
        retain_acked_messages: config.retain_acked_messages,
    }
}

#[async_trait]
impl MessagingAdmin for FakeMessaging {
    async fn create_client(&self, _project_id: &str) -> Result<Arc<dyn MessagingClient>> {
        if let Some(e) = self.state.lock().client_error.clone() {
            return Err(OperatorError::ClientCreate(e));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl MessagingClient for FakeMessaging {
    async fn topic_exists(&self, topic_id: &str) -> Result<bool> {
        Ok(self.state.lock().topics.contains(topic_id))
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<SubscriptionInfo>> {
        Ok(self.subscription(subscription_id))
    }

    async fn create_subscription(
        &self,
        subscription_id: &str,
        config: &SubscriptionConfig,
    ) -> Result<SubscriptionInfo> {
        let mut state = self.state.lock();
        if let Some(e) = state.create_error.clone() {
            return Err(OperatorError::Messaging(e));
        }
        state.calls.creates += 1;
        let created = info(subscription_id, config);
        state
            .subscriptions
            .insert(subscription_id.to_string(), created.clone());
        Ok(created)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        config: &SubscriptionConfig,
    ) -> Result<SubscriptionInfo> {
        let mut state = self.state.lock();
        state.calls.updates += 1;
        let updated = info(subscription_id, config);
        state
            .subscriptions
            .insert(subscription_id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(e) = state.delete_error.clone() {
            return Err(OperatorError::Messaging(e));
        }
        state.calls.deletes += 1;
        state.subscriptions.remove(subscription_id);
        Ok(())
    }
}

#[derive(Default)]
struct WorkloadState {
    deployments: BTreeMap<String, Deployment>,
    available: Option<String>,
    diagnostics: Vec<String>,
    calls: Calls,
    resource_version: u64,
    list_error: Option<String>,
    create_error: Option<String>,
    update_error: Option<String>,
}

impl WorkloadState {
    /// Attach the configured Available condition
    fn observed(&self, mut deployment: Deployment) -> Deployment {
        deployment.status = self.available.as_ref().map(|status| {
            let (reason, message) = if status == "True" {
                ("MinimumReplicasAvailable", "Deployment has minimum availability.")
            } else {
                (
                    "MinimumReplicasUnavailable",
                    "Deployment does not have minimum availability.",
                )
            };
            DeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: status.clone(),
                    reason: Some(reason.to_string()),
                    message: Some(message.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }
        });
        deployment
    }

    fn store(&mut self, mut deployment: Deployment) -> Deployment {
        self.resource_version += 1;
        deployment.metadata.resource_version = Some(self.resource_version.to_string());
        deployment.status = None;
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.deployments.insert(name, deployment.clone());
        self.observed(deployment)
    }
}

/// In-memory Deployments
#[derive(Default)]
pub struct FakeWorkloads {
    state: Mutex<WorkloadState>,
}

impl FakeWorkloads {
    /// Status of the Available condition on every returned Deployment
    pub fn set_available(&self, status: &str) {
        self.state.lock().available = Some(status.to_string());
    }

    pub fn set_diagnostics(&self, diagnostics: Vec<String>) {
        self.state.lock().diagnostics = diagnostics;
    }

    pub fn fail_list(&self, message: &str) {
        self.state.lock().list_error = Some(message.to_string());
    }

    pub fn fail_create(&self, message: &str) {
        self.state.lock().create_error = Some(message.to_string());
    }

    pub fn fail_update(&self, message: &str) {
        self.state.lock().update_error = Some(message.to_string());
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().calls
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().deployments.keys().cloned().collect()
    }

    /// The single stored Deployment
    pub fn only(&self) -> Option<Deployment> {
        let state = self.state.lock();
        (state.deployments.len() == 1)
            .then(|| state.deployments.values().next().cloned())
            .flatten()
    }
}

#[async_trait]
impl WorkloadAdmin for FakeWorkloads {
    async fn list_workloads(&self, _namespace: &str, _selector: &str) -> Result<Vec<Deployment>> {
        let state = self.state.lock();
        if let Some(e) = &state.list_error {
            return Err(kube_error(e));
        }
        Ok(state
            .deployments
            .values()
            .cloned()
            .map(|d| state.observed(d))
            .collect())
    }

    async fn create_workload(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let mut state = self.state.lock();
        if let Some(e) = &state.create_error {
            return Err(kube_error(e));
        }
        state.calls.creates += 1;
        Ok(state.store(deployment.clone()))
    }

    async fn update_workload(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let mut state = self.state.lock();
        if let Some(e) = &state.update_error {
            return Err(kube_error(e));
        }
        state.calls.updates += 1;
        Ok(state.store(deployment.clone()))
    }

    async fn delete_workload(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.deletes += 1;
        state.deployments.remove(name);
        Ok(())
    }

    async fn diagnostics(&self, _namespace: &str, _selector: &str) -> Result<Vec<String>> {
        Ok(self.state.lock().diagnostics.clone())
    }
}

#[derive(Default)]
struct BindingState {
    bindings: HashMap<String, DynamicObject>,
    calls: Calls,
    apply_error: Option<String>,
}

/// In-memory ScaledObjects
#[derive(Default)]
pub struct FakeBindings {
    state: Mutex<BindingState>,
}

impl FakeBindings {
    pub fn calls(&self) -> Calls {
        self.state.lock().calls
    }

    pub fn fail_apply(&self, message: &str) {
        self.state.lock().apply_error = Some(message.to_string());
    }
}

#[async_trait]
impl BindingAdmin for FakeBindings {
    async fn get_binding(&self, _namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.state.lock().bindings.get(name).cloned())
    }

    async fn create_or_update_binding(
        &self,
        _namespace: &str,
        binding: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        state.calls.applies += 1;
        if let Some(e) = &state.apply_error {
            return Err(kube_error(e));
        }
        let name = binding.metadata.name.clone().unwrap_or_default();
        state.bindings.insert(name, binding.clone());
        Ok(binding.clone())
    }

    async fn delete_binding(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.bindings.remove(name).is_some() {
            state.calls.deletes += 1;
        }
        Ok(())
    }
}
