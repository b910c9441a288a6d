//! Google Cloud Pub/Sub admin client
//!
//! The reconciler talks to Pub/Sub through the [`MessagingAdmin`] and
//! [`MessagingClient`] traits. [`RestMessagingAdmin`] implements them on top of
//! the Pub/Sub REST v1 API, authenticating with the GCE metadata server or
//! talking to an emulator without credentials.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default Pub/Sub REST endpoint
pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Default per-call timeout for Pub/Sub admin operations
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata server token endpoint for the default service account
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Error bodies are cut to this length before landing in conditions
const MAX_ERROR_BODY_BYTES: usize = 1024;

/// Fields the operator manages on a subscription
const UPDATE_MASK: &str = "ackDeadlineSeconds,retainAckedMessages,messageRetentionDuration";

/// Desired subscription parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub topic: String,
    pub ack_deadline: Duration,
    pub retention_duration: Duration,
    pub retain_acked_messages: bool,
    pub labels: BTreeMap<String, String>,
}

/// A subscription as it exists in Pub/Sub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub topic: String,
    pub ack_deadline: Duration,
    pub retention_duration: Duration,
    pub retain_acked_messages: bool,
}

impl SubscriptionInfo {
    /// Whether the managed delivery parameters equal the desired ones.
    /// Pub/Sub keeps both durations at second precision.
    pub fn matches(&self, desired: &SubscriptionConfig) -> bool {
        self.ack_deadline.as_secs() == desired.ack_deadline.as_secs()
            && self.retention_duration.as_secs() == desired.retention_duration.as_secs()
            && self.retain_acked_messages == desired.retain_acked_messages
    }
}

/// Drop the sub-second part Pub/Sub does not store
pub fn whole_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}

/// Creates project-scoped Pub/Sub clients
#[async_trait]
pub trait MessagingAdmin: Send + Sync {
    async fn create_client(&self, project_id: &str) -> Result<Arc<dyn MessagingClient>>;
}

/// Project-scoped Pub/Sub admin operations
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn topic_exists(&self, topic_id: &str) -> Result<bool>;

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<SubscriptionInfo>>;

    async fn create_subscription(
        &self,
        subscription_id: &str,
        config: &SubscriptionConfig,
    ) -> Result<SubscriptionInfo>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        config: &SubscriptionConfig,
    ) -> Result<SubscriptionInfo>;

    /// Delete a subscription. Deleting one that does not exist succeeds.
    async fn delete_subscription(&self, subscription_id: &str) -> Result<()>;
}

/// Configuration for the REST admin
#[derive(Debug, Clone)]
pub struct PubSubAdminConfig {
    /// Base URL of the Pub/Sub API
    pub endpoint: String,
    /// Per-call timeout
    pub operation_timeout: Duration,
    /// Skip authentication (emulator)
    pub emulator: bool,
}

impl Default for PubSubAdminConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            emulator: false,
        }
    }
}

impl PubSubAdminConfig {
    /// Honor `PUBSUB_EMULATOR_HOST` the way the Google client libraries do
    pub fn from_env(endpoint: Option<String>) -> Self {
        match std::env::var("PUBSUB_EMULATOR_HOST") {
            Ok(host) if !host.is_empty() => Self {
                endpoint: format!("http://{}", host.trim_start_matches("http://")),
                emulator: true,
                ..Default::default()
            },
            _ => Self {
                endpoint: endpoint.unwrap_or_else(|| DEFAULT_PUBSUB_ENDPOINT.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Pub/Sub REST v1 admin
pub struct RestMessagingAdmin {
    config: PubSubAdminConfig,
    http: reqwest::Client,
}

impl RestMessagingAdmin {
    pub fn new(config: PubSubAdminConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.operation_timeout)
            .build()
            .map_err(|e| OperatorError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        info!(endpoint = %config.endpoint, emulator = config.emulator, "Pub/Sub admin initialized");

        Ok(Self { config, http })
    }

    async fn access_token(&self) -> Result<Option<String>> {
        if self.config.emulator {
            return Ok(None);
        }

        let resp = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| OperatorError::ClientCreate(format!("metadata server: {e}")))?;

        if !resp.status().is_success() {
            return Err(OperatorError::ClientCreate(format!(
                "metadata server returned {}",
                resp.status()
            )));
        }

        let token: AccessToken = resp
            .json()
            .await
            .map_err(|e| OperatorError::ClientCreate(format!("invalid token response: {e}")))?;

        Ok(Some(token.access_token))
    }
}

#[async_trait]
impl MessagingAdmin for RestMessagingAdmin {
    async fn create_client(&self, project_id: &str) -> Result<Arc<dyn MessagingClient>> {
        if project_id.is_empty() {
            return Err(OperatorError::ClientCreate("project id is empty".to_string()));
        }

        let token = self.access_token().await?;
        debug!(project = %project_id, "Created Pub/Sub client");

        Ok(Arc::new(RestMessagingClient {
            http: self.http.clone(),
            base_url: format!(
                "{}/v1/projects/{}",
                self.config.endpoint.trim_end_matches('/'),
                project_id
            ),
            project_id: project_id.to_string(),
            token,
        }))
    }
}

/// Project-scoped REST client
struct RestMessagingClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    token: Option<String>,
}

impl std::fmt::Debug for RestMessagingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestMessagingClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl RestMessagingClient {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, op: &str) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| OperatorError::Messaging(format!("{op}: {e}")))
    }

    fn topic_path(&self, topic_id: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, topic_id)
    }

    fn wire(&self, config: &SubscriptionConfig) -> WireSubscription {
        WireSubscription::from_config(self.topic_path(&config.topic), config)
    }

    async fn decode(resp: reqwest::Response, op: &str) -> Result<SubscriptionInfo> {
        let wire: WireSubscription = resp
            .json()
            .await
            .map_err(|e| OperatorError::Messaging(format!("{op}: invalid response: {e}")))?;
        Ok(wire.into_info())
    }
}

#[async_trait]
impl MessagingClient for RestMessagingClient {
    async fn topic_exists(&self, topic_id: &str) -> Result<bool> {
        let op = "get topic";
        let resp = self
            .send(self.request(reqwest::Method::GET, &format!("topics/{topic_id}")), op)
            .await?;
        match resp.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            _ => Err(error_from_response(resp, op).await),
        }
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<SubscriptionInfo>> {
        let op = "get subscription";
        let resp = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!("subscriptions/{subscription_id}"),
                ),
                op,
            )
            .await?;
        match resp.status().as_u16() {
            200..=299 => Self::decode(resp, op).await.map(Some),
            404 => Ok(None),
            _ => Err(error_from_response(resp, op).await),
        }
    }

    async fn create_subscription(
        &self,
        subscription_id: &str,
        config: &SubscriptionConfig,
    ) -> Result<SubscriptionInfo> {
        let op = "create subscription";
        let resp = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    &format!("subscriptions/{subscription_id}"),
                )
                .json(&self.wire(config)),
                op,
            )
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp, op).await);
        }
        info!(subscription = %subscription_id, topic = %config.topic, "Created Pub/Sub subscription");
        Self::decode(resp, op).await
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        config: &SubscriptionConfig,
    ) -> Result<SubscriptionInfo> {
        let op = "update subscription";
        let body = UpdateSubscriptionRequest {
            subscription: self.wire(config),
            update_mask: UPDATE_MASK.to_string(),
        };
        let resp = self
            .send(
                self.request(
                    reqwest::Method::PATCH,
                    &format!("subscriptions/{subscription_id}"),
                )
                .json(&body),
                op,
            )
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp, op).await);
        }
        info!(subscription = %subscription_id, "Updated Pub/Sub subscription");
        Self::decode(resp, op).await
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<()> {
        let op = "delete subscription";
        let resp = self
            .send(
                self.request(
                    reqwest::Method::DELETE,
                    &format!("subscriptions/{subscription_id}"),
                ),
                op,
            )
            .await?;
        match resp.status().as_u16() {
            200..=299 => {
                info!(subscription = %subscription_id, "Deleted Pub/Sub subscription");
                Ok(())
            }
            404 => {
                warn!(subscription = %subscription_id, "Subscription already gone");
                Ok(())
            }
            _ => Err(error_from_response(resp, op).await),
        }
    }
}

async fn error_from_response(resp: reqwest::Response, op: &str) -> OperatorError {
    let status = resp.status();
    let body = match resp.bytes().await {
        Ok(b) => {
            let end = b.len().min(MAX_ERROR_BODY_BYTES);
            String::from_utf8_lossy(&b[..end]).to_string()
        }
        Err(_) => String::new(),
    };
    let message = serde_json::from_str::<WireErrorResponse>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);
    OperatorError::Messaging(format!("{op} failed ({status}): {message}"))
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Deserialize)]
struct WireErrorResponse {
    error: WireError,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSubscription {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    topic: String,
    #[serde(default)]
    ack_deadline_seconds: i64,
    #[serde(default)]
    retain_acked_messages: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_retention_duration: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

impl WireSubscription {
    fn from_config(topic: String, config: &SubscriptionConfig) -> Self {
        Self {
            name: String::new(),
            topic,
            ack_deadline_seconds: config.ack_deadline.as_secs() as i64,
            retain_acked_messages: config.retain_acked_messages,
            message_retention_duration: Some(format_wire_duration(config.retention_duration)),
            labels: config.labels.clone(),
        }
    }

    fn into_info(self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.name.rsplit('/').next().unwrap_or_default().to_string(),
            topic: self.topic.rsplit('/').next().unwrap_or_default().to_string(),
            ack_deadline: Duration::from_secs(self.ack_deadline_seconds.max(0) as u64),
            retention_duration: self
                .message_retention_duration
                .as_deref()
                .and_then(parse_wire_duration)
                .unwrap_or_default(),
            retain_acked_messages: self.retain_acked_messages,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSubscriptionRequest {
    subscription: WireSubscription,
    update_mask: String,
}

/// Protobuf JSON duration, e.g. `604800s` or `1.5s`
fn parse_wire_duration(value: &str) -> Option<Duration> {
    let secs: f64 = value.strip_suffix('s')?.parse().ok()?;
    (secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

fn format_wire_duration(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}
