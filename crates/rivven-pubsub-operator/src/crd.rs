//! Custom Resource Definitions for the Rivven Pub/Sub operator
//!
//! This module defines the `RivvenPullSubscription` CRD that binds a Google
//! Cloud Pub/Sub topic to an in-cluster event sink through a receive adapter.

use crate::conditions::Condition;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// API group shared by every rivven resource
pub const API_GROUP: &str = "rivven.hupe1980.github.io";

/// Autoscaling annotation keys
pub const AUTOSCALING_CLASS_ANNOTATION: &str = "autoscaling.rivven.hupe1980.github.io/class";
pub const AUTOSCALING_MIN_SCALE_ANNOTATION: &str =
    "autoscaling.rivven.hupe1980.github.io/minScale";
pub const AUTOSCALING_MAX_SCALE_ANNOTATION: &str =
    "autoscaling.rivven.hupe1980.github.io/maxScale";
pub const AUTOSCALING_QUEUE_DEPTH_ANNOTATION: &str =
    "autoscaling.rivven.hupe1980.github.io/queueDepth";
pub const AUTOSCALING_COOLDOWN_ANNOTATION: &str =
    "autoscaling.rivven.hupe1980.github.io/cooldownPeriod";
pub const AUTOSCALING_POLLING_ANNOTATION: &str =
    "autoscaling.rivven.hupe1980.github.io/pollingInterval";

pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_RETENTION_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MIN_RETENTION_DURATION: Duration = Duration::from_secs(10 * 60);
pub const MAX_RETENTION_DURATION: Duration = DEFAULT_RETENTION_DURATION;

const DEFAULT_MIN_SCALE: i32 = 0;
const DEFAULT_MAX_SCALE: i32 = 1;
const DEFAULT_QUEUE_DEPTH: i64 = 100;
const DEFAULT_COOLDOWN_PERIOD: i32 = 120;
const DEFAULT_POLLING_INTERVAL: i32 = 15;

/// Regex for Google Cloud project ids
static PROJECT_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{4,28}[a-z0-9]$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-.a-z0-9]*[a-z0-9])?$").unwrap());

fn validate_project_id(value: &str) -> Result<(), ValidationError> {
    if PROJECT_ID_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_project")
            .with_message(format!("'{}' is not a valid Google Cloud project id", value).into()))
    }
}

fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 253 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 253 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// A destination must name an object, a URI, or both
fn validate_destination(destination: &Destination) -> Result<(), ValidationError> {
    if destination.reference.is_none() && destination.uri.is_none() {
        return Err(ValidationError::new("empty_destination")
            .with_message("destination needs a ref or a uri".into()));
    }
    Ok(())
}

/// RivvenPullSubscription custom resource definition
///
/// Pulls messages from a Pub/Sub topic through an operator-managed
/// subscription and forwards them as CloudEvents to a sink.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "rivven.hupe1980.github.io",
    version = "v1alpha1",
    kind = "RivvenPullSubscription",
    plural = "rivvenpullsubscriptions",
    shortname = "rps",
    namespaced,
    status = "RivvenPullSubscriptionStatus",
    printcolumn = r#"{"name":"Topic", "type":"string", "jsonPath":".spec.topic"}"#,
    printcolumn = r#"{"name":"Subscription", "type":"string", "jsonPath":".status.subscriptionId"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RivvenPullSubscriptionSpec {
    /// Pub/Sub topic id to pull from
    #[validate(length(min = 1, max = 255, message = "topic must be 1-255 characters"))]
    pub topic: String,

    /// Google Cloud project (falls back to the operator default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_project_id"))]
    pub project: Option<String>,

    /// How long Pub/Sub waits for an ack before redelivering (default 30s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_deadline: Option<String>,

    /// Keep acknowledged messages for the retention window
    #[serde(default)]
    pub retain_acked_messages: bool,

    /// How long unacknowledged messages are kept (default 7d, 10m-7d)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_duration: Option<String>,

    /// Secret holding the service account key
    #[serde(default)]
    #[validate(nested)]
    pub secret: SecretKeyReference,

    /// Where events are delivered
    #[validate(nested)]
    pub sink: Destination,

    /// Optional hop that transforms events before the sink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub transformer: Option<Destination>,

    /// CloudEvent attributes added to every delivered event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ce_overrides: Option<CloudEventOverrides>,
}

/// Reference to a key in a Secret
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    #[serde(default = "default_secret_name")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,

    #[serde(default = "default_secret_key")]
    #[validate(length(min = 1, max = 253, message = "key must be 1-253 characters"))]
    pub key: String,
}

fn default_secret_name() -> String {
    "google-cloud-key".to_string()
}

fn default_secret_key() -> String {
    "key.json".to_string()
}

impl Default for SecretKeyReference {
    fn default() -> Self {
        Self {
            name: default_secret_name(),
            key: default_secret_key(),
        }
    }
}

/// An addressable object reference, an absolute URI, or a URI relative to the object
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_destination"))]
pub struct Destination {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub reference: Option<KReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Reference to an object by kind and name
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KReference {
    pub api_version: String,

    #[validate(length(min = 1, message = "kind must not be empty"))]
    pub kind: String,

    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,

    /// Defaults to the namespace of the referencing object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// CloudEvent overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudEventOverrides {
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
}

/// Status of a RivvenPullSubscription
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RivvenPullSubscriptionStatus {
    /// Generation of the spec this status describes
    #[serde(default)]
    pub observed_generation: i64,

    /// Pub/Sub subscription id, empty until created
    #[serde(default)]
    pub subscription_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer_uri: Option<String>,

    /// Project the subscription lives in
    #[serde(default)]
    pub project_id: String,

    #[serde(default)]
    pub phase: ReconcilePhase,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Phase of the reconcile state machine
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReconcilePhase {
    #[default]
    Initializing,
    Resolving,
    ReconcilingMessaging,
    ReconcilingDataPlane,
    Ready,
    /// A step failed; the object stays in the retry loop
    Degraded,
    Deleting,
    Finalized,
}

impl RivvenPullSubscriptionSpec {
    /// Ack deadline, falling back to 30s when absent or unparseable
    pub fn ack_deadline(&self) -> Duration {
        self.ack_deadline
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_ACK_DEADLINE)
    }

    /// Retention duration, falling back to 7d when absent or unparseable
    pub fn retention_duration(&self) -> Duration {
        self.retention_duration
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_RETENTION_DURATION)
    }

    /// Whether the effective retention lies within the Pub/Sub bounds
    pub fn retention_in_bounds(&self) -> bool {
        let retention = self.retention_duration();
        (MIN_RETENTION_DURATION..=MAX_RETENTION_DURATION).contains(&retention)
    }
}

/// Parse a duration string such as `30s`, `10m` or `1h30m`
pub fn parse_duration(value: &str) -> Option<Duration> {
    humantime::parse_duration(value.trim()).ok()
}

/// Scaling class selected by annotation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScalingClass {
    /// Fixed replica count
    #[default]
    Static,
    /// Replicas driven by subscription backlog
    Elastic,
}

/// Autoscaling settings read from annotations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoscalingConfig {
    pub class: ScalingClass,
    pub min_scale: i32,
    pub max_scale: i32,
    /// Target undelivered messages per replica
    pub queue_depth: i64,
    pub cooldown_period: i32,
    pub polling_interval: i32,
}

impl Default for AutoscalingConfig {
    fn default() -> Self {
        Self {
            class: ScalingClass::Static,
            min_scale: DEFAULT_MIN_SCALE,
            max_scale: DEFAULT_MAX_SCALE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            cooldown_period: DEFAULT_COOLDOWN_PERIOD,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }
}

impl AutoscalingConfig {
    /// Parse annotations; unknown classes and bad numbers use defaults
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        fn number<T: std::str::FromStr + PartialOrd + Default>(
            annotations: &BTreeMap<String, String>,
            key: &str,
            default: T,
        ) -> T {
            annotations
                .get(key)
                .and_then(|v| v.trim().parse::<T>().ok())
                .filter(|v| *v >= T::default())
                .unwrap_or(default)
        }

        let class = match annotations.get(AUTOSCALING_CLASS_ANNOTATION).map(|s| s.trim()) {
            Some(c) if c.eq_ignore_ascii_case("elastic") || c.eq_ignore_ascii_case("keda") => {
                ScalingClass::Elastic
            }
            _ => ScalingClass::Static,
        };

        let min_scale = number(annotations, AUTOSCALING_MIN_SCALE_ANNOTATION, DEFAULT_MIN_SCALE);
        let max_scale = number(annotations, AUTOSCALING_MAX_SCALE_ANNOTATION, DEFAULT_MAX_SCALE)
            .max(min_scale);

        Self {
            class,
            min_scale,
            max_scale,
            queue_depth: number(
                annotations,
                AUTOSCALING_QUEUE_DEPTH_ANNOTATION,
                DEFAULT_QUEUE_DEPTH,
            )
            .max(1),
            cooldown_period: number(
                annotations,
                AUTOSCALING_COOLDOWN_ANNOTATION,
                DEFAULT_COOLDOWN_PERIOD,
            ),
            polling_interval: number(
                annotations,
                AUTOSCALING_POLLING_ANNOTATION,
                DEFAULT_POLLING_INTERVAL,
            )
            .max(1),
        }
    }

    pub fn is_elastic(&self) -> bool {
        self.class == ScalingClass::Elastic
    }

    /// Replica count for the static class
    pub fn static_replicas(&self) -> i32 {
        self.min_scale.max(1)
    }
}

impl RivvenPullSubscription {
    pub fn autoscaling(&self) -> AutoscalingConfig {
        self.metadata
            .annotations
            .as_ref()
            .map(AutoscalingConfig::from_annotations)
            .unwrap_or_default()
    }
}
