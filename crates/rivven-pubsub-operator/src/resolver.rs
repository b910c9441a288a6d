//! Desired-state resolution
//!
//! Turns a spec into a [`DesiredConfig`]: durations with defaults applied,
//! the project to use, and the sink/transformer addresses.

use crate::capabilities::{SinkResolvable, SubscriptionOwner};
use crate::conditions::ConditionType;
use crate::crd::{AutoscalingConfig, Destination, KReference, RivvenPullSubscription};
use crate::error::{OperatorError, Result};
use crate::events::{Notice, REASON_INVALID_SINK, REASON_INVALID_TRANSFORMER};
use crate::pubsub_client::{whole_seconds, SubscriptionConfig};
use crate::reconciler::PassContext;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery::pinned_kind;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Why a destination could not be turned into an address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotReady(String),
}

impl From<ResolveError> for OperatorError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound(msg) => OperatorError::ReferenceNotFound(msg),
            ResolveError::NotReady(msg) => OperatorError::ReferenceNotReady(msg),
        }
    }
}

/// Resolves destinations to URLs
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(
        &self,
        namespace: &str,
        destination: &Destination,
    ) -> std::result::Result<Url, ResolveError>;
}

/// Resolver backed by the Kubernetes API
///
/// `v1/Service` maps to its cluster-local DNS name; any other kind must
/// publish `status.address.url`.
pub struct KubeAddressResolver {
    client: Client,
}

impl KubeAddressResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn resolve_reference(
        &self,
        namespace: &str,
        reference: &KReference,
    ) -> std::result::Result<Url, ResolveError> {
        let namespace = reference.namespace.as_deref().unwrap_or(namespace);

        if reference.kind == "Service" && reference.api_version == "v1" {
            let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
            return match api.get_opt(&reference.name).await {
                Ok(Some(_)) => service_url(&reference.name, namespace),
                Ok(None) => Err(ResolveError::NotFound(format!(
                    "services \"{}\" not found",
                    reference.name
                ))),
                Err(e) => Err(ResolveError::NotReady(e.to_string())),
            };
        }

        let (group, version) = match reference.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", reference.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        let (resource, _caps) = pinned_kind(&self.client, &gvk).await.map_err(|e| {
            ResolveError::NotFound(format!(
                "failed to find kind {} in {}: {e}",
                reference.kind, reference.api_version
            ))
        })?;

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        match api.get_opt(&reference.name).await {
            Ok(Some(obj)) => addressable_url(&obj, &reference.kind),
            Ok(None) => Err(ResolveError::NotFound(format!(
                "{}.{} \"{}\" not found",
                resource.plural, group, reference.name
            ))),
            Err(e) => Err(ResolveError::NotReady(e.to_string())),
        }
    }
}

#[async_trait]
impl AddressResolver for KubeAddressResolver {
    async fn resolve(
        &self,
        namespace: &str,
        destination: &Destination,
    ) -> std::result::Result<Url, ResolveError> {
        match (&destination.reference, &destination.uri) {
            (Some(reference), uri) => {
                let base = self.resolve_reference(namespace, reference).await?;
                match uri {
                    Some(relative) => base.join(relative).map_err(|e| {
                        ResolveError::NotFound(format!("invalid uri {relative:?}: {e}"))
                    }),
                    None => Ok(base),
                }
            }
            (None, Some(uri)) => parse_absolute(uri),
            (None, None) => Err(ResolveError::NotFound(
                "destination has neither ref nor uri".to_string(),
            )),
        }
    }
}

fn service_url(name: &str, namespace: &str) -> std::result::Result<Url, ResolveError> {
    parse_absolute(&format!("http://{name}.{namespace}.svc.cluster.local/"))
}

fn parse_absolute(uri: &str) -> std::result::Result<Url, ResolveError> {
    Url::parse(uri).map_err(|e| ResolveError::NotFound(format!("invalid uri {uri:?}: {e}")))
}

/// Read `status.address.url` from an addressable object
fn addressable_url(obj: &DynamicObject, kind: &str) -> std::result::Result<Url, ResolveError> {
    let url = obj
        .data
        .get("status")
        .and_then(|s| s.get("address"))
        .and_then(|a| a.get("url"))
        .and_then(|u| u.as_str())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            ResolveError::NotReady(format!(
                "{kind} \"{}\" does not have an address yet",
                obj.name_any()
            ))
        })?;
    parse_absolute(url)
}

/// Canonical desired state for one pass
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredConfig {
    pub project_id: String,
    /// Deterministic id used when status records none
    pub derived_subscription_id: String,
    pub subscription: SubscriptionConfig,
    pub sink_uri: Url,
    pub transformer_uri: Option<Url>,
    pub autoscaling: AutoscalingConfig,
    pub adapter_image: String,
    pub ce_extensions: BTreeMap<String, String>,
}

/// Resolves the desired state of a pull subscription
pub struct DesiredStateResolver<'a> {
    resolver: &'a dyn AddressResolver,
    default_project: Option<&'a str>,
    adapter_image: &'a str,
}

impl<'a> DesiredStateResolver<'a> {
    pub fn new(
        resolver: &'a dyn AddressResolver,
        default_project: Option<&'a str>,
        adapter_image: &'a str,
    ) -> Self {
        Self {
            resolver,
            default_project,
            adapter_image,
        }
    }

    /// Resolve addresses and canonical parameters.
    ///
    /// Sets SinkResolved and TransformerResolved, records the resolved
    /// addresses and project in status, and short-circuits on failure.
    pub async fn resolve(
        &self,
        ps: &RivvenPullSubscription,
        pass: &mut PassContext,
    ) -> Result<DesiredConfig> {
        let namespace = ps.sink_namespace();

        let sink = match self.resolver.resolve(&namespace, ps.sink()).await {
            Ok(url) => url,
            Err(e) => {
                debug!(error = %e, "Sink did not resolve");
                pass.status.sink_uri = None;
                pass.conditions()
                    .mark_false(ConditionType::SinkResolved, REASON_INVALID_SINK, e.to_string());
                pass.notices
                    .push(Notice::warning(REASON_INVALID_SINK, format!("InvalidSink: {e}")));
                return Err(e.into());
            }
        };
        pass.status.sink_uri = Some(sink.to_string());
        pass.conditions().mark_true(ConditionType::SinkResolved);

        let transformer = match ps.transformer() {
            None => {
                pass.status.transformer_uri = None;
                pass.conditions().mark_true_with_reason(
                    ConditionType::TransformerResolved,
                    "TransformerNil",
                    "Transformer is nil",
                );
                None
            }
            Some(destination) => match self.resolver.resolve(&namespace, destination).await {
                Ok(url) => {
                    pass.status.transformer_uri = Some(url.to_string());
                    pass.conditions().mark_true(ConditionType::TransformerResolved);
                    Some(url)
                }
                Err(e) => {
                    pass.status.transformer_uri = None;
                    pass.conditions().mark_false(
                        ConditionType::TransformerResolved,
                        REASON_INVALID_TRANSFORMER,
                        e.to_string(),
                    );
                    pass.notices.push(Notice::warning(
                        REASON_INVALID_TRANSFORMER,
                        format!("InvalidTransformer: {e}"),
                    ));
                    return Err(e.into());
                }
            },
        };

        let project_id = ps
            .requested_project()
            .or(ps.recorded_project())
            .or(self.default_project)
            .map(str::to_string)
            .ok_or_else(|| {
                OperatorError::InvalidConfig(
                    "no project set on the resource and no default project configured"
                        .to_string(),
                )
            })?;
        pass.status.project_id = project_id.clone();

        let subscription = SubscriptionConfig {
            topic: ps.topic_id().to_string(),
            ack_deadline: whole_seconds(ps.ack_deadline()),
            retention_duration: whole_seconds(ps.retention_duration()),
            retain_acked_messages: ps.retain_acked_messages(),
            labels: subscription_labels(ps),
        };
        if !ps.spec.retention_in_bounds() {
            warn!(
                retention = ?subscription.retention_duration,
                "Retention duration outside the 10m-7d range, passing it through"
            );
        }

        Ok(DesiredConfig {
            project_id,
            derived_subscription_id: ps.derived_subscription_id(),
            subscription,
            sink_uri: sink,
            transformer_uri: transformer,
            autoscaling: ps.autoscaling(),
            adapter_image: self.adapter_image.to_string(),
            ce_extensions: ps
                .spec
                .ce_overrides
                .as_ref()
                .map(|o| o.extensions.clone())
                .unwrap_or_default(),
        })
    }
}

/// Labels attached to the Pub/Sub subscription
fn subscription_labels(ps: &RivvenPullSubscription) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("managed-by".to_string(), "rivven-operator".to_string()),
        ("source-name".to_string(), pubsub_label(&ps.owner_name())),
        (
            "resource-namespace".to_string(),
            pubsub_label(&ps.owner_namespace()),
        ),
    ])
}

/// Pub/Sub label values allow lowercase letters, digits, `-` and `_` up to 63 chars
fn pubsub_label(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .take(63)
        .collect()
}
