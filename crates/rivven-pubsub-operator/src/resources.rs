//! Kubernetes resource builders for the receive adapter
//!
//! Builds the adapter Deployment and, for the elastic scaling class, the
//! KEDA ScaledObject that drives its replica count.

use crate::crd::{RivvenPullSubscription, RivvenPullSubscriptionSpec, API_GROUP};
use crate::error::{OperatorError, Result};
use crate::naming;
use crate::resolver::DesiredConfig;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    SeccompProfile, SecretKeySelector, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;

pub const ADAPTER_CONTAINER_NAME: &str = "receive-adapter";

const APP_NAME: &str = "rivven-pubsub-adapter";
const CREDENTIALS_VOLUME: &str = "google-cloud-key";
const CREDENTIALS_MOUNT_PATH: &str = "/var/secrets/google";
const CREDENTIALS_JSON_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS_JSON";

/// KEDA ScaledObject resource
pub fn scaled_object_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("keda.sh", "v1alpha1", "ScaledObject"))
}

/// Builds receive adapter resources for one pull subscription
pub struct ReceiveAdapterBuilder<'a> {
    ps: &'a RivvenPullSubscription,
    desired: &'a DesiredConfig,
    subscription_id: &'a str,
    name: String,
    namespace: String,
}

impl<'a> ReceiveAdapterBuilder<'a> {
    pub fn new(
        ps: &'a RivvenPullSubscription,
        desired: &'a DesiredConfig,
        subscription_id: &'a str,
    ) -> Self {
        Self {
            ps,
            desired,
            subscription_id,
            name: naming::workload_name(&ps.name_any(), subscription_id),
            namespace: ps.namespace().unwrap_or_else(|| "default".to_string()),
        }
    }

    /// Deterministic workload name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Immutable selector labels
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
            (
                "app.kubernetes.io/instance".to_string(),
                naming::instance_label(&self.ps.name_any()),
            ),
        ])
    }

    /// Label selector string for list calls
    pub fn selector(&self) -> String {
        self.selector_labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            ADAPTER_CONTAINER_NAME.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "rivven-operator".to_string(),
        );
        labels
    }

    /// Whether a Deployment is controlled by this pull subscription
    pub fn is_owned(&self, deployment: &Deployment) -> bool {
        let Some(uid) = self.ps.uid() else {
            return false;
        };
        deployment
            .metadata
            .owner_references
            .iter()
            .flatten()
            .any(|o| o.controller == Some(true) && o.uid == uid)
    }

    fn owner_reference(&self) -> Result<OwnerReference> {
        self.ps.controller_owner_ref(&()).ok_or_else(|| {
            OperatorError::InvalidConfig("pull subscription has no uid".to_string())
        })
    }

    fn env(&self) -> Result<Vec<EnvVar>> {
        let spec: &RivvenPullSubscriptionSpec = &self.ps.spec;
        let plain = |name: &str, value: String| EnvVar {
            name: name.to_string(),
            value: Some(value),
            value_from: None,
        };

        let mut env = vec![
            plain("PROJECT_ID", self.desired.project_id.clone()),
            plain("PUBSUB_TOPIC_ID", self.desired.subscription.topic.clone()),
            plain("PUBSUB_SUBSCRIPTION_ID", self.subscription_id.to_string()),
            plain("SINK_URI", self.desired.sink_uri.to_string()),
        ];
        if let Some(transformer) = &self.desired.transformer_uri {
            env.push(plain("TRANSFORMER_URI", transformer.to_string()));
        }
        env.push(plain("NAME", self.ps.name_any()));
        env.push(plain("NAMESPACE", self.namespace.clone()));
        env.push(plain(
            "RESOURCE_GROUP",
            format!("rivvenpullsubscriptions.{API_GROUP}"),
        ));
        if !self.desired.ce_extensions.is_empty() {
            env.push(plain(
                "CE_EXTENSIONS",
                serde_json::to_string(&self.desired.ce_extensions)?,
            ));
        }
        env.push(plain(
            "GOOGLE_APPLICATION_CREDENTIALS",
            format!("{CREDENTIALS_MOUNT_PATH}/{}", spec.secret.key),
        ));
        env.push(EnvVar {
            name: CREDENTIALS_JSON_ENV.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: spec.secret.name.clone(),
                    key: spec.secret.key.clone(),
                    optional: Some(true),
                }),
                ..Default::default()
            }),
        });
        Ok(env)
    }

    /// Build the receive adapter Deployment
    pub fn build_deployment(&self) -> Result<Deployment> {
        let labels = self.labels();
        let autoscaling = &self.desired.autoscaling;

        let container = Container {
            name: ADAPTER_CONTAINER_NAME.to_string(),
            image: Some(self.desired.adapter_image.clone()),
            env: Some(self.env()?),
            volume_mounts: Some(vec![VolumeMount {
                name: CREDENTIALS_VOLUME.to_string(),
                mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                read_only_root_filesystem: Some(true),
                run_as_non_root: Some(true),
                run_as_user: Some(1000),
                run_as_group: Some(1000),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: CREDENTIALS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.ps.spec.secret.name.clone()),
                    optional: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                fs_group: Some(1000),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            automount_service_account_token: Some(false),
            ..Default::default()
        };

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![self.owner_reference()?]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: if autoscaling.is_elastic() {
                    None
                } else {
                    Some(autoscaling.static_replicas())
                },
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Build the KEDA ScaledObject targeting the adapter Deployment
    pub fn build_scaled_object(&self) -> Result<DynamicObject> {
        let mut binding = DynamicObject::new(&self.name, &scaled_object_resource())
            .within(&self.namespace)
            .data(json!({ "spec": self.scaled_object_spec() }));
        binding.metadata.labels = Some(self.labels());
        binding.metadata.owner_references = Some(vec![self.owner_reference()?]);
        Ok(binding)
    }

    /// Desired `spec` of the ScaledObject
    pub fn scaled_object_spec(&self) -> serde_json::Value {
        let autoscaling = &self.desired.autoscaling;
        json!({
            "scaleTargetRef": { "name": self.name },
            "minReplicaCount": autoscaling.min_scale,
            "maxReplicaCount": autoscaling.max_scale,
            "cooldownPeriod": autoscaling.cooldown_period,
            "pollingInterval": autoscaling.polling_interval,
            "triggers": [{
                "type": "gcp-pubsub",
                "metadata": {
                    "subscriptionName": self.subscription_id,
                    "subscriptionSize": autoscaling.queue_depth.to_string(),
                    "credentialsFromEnv": CREDENTIALS_JSON_ENV,
                }
            }]
        })
    }
}
