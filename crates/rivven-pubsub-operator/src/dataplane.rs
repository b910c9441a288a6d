//! Data-plane reconciliation
//!
//! Keeps exactly one receive adapter Deployment in line with the desired
//! configuration, applies the autoscaler binding for the elastic class, and
//! reflects adapter health into the `Deployed` condition.

use crate::conditions::ConditionType;
use crate::crd::RivvenPullSubscription;
use crate::error::{OperatorError, Result};
use crate::events::{Notice, REASON_DATA_PLANE_FAILED};
use crate::reconciler::PassContext;
use crate::resolver::DesiredConfig;
use crate::resources::{ReceiveAdapterBuilder, ADAPTER_CONTAINER_NAME};
use crate::workload::{BindingAdmin, WorkloadAdmin};
use k8s_openapi::api::apps::v1::Deployment;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, info, instrument, warn};

/// Diagnostics that mean the adapter is still proving its credentials
static AUTH_FAILURE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(checking authentication|couldn't find key \S+ in secret|secrets? "[^"]+" not found|permission[_ ]?denied|unauthenticated|could not find default credentials|invalid_grant)"#,
    )
    .unwrap()
});

/// First diagnostic message that looks like an authentication problem
pub fn find_auth_failure(diagnostics: &[String]) -> Option<&str> {
    diagnostics
        .iter()
        .map(String::as_str)
        .find(|m| AUTH_FAILURE_REGEX.is_match(m))
}

/// Reconciles the receive adapter and its autoscaler binding
pub struct DataPlaneReconciler<'a> {
    workloads: &'a dyn WorkloadAdmin,
    bindings: &'a dyn BindingAdmin,
}

impl<'a> DataPlaneReconciler<'a> {
    pub fn new(workloads: &'a dyn WorkloadAdmin, bindings: &'a dyn BindingAdmin) -> Self {
        Self {
            workloads,
            bindings,
        }
    }

    #[instrument(skip_all, fields(subscription = %subscription_id))]
    pub async fn reconcile(
        &self,
        ps: &RivvenPullSubscription,
        desired: &DesiredConfig,
        subscription_id: &str,
        pass: &mut PassContext,
    ) -> Result<()> {
        let builder = ReceiveAdapterBuilder::new(ps, desired, subscription_id);

        let workload = self.reconcile_workload(&builder, desired, pass).await;

        let binding = if desired.autoscaling.is_elastic() {
            self.reconcile_binding(&builder).await
        } else {
            Ok(())
        };

        match (workload, binding) {
            (Ok(live), Ok(())) => {
                self.propagate_health(&builder, &live, pass).await;
                Ok(())
            }
            (Ok(live), Err(e)) => {
                self.propagate_health(&builder, &live, pass).await;
                pass.conditions().mark_false(
                    ConditionType::Deployed,
                    "AutoscalerBindingFailed",
                    format!("Error reconciling the autoscaler binding: {e}"),
                );
                Err(self.fail(e, pass))
            }
            (Err(e), Ok(())) => Err(self.fail(e, pass)),
            (Err(workload_err), Err(binding_err)) => {
                warn!(error = %binding_err, "Autoscaler binding also failed");
                pass.notices.push(Notice::warning(
                    REASON_DATA_PLANE_FAILED,
                    format!("Failed to reconcile Data Plane resource(s): {binding_err}"),
                ));
                Err(self.fail(workload_err, pass))
            }
        }
    }

    fn fail(&self, e: OperatorError, pass: &mut PassContext) -> OperatorError {
        let err = match e {
            OperatorError::DataPlane(_) => e,
            other => OperatorError::DataPlane(other.to_string()),
        };
        pass.notices
            .push(Notice::warning(REASON_DATA_PLANE_FAILED, err.to_string()));
        err
    }

    /// Find, create or update the adapter and drop owned adapters under other
    /// names. Sets Deployed on failure.
    async fn reconcile_workload(
        &self,
        builder: &ReceiveAdapterBuilder<'_>,
        desired: &DesiredConfig,
        pass: &mut PassContext,
    ) -> Result<Deployment> {
        let wanted = builder.build_deployment()?;
        let namespace = builder.namespace();

        let listed = match self
            .workloads
            .list_workloads(namespace, &builder.selector())
            .await
        {
            Ok(list) => list,
            Err(e) => {
                pass.conditions().mark_unknown(
                    ConditionType::Deployed,
                    "ReceiveAdapterGetFailed",
                    format!("Error getting the Receive Adapter: {e}"),
                );
                return Err(e);
            }
        };

        let (current, others): (Vec<_>, Vec<_>) = listed
            .into_iter()
            .partition(|d| d.metadata.name.as_deref() == Some(builder.name()));
        let stale: Vec<String> = others
            .iter()
            .filter(|d| builder.is_owned(d))
            .filter_map(|d| d.metadata.name.clone())
            .collect();

        let live = self
            .apply_workload(builder, desired, wanted, current.into_iter().next(), pass)
            .await?;

        for name in stale {
            self.remove_stale(namespace, &name, pass).await?;
        }

        Ok(live)
    }

    /// Adapter left behind by an earlier subscription id
    async fn remove_stale(
        &self,
        namespace: &str,
        name: &str,
        pass: &mut PassContext,
    ) -> Result<()> {
        info!(name = %name, "Deleting stale receive adapter");
        self.workloads
            .delete_workload(namespace, name)
            .await
            .inspect_err(|e| {
                pass.conditions().mark_false(
                    ConditionType::Deployed,
                    "ReceiveAdapterDeleteFailed",
                    format!("Error deleting the stale Receive Adapter {name:?}: {e}"),
                );
            })?;
        self.bindings.delete_binding(namespace, name).await
    }

    async fn apply_workload(
        &self,
        builder: &ReceiveAdapterBuilder<'_>,
        desired: &DesiredConfig,
        wanted: Deployment,
        existing: Option<Deployment>,
        pass: &mut PassContext,
    ) -> Result<Deployment> {
        let namespace = builder.namespace();
        match existing {
            None => {
                info!(name = %builder.name(), "Creating receive adapter");
                self.workloads
                    .create_workload(namespace, &wanted)
                    .await
                    .inspect_err(|e| {
                        pass.conditions().mark_false(
                            ConditionType::Deployed,
                            "ReceiveAdapterCreateFailed",
                            format!("Error creating the Receive Adapter: {e}"),
                        );
                    })
            }
            Some(live) => {
                let elastic = desired.autoscaling.is_elastic();
                if !needs_update(&live, &wanted, elastic) {
                    debug!(name = %builder.name(), "Receive adapter up to date");
                    return Ok(live);
                }
                info!(name = %builder.name(), "Receive adapter drifted, updating");
                let merged = merge_update(live, wanted, elastic);
                self.workloads
                    .update_workload(namespace, &merged)
                    .await
                    .inspect_err(|e| {
                        pass.conditions().mark_false(
                            ConditionType::Deployed,
                            "ReceiveAdapterUpdateFailed",
                            format!("Error updating the Receive Adapter: {e}"),
                        );
                    })
            }
        }
    }

    /// Apply the ScaledObject unless the live one already carries the desired spec
    async fn reconcile_binding(&self, builder: &ReceiveAdapterBuilder<'_>) -> Result<()> {
        let namespace = builder.namespace();
        let wanted_spec = builder.scaled_object_spec();

        if let Some(live) = self.bindings.get_binding(namespace, builder.name()).await? {
            let live_spec = live.data.get("spec").unwrap_or(&Value::Null);
            if json_contains(live_spec, &wanted_spec) {
                debug!(name = %builder.name(), "Autoscaler binding up to date");
                return Ok(());
            }
        }

        let binding = builder.build_scaled_object()?;
        self.bindings
            .create_or_update_binding(namespace, &binding)
            .await?;
        info!(name = %builder.name(), "Applied autoscaler binding");
        Ok(())
    }

    /// Reflect the adapter's Available condition into Deployed
    async fn propagate_health(
        &self,
        builder: &ReceiveAdapterBuilder<'_>,
        live: &Deployment,
        pass: &mut PassContext,
    ) {
        let available = live
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == "Available"));

        if let Some(c) = available {
            if c.status == "True" {
                pass.conditions().mark_true(ConditionType::Deployed);
                return;
            }
        }

        let diagnostics = match self
            .workloads
            .diagnostics(builder.namespace(), &builder.selector())
            .await
        {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "Could not collect adapter diagnostics");
                Vec::new()
            }
        };
        if let Some(message) = find_auth_failure(&diagnostics) {
            pass.conditions().mark_unknown(
                ConditionType::Deployed,
                "AuthenticationCheckPending",
                message,
            );
            return;
        }

        match available {
            Some(c) if c.status == "False" => {
                pass.conditions().mark_false(
                    ConditionType::Deployed,
                    c.reason.clone().unwrap_or_default(),
                    c.message.clone().unwrap_or_default(),
                );
            }
            Some(c) => {
                pass.conditions().mark_unknown(
                    ConditionType::Deployed,
                    c.reason.clone().unwrap_or_default(),
                    c.message.clone().unwrap_or_default(),
                );
            }
            None => {
                pass.conditions().mark_unknown(
                    ConditionType::Deployed,
                    "DeploymentUnavailable",
                    format!("Deployment {:?} is unavailable.", builder.name()),
                );
            }
        }
    }
}

/// Whether the live adapter differs from the desired one in image, env or labels
fn needs_update(live: &Deployment, wanted: &Deployment, elastic: bool) -> bool {
    fn adapter(d: &Deployment) -> Option<&k8s_openapi::api::core::v1::Container> {
        d.spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .containers
            .iter()
            .find(|c| c.name == ADAPTER_CONTAINER_NAME)
    }
    fn template_labels(d: &Deployment) -> Option<&std::collections::BTreeMap<String, String>> {
        d.spec.as_ref()?.template.metadata.as_ref()?.labels.as_ref()
    }

    let (Some(live_c), Some(wanted_c)) = (adapter(live), adapter(wanted)) else {
        return true;
    };

    live_c.image != wanted_c.image
        || live_c.env != wanted_c.env
        || live.metadata.labels != wanted.metadata.labels
        || template_labels(live) != template_labels(wanted)
        || (!elastic
            && live.spec.as_ref().and_then(|s| s.replicas)
                != wanted.spec.as_ref().and_then(|s| s.replicas))
}

/// Desired metadata and template on top of the live object
///
/// The live resourceVersion is kept so the replace is optimistic. For the
/// elastic class the live replica count is kept.
fn merge_update(live: Deployment, wanted: Deployment, elastic: bool) -> Deployment {
    let mut merged = live;
    merged.metadata.labels = wanted.metadata.labels;
    merged.metadata.owner_references = wanted.metadata.owner_references;
    if let (Some(spec), Some(wanted_spec)) = (merged.spec.as_mut(), wanted.spec) {
        spec.template = wanted_spec.template;
        if !elastic {
            spec.replicas = wanted_spec.replicas;
        }
    }
    merged.status = None;
    merged
}

/// Every field in `wanted` is present with an equal value in `live`
fn json_contains(live: &Value, wanted: &Value) -> bool {
    match (live, wanted) {
        (Value::Object(l), Value::Object(w)) => w
            .iter()
            .all(|(k, wv)| l.get(k).is_some_and(|lv| json_contains(lv, wv))),
        (Value::Array(l), Value::Array(w)) => {
            l.len() == w.len() && l.iter().zip(w).all(|(lv, wv)| json_contains(lv, wv))
        }
        _ => live == wanted,
    }
}
