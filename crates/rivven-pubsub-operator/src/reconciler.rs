//! Reconcile driver
//!
//! One pass runs `Initializing -> Resolving -> ReconcilingMessaging ->
//! ReconcilingDataPlane` and ends in `Ready` or `Degraded`. Deletion runs
//! `Deleting -> Finalized`. A pass works on a snapshot of the object and
//! returns the new status and the notices to publish; it never writes to the
//! API server itself.

use crate::capabilities::SubscriptionOwner;
use crate::conditions::{ConditionSet, ConditionType};
use crate::crd::{ReconcilePhase, RivvenPullSubscription, RivvenPullSubscriptionStatus};
use crate::dataplane::DataPlaneReconciler;
use crate::deletion::DeletionCoordinator;
use crate::error::{OperatorError, Result};
use crate::events::{Notice, REASON_INVALID_SPEC, REASON_RECONCILED};
use crate::pubsub_client::MessagingAdmin;
use crate::resolver::{AddressResolver, DesiredStateResolver};
use crate::subscription::SubscriptionReconciler;
use crate::workload::{BindingAdmin, WorkloadAdmin};
use chrono::Utc;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Default receive adapter image
pub const DEFAULT_ADAPTER_IMAGE: &str = "ghcr.io/hupe1980/rivven-pubsub-adapter:latest";

/// Settings shared by every pass
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Image of the receive adapter
    pub adapter_image: String,
    /// Project used when the resource names none
    pub default_project: Option<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            adapter_image: DEFAULT_ADAPTER_IMAGE.to_string(),
            default_project: None,
        }
    }
}

/// Mutable state of one pass
pub struct PassContext {
    pub status: RivvenPullSubscriptionStatus,
    pub notices: Vec<Notice>,
    now: String,
}

impl PassContext {
    pub fn new(status: RivvenPullSubscriptionStatus) -> Self {
        Self::at(status, Utc::now().to_rfc3339())
    }

    /// Pass with a fixed condition timestamp
    pub fn at(status: RivvenPullSubscriptionStatus, now: impl Into<String>) -> Self {
        Self {
            status,
            notices: Vec::new(),
            now: now.into(),
        }
    }

    pub fn conditions(&mut self) -> ConditionSet<'_> {
        ConditionSet::at(&mut self.status.conditions, self.now.clone())
    }
}

/// Result of one pass
#[derive(Debug)]
pub struct PassOutcome {
    pub phase: ReconcilePhase,
    /// New status; `None` on the deletion branch
    pub status: Option<RivvenPullSubscriptionStatus>,
    pub notices: Vec<Notice>,
    pub error: Option<OperatorError>,
}

impl PassOutcome {
    pub fn is_ready(&self) -> bool {
        self.phase == ReconcilePhase::Ready
    }
}

/// Drives the per-object state machine
pub struct Reconciler {
    resolver: Arc<dyn AddressResolver>,
    messaging: Arc<dyn MessagingAdmin>,
    workloads: Arc<dyn WorkloadAdmin>,
    bindings: Arc<dyn BindingAdmin>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        resolver: Arc<dyn AddressResolver>,
        messaging: Arc<dyn MessagingAdmin>,
        workloads: Arc<dyn WorkloadAdmin>,
        bindings: Arc<dyn BindingAdmin>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            resolver,
            messaging,
            workloads,
            bindings,
            config,
        }
    }

    /// Run the happy-path branch for one object
    #[instrument(skip_all, fields(name = %ps.name_any(), namespace = ps.namespace()))]
    pub async fn reconcile(&self, ps: &RivvenPullSubscription) -> PassOutcome {
        let mut pass = PassContext::new(ps.status.clone().unwrap_or_default());

        pass.status.phase = ReconcilePhase::Initializing;
        pass.status.observed_generation = ps.metadata.generation.unwrap_or_default();
        pass.conditions().initialize();

        let result = self.run(ps, &mut pass).await;

        let ready = pass.conditions().is_ready();
        let phase = match &result {
            Ok(()) if ready => ReconcilePhase::Ready,
            Ok(()) => ReconcilePhase::ReconcilingDataPlane,
            Err(_) => ReconcilePhase::Degraded,
        };
        pass.status.phase = phase;

        if result.is_ok() {
            pass.notices.push(Notice::normal(
                REASON_RECONCILED,
                format!(
                    "PullSubscription reconciled: \"{}/{}\"",
                    ps.owner_namespace(),
                    ps.owner_name()
                ),
            ));
        }

        match &result {
            Ok(()) => debug!(?phase, "Pass complete"),
            Err(e) => warn!(?phase, error = %e, "Pass failed"),
        }

        PassOutcome {
            phase,
            status: Some(pass.status),
            notices: pass.notices,
            error: result.err(),
        }
    }

    async fn run(&self, ps: &RivvenPullSubscription, pass: &mut PassContext) -> Result<()> {
        if let Err(errors) = ps.spec.validate() {
            let message = errors.to_string();
            pass.conditions().mark_false(
                ConditionType::SubscriptionReady,
                REASON_INVALID_SPEC,
                message.clone(),
            );
            pass.notices
                .push(Notice::warning(REASON_INVALID_SPEC, message.clone()));
            return Err(OperatorError::ValidationError(message));
        }

        pass.status.phase = ReconcilePhase::Resolving;
        let desired = DesiredStateResolver::new(
            self.resolver.as_ref(),
            self.config.default_project.as_deref(),
            &self.config.adapter_image,
        )
        .resolve(ps, pass)
        .await?;

        pass.status.phase = ReconcilePhase::ReconcilingMessaging;
        let subscription_id = SubscriptionReconciler::new(self.messaging.as_ref())
            .reconcile(ps, &desired, pass)
            .await?;

        pass.status.phase = ReconcilePhase::ReconcilingDataPlane;
        DataPlaneReconciler::new(self.workloads.as_ref(), self.bindings.as_ref())
            .reconcile(ps, &desired, &subscription_id, pass)
            .await?;

        Ok(())
    }

    /// Run the deletion branch. Status is left untouched.
    #[instrument(skip_all, fields(name = %ps.name_any(), namespace = ps.namespace()))]
    pub async fn finalize(&self, ps: &RivvenPullSubscription) -> PassOutcome {
        let mut notices = Vec::new();
        debug!(phase = ?ReconcilePhase::Deleting, "Cleaning up");

        let result = DeletionCoordinator::new(
            self.messaging.as_ref(),
            self.config.default_project.as_deref(),
        )
        .finalize(ps, &mut notices)
        .await;

        let phase = match &result {
            Ok(()) => {
                info!("Finalized");
                ReconcilePhase::Finalized
            }
            Err(_) => ReconcilePhase::Deleting,
        };

        PassOutcome {
            phase,
            status: None,
            notices,
            error: result.err(),
        }
    }
}
