//! # Rivven Pub/Sub Operator
//!
//! Kubernetes operator that binds Google Cloud Pub/Sub topics to in-cluster
//! event sinks.
//!
//! Each `RivvenPullSubscription` resource gets its own Pub/Sub subscription
//! and a receive adapter Deployment that pulls messages and delivers them as
//! CloudEvents to the resolved sink, optionally through a transformer.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_pubsub_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::try_default().await?;
//!     let reconciler = Reconciler::new(
//!         Arc::new(KubeAddressResolver::new(client.clone())),
//!         Arc::new(RestMessagingAdmin::new(PubSubAdminConfig::from_env(None))?),
//!         Arc::new(KubeWorkloadAdmin::new(client.clone())),
//!         Arc::new(KedaBindingAdmin::new(client.clone())),
//!         ReconcilerConfig::default(),
//!     );
//!     run_controller(client, None, reconciler, ControllerConfig::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Reconcile pass
//!
//! 1. **Resolve**: sink and transformer addresses, project, subscription settings
//! 2. **Messaging**: create, adopt, or converge the Pub/Sub subscription
//! 3. **Data plane**: create or update the receive adapter and, for the
//!    elastic scaling class, its KEDA `ScaledObject`
//! 4. **Status**: conditions aggregated into `Ready`, written only on change
//!
//! Deletion runs behind a finalizer and removes the Pub/Sub subscription; the
//! adapter is garbage collected through its owner reference.
//!
//! ## Custom Resource
//!
//! ```yaml
//! apiVersion: rivven.hupe1980.github.io/v1alpha1
//! kind: RivvenPullSubscription
//! metadata:
//!   name: orders
//!   annotations:
//!     autoscaling.rivven.hupe1980.github.io/class: keda
//!     autoscaling.rivven.hupe1980.github.io/maxScale: "5"
//! spec:
//!   topic: orders
//!   project: my-gcp-project
//!   ackDeadline: 30s
//!   retentionDuration: 24h
//!   secret:
//!     name: google-cloud-key
//!     key: key.json
//!   sink:
//!     ref:
//!       apiVersion: v1
//!       kind: Service
//!       name: event-display
//! ```
//!
//! ## Metrics
//!
//! - `rivven_pubsub_reconciliations_total` - Total reconciliation attempts
//! - `rivven_pubsub_reconciliation_errors_total` - Reconciliation errors
//! - `rivven_pubsub_status_conflicts_total` - Status writes lost to a newer version
//! - `rivven_pubsub_reconciliation_duration_seconds` - Reconciliation latency

pub mod capabilities;
pub mod conditions;
pub mod controller;
pub mod crd;
pub mod dataplane;
pub mod deletion;
pub mod error;
pub mod events;
pub mod naming;
pub mod pubsub_client;
pub mod reconciler;
pub mod resolver;
pub mod resources;
pub mod subscription;
pub mod workload;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::conditions::{Condition, ConditionStatus, ConditionType};
    pub use crate::controller::{
        run_controller, ControllerConfig, ControllerContext, ControllerMetrics,
    };
    pub use crate::crd::{
        AutoscalingConfig, Destination, KReference, ReconcilePhase, RivvenPullSubscription,
        RivvenPullSubscriptionSpec, RivvenPullSubscriptionStatus, ScalingClass,
        SecretKeyReference,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::pubsub_client::{
        MessagingAdmin, MessagingClient, PubSubAdminConfig, RestMessagingAdmin,
    };
    pub use crate::reconciler::{Reconciler, ReconcilerConfig};
    pub use crate::resolver::{AddressResolver, KubeAddressResolver};
    pub use crate::workload::{BindingAdmin, KedaBindingAdmin, KubeWorkloadAdmin, WorkloadAdmin};
    pub use std::sync::Arc;
}
