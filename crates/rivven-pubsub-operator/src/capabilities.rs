//! Object-side capabilities shared by every reconciled kind

use crate::crd::{Destination, RivvenPullSubscription, RivvenPullSubscriptionStatus};
use crate::naming;
use kube::ResourceExt;
use std::time::Duration;

/// An object that delivers to a sink and an optional transformer
pub trait SinkResolvable: Send + Sync {
    fn sink_namespace(&self) -> String;
    fn sink(&self) -> &Destination;
    fn transformer(&self) -> Option<&Destination>;
}

/// An object that owns a Pub/Sub subscription
pub trait SubscriptionOwner: Send + Sync {
    fn owner_namespace(&self) -> String;
    fn owner_name(&self) -> String;
    fn owner_uid(&self) -> String;

    fn topic_id(&self) -> &str;
    /// Project named on the object itself
    fn requested_project(&self) -> Option<&str>;
    fn ack_deadline(&self) -> Duration;
    fn retention_duration(&self) -> Duration;
    fn retain_acked_messages(&self) -> bool;

    fn recorded_status(&self) -> Option<&RivvenPullSubscriptionStatus>;

    /// Subscription id already written to status, if any
    fn recorded_subscription_id(&self) -> Option<&str> {
        self.recorded_status()
            .map(|s| s.subscription_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Project already written to status, if any
    fn recorded_project(&self) -> Option<&str> {
        self.recorded_status()
            .map(|s| s.project_id.as_str())
            .filter(|p| !p.is_empty())
    }

    /// Deterministic id used when none is recorded
    fn derived_subscription_id(&self) -> String {
        naming::subscription_id(
            &self.owner_namespace(),
            &self.owner_name(),
            &self.owner_uid(),
        )
    }
}

impl SinkResolvable for RivvenPullSubscription {
    fn sink_namespace(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    fn sink(&self) -> &Destination {
        &self.spec.sink
    }

    fn transformer(&self) -> Option<&Destination> {
        self.spec.transformer.as_ref()
    }
}

impl SubscriptionOwner for RivvenPullSubscription {
    fn owner_namespace(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    fn owner_name(&self) -> String {
        self.name_any()
    }

    fn owner_uid(&self) -> String {
        self.uid().unwrap_or_default()
    }

    fn topic_id(&self) -> &str {
        &self.spec.topic
    }

    fn requested_project(&self) -> Option<&str> {
        self.spec.project.as_deref().filter(|p| !p.is_empty())
    }

    fn ack_deadline(&self) -> Duration {
        self.spec.ack_deadline()
    }

    fn retention_duration(&self) -> Duration {
        self.spec.retention_duration()
    }

    fn retain_acked_messages(&self) -> bool {
        self.spec.retain_acked_messages
    }

    fn recorded_status(&self) -> Option<&RivvenPullSubscriptionStatus> {
        self.status.as_ref()
    }
}
