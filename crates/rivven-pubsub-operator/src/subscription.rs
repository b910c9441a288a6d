//! Pub/Sub subscription reconciliation
//!
//! Ensures the subscription exists with the desired delivery parameters and
//! records its id in status. Every remote failure is reported as a False
//! `SubscriptionReady` condition and retried by the controller.

use crate::capabilities::SubscriptionOwner;
use crate::conditions::ConditionType;
use crate::error::{OperatorError, Result};
use crate::events::{Notice, REASON_CLIENT_CREATE_FAILED, REASON_SUBSCRIPTION_RECONCILE_FAILED};
use crate::pubsub_client::{MessagingAdmin, MessagingClient, SubscriptionInfo};
use crate::reconciler::PassContext;
use crate::resolver::DesiredConfig;
use tracing::{debug, info, instrument, warn};

/// Reconciles the Pub/Sub side of a pull subscription
pub struct SubscriptionReconciler<'a> {
    admin: &'a dyn MessagingAdmin,
}

impl<'a> SubscriptionReconciler<'a> {
    pub fn new(admin: &'a dyn MessagingAdmin) -> Self {
        Self { admin }
    }

    /// Converge the subscription and return its id
    #[instrument(skip_all, fields(project = %desired.project_id, topic = %desired.subscription.topic))]
    pub async fn reconcile(
        &self,
        owner: &dyn SubscriptionOwner,
        desired: &DesiredConfig,
        pass: &mut PassContext,
    ) -> Result<String> {
        let client = match self.admin.create_client(&desired.project_id).await {
            Ok(client) => client,
            Err(e) => {
                let message = e.to_string();
                pass.conditions().mark_false(
                    ConditionType::SubscriptionReady,
                    REASON_CLIENT_CREATE_FAILED,
                    message.clone(),
                );
                pass.notices
                    .push(Notice::warning(REASON_CLIENT_CREATE_FAILED, message));
                return Err(match e {
                    OperatorError::ClientCreate(_) => e,
                    other => OperatorError::ClientCreate(other.to_string()),
                });
            }
        };

        let recorded = owner.recorded_subscription_id().map(str::to_string);
        match self
            .ensure_subscription(client.as_ref(), recorded, desired, pass)
            .await
        {
            Ok(info) => {
                pass.status.subscription_id = info.id.clone();
                pass.conditions().mark_true(ConditionType::SubscriptionReady);
                Ok(info.id)
            }
            Err(e) => {
                let reason = match e {
                    OperatorError::TopicNotFound(_) => "TopicNotFound",
                    _ => REASON_SUBSCRIPTION_RECONCILE_FAILED,
                };
                let message = format!("Failed to reconcile Pub/Sub subscription: {e}");
                pass.conditions()
                    .mark_false(ConditionType::SubscriptionReady, reason, message.clone());
                pass.notices
                    .push(Notice::warning(REASON_SUBSCRIPTION_RECONCILE_FAILED, message));
                Err(e)
            }
        }
    }

    async fn ensure_subscription(
        &self,
        client: &dyn MessagingClient,
        recorded: Option<String>,
        desired: &DesiredConfig,
        pass: &mut PassContext,
    ) -> Result<SubscriptionInfo> {
        let topic = &desired.subscription.topic;
        if !client.topic_exists(topic).await? {
            return Err(OperatorError::TopicNotFound(topic.clone()));
        }

        if let Some(id) = recorded {
            match client.get_subscription(&id).await? {
                Some(live) => return self.converge(client, &id, live, desired).await,
                None => {
                    warn!(subscription = %id, "Recorded subscription is gone, recreating");
                    pass.status.subscription_id.clear();
                }
            }
        }

        let id = &desired.derived_subscription_id;
        match client.get_subscription(id).await? {
            Some(live) => {
                debug!(subscription = %id, "Adopting existing subscription");
                self.converge(client, id, live, desired).await
            }
            None => {
                info!(subscription = %id, "Creating subscription");
                client.create_subscription(id, &desired.subscription).await
            }
        }
    }

    async fn converge(
        &self,
        client: &dyn MessagingClient,
        id: &str,
        live: SubscriptionInfo,
        desired: &DesiredConfig,
    ) -> Result<SubscriptionInfo> {
        if live.topic != desired.subscription.topic {
            warn!(
                subscription = %id,
                live_topic = %live.topic,
                "Subscription topic cannot change in place"
            );
        }
        if live.matches(&desired.subscription) {
            debug!(subscription = %id, "Subscription up to date");
            return Ok(live);
        }
        info!(subscription = %id, "Subscription drifted, updating");
        client.update_subscription(id, &desired.subscription).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{Condition, ConditionStatus};
    use crate::crd::RivvenPullSubscriptionStatus;
    use crate::testing::{desired_config, test_subscription, FakeMessaging};
    use std::time::Duration;

    fn condition(pass: &PassContext) -> Condition {
        pass.status
            .conditions
            .iter()
            .find(|c| c.condition_type == ConditionType::SubscriptionReady)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_creates_missing_subscription() {
        let messaging = FakeMessaging::with_topic("test-topic");
        let ps = test_subscription();
        let desired = desired_config(&ps);
        let mut pass = PassContext::at(RivvenPullSubscriptionStatus::default(), "t0");

        let id = SubscriptionReconciler::new(&messaging)
            .reconcile(&ps, &desired, &mut pass)
            .await
            .unwrap();

        assert_eq!(id, desired.derived_subscription_id);
        assert_eq!(pass.status.subscription_id, id);
        assert_eq!(messaging.calls().creates, 1);
        assert_eq!(condition(&pass).status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_topic_not_found_is_reported() {
        let messaging = FakeMessaging::default();
        let ps = test_subscription();
        let desired = desired_config(&ps);
        let mut pass = PassContext::at(RivvenPullSubscriptionStatus::default(), "t0");

        let err = SubscriptionReconciler::new(&messaging)
            .reconcile(&ps, &desired, &mut pass)
            .await
            .unwrap_err();

        assert!(matches!(err, OperatorError::TopicNotFound(_)));
        let cond = condition(&pass);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, "TopicNotFound");
        assert_eq!(
            cond.message,
            "Failed to reconcile Pub/Sub subscription: Topic \"test-topic\" does not exist"
        );
        assert_eq!(pass.notices[0].reason, REASON_SUBSCRIPTION_RECONCILE_FAILED);
        assert_eq!(messaging.calls().creates, 0);
    }

    #[tokio::test]
    async fn test_client_create_failure() {
        let messaging = FakeMessaging::with_topic("test-topic");
        messaging.fail_client_create("no credentials");
        let ps = test_subscription();
        let desired = desired_config(&ps);
        let mut pass = PassContext::at(RivvenPullSubscriptionStatus::default(), "t0");

        let err = SubscriptionReconciler::new(&messaging)
            .reconcile(&ps, &desired, &mut pass)
            .await
            .unwrap_err();

        assert!(matches!(err, OperatorError::ClientCreate(_)));
        assert_eq!(condition(&pass).reason, "ClientCreateFailed");
    }

    #[tokio::test]
    async fn test_drift_is_updated() {
        let messaging = FakeMessaging::with_topic("test-topic");
        let ps = test_subscription();
        let desired = desired_config(&ps);
        let mut stale = desired.subscription.clone();
        stale.ack_deadline = Duration::from_secs(10);
        messaging.insert_subscription(&desired.derived_subscription_id, &stale);

        let mut pass = PassContext::at(RivvenPullSubscriptionStatus::default(), "t0");
        SubscriptionReconciler::new(&messaging)
            .reconcile(&ps, &desired, &mut pass)
            .await
            .unwrap();

        let calls = messaging.calls();
        assert_eq!(calls.creates, 0);
        assert_eq!(calls.updates, 1);
        let live = messaging
            .subscription(&desired.derived_subscription_id)
            .unwrap();
        assert!(live.matches(&desired.subscription));
    }

    #[tokio::test]
    async fn test_recorded_subscription_missing_is_recreated() {
        let messaging = FakeMessaging::with_topic("test-topic");
        let mut ps = test_subscription();
        ps.status = Some(RivvenPullSubscriptionStatus {
            subscription_id: "deleted-out-of-band".to_string(),
            ..Default::default()
        });
        let desired = desired_config(&ps);
        let mut pass = PassContext::at(ps.status.clone().unwrap(), "t0");

        let id = SubscriptionReconciler::new(&messaging)
            .reconcile(&ps, &desired, &mut pass)
            .await
            .unwrap();

        assert_eq!(id, desired.derived_subscription_id);
        assert_eq!(messaging.calls().creates, 1);
    }

    #[tokio::test]
    async fn test_remote_error_is_wrapped() {
        let messaging = FakeMessaging::with_topic("test-topic");
        messaging.fail_create("quota exceeded");
        let ps = test_subscription();
        let desired = desired_config(&ps);
        let mut pass = PassContext::at(RivvenPullSubscriptionStatus::default(), "t0");

        SubscriptionReconciler::new(&messaging)
            .reconcile(&ps, &desired, &mut pass)
            .await
            .unwrap_err();

        let cond = condition(&pass);
        assert_eq!(cond.reason, REASON_SUBSCRIPTION_RECONCILE_FAILED);
        assert!(cond.message.ends_with("quota exceeded"));
    }
}
