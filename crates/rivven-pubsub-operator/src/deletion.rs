//! Teardown of the Pub/Sub subscription when a pull subscription is deleted
//!
//! The receive adapter and its autoscaler binding carry owner references and
//! are left to the garbage collector.

use crate::capabilities::SubscriptionOwner;
use crate::error::{OperatorError, Result};
use crate::events::{Notice, REASON_SUBSCRIPTION_DELETE_FAILED};
use crate::pubsub_client::MessagingAdmin;
use tracing::{info, instrument, warn};

/// Deletes the subscription an object owns
pub struct DeletionCoordinator<'a> {
    admin: &'a dyn MessagingAdmin,
    default_project: Option<&'a str>,
}

impl<'a> DeletionCoordinator<'a> {
    pub fn new(admin: &'a dyn MessagingAdmin, default_project: Option<&'a str>) -> Self {
        Self {
            admin,
            default_project,
        }
    }

    /// Delete the recorded (or derived) subscription.
    ///
    /// On failure a warning notice is pushed and the error returned so the
    /// finalizer stays in place.
    #[instrument(skip_all, fields(name = %owner.owner_name()))]
    pub async fn finalize(
        &self,
        owner: &dyn SubscriptionOwner,
        notices: &mut Vec<Notice>,
    ) -> Result<()> {
        let project = owner
            .recorded_project()
            .or(owner.requested_project())
            .or(self.default_project);
        let Some(project) = project else {
            warn!("No project known, nothing to clean up");
            return Ok(());
        };

        let subscription_id = owner
            .recorded_subscription_id()
            .map(str::to_string)
            .unwrap_or_else(|| owner.derived_subscription_id());

        let result = match self.admin.create_client(project).await {
            Ok(client) => client.delete_subscription(&subscription_id).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(subscription = %subscription_id, "Subscription cleaned up");
                Ok(())
            }
            Err(e) => {
                let err = OperatorError::SubscriptionDelete(e.to_string());
                notices.push(Notice::warning(
                    REASON_SUBSCRIPTION_DELETE_FAILED,
                    err.to_string(),
                ));
                Err(err)
            }
        }
    }
}
