//! Notices produced by a reconcile pass and their publication as Kubernetes Events

use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

/// Event reasons
pub const REASON_FINALIZER_UPDATE: &str = "FinalizerUpdate";
pub const REASON_RECONCILED: &str = "PullSubscriptionReconciled";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_INVALID_SINK: &str = "InvalidSink";
pub const REASON_INVALID_TRANSFORMER: &str = "InvalidTransformer";
pub const REASON_CLIENT_CREATE_FAILED: &str = "ClientCreateFailed";
pub const REASON_SUBSCRIPTION_RECONCILE_FAILED: &str = "SubscriptionReconcileFailed";
pub const REASON_SUBSCRIPTION_DELETE_FAILED: &str = "SubscriptionDeleteFailed";
pub const REASON_DATA_PLANE_FAILED: &str = "DataPlaneReconcileFailed";

/// Severity of a notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeType {
    Normal,
    Warning,
}

/// A human-readable notice emitted during a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub notice_type: NoticeType,
    pub reason: String,
    pub message: String,
}

impl Notice {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            notice_type: NoticeType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            notice_type: NoticeType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn is_warning(&self) -> bool {
        self.notice_type == NoticeType::Warning
    }

    fn action(&self) -> &'static str {
        match self.reason.as_str() {
            REASON_FINALIZER_UPDATE => "UpdateFinalizers",
            REASON_SUBSCRIPTION_DELETE_FAILED => "Finalize",
            _ => "Reconcile",
        }
    }
}

/// Publish notices through the recorder. Failures are logged, never returned.
pub async fn publish(recorder: &Recorder, notices: &[Notice]) {
    for notice in notices {
        let event = Event {
            type_: match notice.notice_type {
                NoticeType::Normal => EventType::Normal,
                NoticeType::Warning => EventType::Warning,
            },
            reason: notice.reason.clone(),
            note: Some(notice.message.clone()),
            action: notice.action().to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason = %notice.reason, error = %e, "Failed to publish event");
        }
    }
}
