//! Condition model for pull subscription status
//!
//! Each reconciler owns one sub-condition. `Ready` is derived from the
//! required set and never written directly by a reconciler.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition types reported on a pull subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Ready,
    SinkResolved,
    TransformerResolved,
    SubscriptionReady,
    Deployed,
}

impl ConditionType {
    /// Sub-conditions that must all be True for `Ready`, in reporting order
    pub const REQUIRED: [ConditionType; 4] = [
        ConditionType::SinkResolved,
        ConditionType::TransformerResolved,
        ConditionType::SubscriptionReady,
        ConditionType::Deployed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::SinkResolved => "SinkResolved",
            ConditionType::TransformerResolved => "TransformerResolved",
            ConditionType::SubscriptionReady => "SubscriptionReady",
            ConditionType::Deployed => "Deployed",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition status
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A single status condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// RFC 3339 timestamp of the last change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Pure aggregation of the required sub-conditions.
///
/// The first False (in `ConditionType::REQUIRED` order) wins; otherwise the
/// first Unknown or missing condition; otherwise True.
pub fn aggregate(conditions: &[Condition]) -> (ConditionStatus, String, String) {
    let lookup = |t: ConditionType| conditions.iter().find(|c| c.condition_type == t);

    if let Some(failed) = ConditionType::REQUIRED
        .iter()
        .filter_map(|t| lookup(*t))
        .find(|c| c.status == ConditionStatus::False)
    {
        return (
            ConditionStatus::False,
            failed.reason.clone(),
            failed.message.clone(),
        );
    }

    for t in ConditionType::REQUIRED {
        match lookup(t) {
            Some(c) if c.is_true() => continue,
            Some(c) => {
                return (ConditionStatus::Unknown, c.reason.clone(), c.message.clone());
            }
            None => return (ConditionStatus::Unknown, String::new(), String::new()),
        }
    }

    (ConditionStatus::True, String::new(), String::new())
}

/// Mutable view over a status condition list.
///
/// All writes in one pass share a single timestamp.
pub struct ConditionSet<'a> {
    conditions: &'a mut Vec<Condition>,
    now: String,
}

impl<'a> ConditionSet<'a> {
    pub fn new(conditions: &'a mut Vec<Condition>) -> Self {
        Self::at(conditions, Utc::now().to_rfc3339())
    }

    pub fn at(conditions: &'a mut Vec<Condition>, now: impl Into<String>) -> Self {
        Self {
            conditions,
            now: now.into(),
        }
    }

    /// Add every missing condition as Unknown. Existing entries are kept.
    pub fn initialize(&mut self) {
        let all = std::iter::once(ConditionType::Ready).chain(ConditionType::REQUIRED);
        for t in all {
            if self.get(t).is_none() {
                self.conditions.push(Condition {
                    condition_type: t,
                    status: ConditionStatus::Unknown,
                    reason: String::new(),
                    message: String::new(),
                    last_transition_time: Some(self.now.clone()),
                });
            }
        }
    }

    pub fn get(&self, t: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.condition_type == t)
    }

    /// Set a condition. Returns false when it already held these values.
    pub fn set(
        &mut self,
        t: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        let changed = self.write(t, status, reason.into(), message.into());
        if t != ConditionType::Ready {
            self.aggregate();
        }
        changed
    }

    pub fn mark_true(&mut self, t: ConditionType) -> bool {
        self.set(t, ConditionStatus::True, "", "")
    }

    pub fn mark_true_with_reason(
        &mut self,
        t: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        self.set(t, ConditionStatus::True, reason, message)
    }

    pub fn mark_false(
        &mut self,
        t: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        self.set(t, ConditionStatus::False, reason, message)
    }

    pub fn mark_unknown(
        &mut self,
        t: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        self.set(t, ConditionStatus::Unknown, reason, message)
    }

    /// Recompute `Ready` from the required sub-conditions
    pub fn aggregate(&mut self) {
        let (status, reason, message) = aggregate(self.conditions);
        self.write(ConditionType::Ready, status, reason, message);
    }

    pub fn is_ready(&self) -> bool {
        self.get(ConditionType::Ready).is_some_and(Condition::is_true)
    }

    fn write(
        &mut self,
        t: ConditionType,
        status: ConditionStatus,
        reason: String,
        message: String,
    ) -> bool {
        match self.conditions.iter_mut().find(|c| c.condition_type == t) {
            Some(existing)
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message =>
            {
                false
            }
            Some(existing) => {
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                existing.last_transition_time = Some(self.now.clone());
                true
            }
            None => {
                self.conditions.push(Condition {
                    condition_type: t,
                    status,
                    reason,
                    message,
                    last_transition_time: Some(self.now.clone()),
                });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_true() -> Vec<Condition> {
        let mut conditions = Vec::new();
        let mut set = ConditionSet::at(&mut conditions, "t0");
        set.initialize();
        for t in ConditionType::REQUIRED {
            set.mark_true(t);
        }
        conditions
    }

    #[test]
    fn test_initialize_adds_unknown_conditions() {
        let mut conditions = Vec::new();
        ConditionSet::at(&mut conditions, "t0").initialize();

        assert_eq!(conditions.len(), 5);
        assert!(conditions
            .iter()
            .all(|c| c.status == ConditionStatus::Unknown));
    }

    #[test]
    fn test_initialize_keeps_existing() {
        let mut conditions = all_true();
        ConditionSet::at(&mut conditions, "t1").initialize();

        assert_eq!(conditions.len(), 5);
        assert!(conditions.iter().all(Condition::is_true));
    }

    #[test]
    fn test_ready_when_all_required_true() {
        let mut conditions = all_true();
        let set = ConditionSet::at(&mut conditions, "t0");
        assert!(set.is_ready());
    }

    #[test]
    fn test_false_wins_over_unknown() {
        let mut conditions = all_true();
        let mut set = ConditionSet::at(&mut conditions, "t1");
        set.mark_unknown(ConditionType::SinkResolved, "Pending", "waiting");
        set.mark_false(ConditionType::Deployed, "ReceiveAdapterCreateFailed", "boom");

        let ready = set.get(ConditionType::Ready).cloned();
        let ready = ready.as_ref().map(|c| (c.status, c.reason.as_str()));
        assert_eq!(
            ready,
            Some((ConditionStatus::False, "ReceiveAdapterCreateFailed"))
        );
    }

    #[test]
    fn test_first_false_in_fixed_order() {
        let mut conditions = all_true();
        let mut set = ConditionSet::at(&mut conditions, "t1");
        set.mark_false(ConditionType::Deployed, "Late", "");
        set.mark_false(ConditionType::SinkResolved, "InvalidSink", "missing");

        let (status, reason, message) = aggregate(&conditions);
        assert_eq!(status, ConditionStatus::False);
        assert_eq!(reason, "InvalidSink");
        assert_eq!(message, "missing");
    }

    #[test]
    fn test_unknown_without_false() {
        let mut conditions = all_true();
        let mut set = ConditionSet::at(&mut conditions, "t1");
        set.mark_unknown(ConditionType::Deployed, "DeploymentUnavailable", "not yet");

        let (status, reason, _) = aggregate(&conditions);
        assert_eq!(status, ConditionStatus::Unknown);
        assert_eq!(reason, "DeploymentUnavailable");
    }

    #[test]
    fn test_missing_required_is_unknown() {
        let conditions = vec![Condition {
            condition_type: ConditionType::SinkResolved,
            status: ConditionStatus::True,
            reason: String::new(),
            message: String::new(),
            last_transition_time: None,
        }];
        assert_eq!(aggregate(&conditions).0, ConditionStatus::Unknown);
    }

    #[test]
    fn test_identical_set_is_noop() {
        let mut conditions = all_true();
        let mut set = ConditionSet::at(&mut conditions, "t1");
        assert!(!set.mark_true(ConditionType::Deployed));

        assert!(conditions
            .iter()
            .all(|c| c.last_transition_time.as_deref() == Some("t0")));
    }

    #[test]
    fn test_change_updates_transition_time() {
        let mut conditions = all_true();
        let mut set = ConditionSet::at(&mut conditions, "t1");
        assert!(set.mark_false(ConditionType::SubscriptionReady, "TopicNotFound", "gone"));

        let sub = set.get(ConditionType::SubscriptionReady).cloned();
        assert_eq!(
            sub.and_then(|c| c.last_transition_time),
            Some("t1".to_string())
        );
    }

    #[test]
    fn test_condition_serialization() {
        let condition = Condition {
            condition_type: ConditionType::SubscriptionReady,
            status: ConditionStatus::False,
            reason: "TopicNotFound".to_string(),
            message: String::new(),
            last_transition_time: None,
        };
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "SubscriptionReady");
        assert_eq!(json["status"], "False");
        assert!(json.get("message").is_none());
    }
}
