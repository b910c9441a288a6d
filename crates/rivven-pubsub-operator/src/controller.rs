//! RivvenPullSubscription controller
//!
//! Wires the [`Reconciler`] into a `kube::runtime::Controller`: finalizer
//! handling, per-pass deadline, optimistic status writes, event publishing,
//! and exponential backoff on failure.

use crate::crd::{RivvenPullSubscription, RivvenPullSubscriptionStatus};
use crate::error::{OperatorError, Result};
use crate::events::{self, Notice, REASON_FINALIZER_UPDATE};
use crate::reconciler::{PassOutcome, Reconciler};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Finalizer guarding Pub/Sub subscription cleanup
pub const FINALIZER_NAME: &str = "rivven.hupe1980.github.io/pullsubscription-finalizer";

/// Reporter name on published events
pub const REPORTER: &str = "rivven-pubsub-operator";

/// Default requeue interval for ready objects
const DEFAULT_RESYNC_SECONDS: u64 = 300;

/// Requeue interval while waiting on the adapter to become available
const PENDING_REQUEUE_SECONDS: u64 = 30;

const DEFAULT_PASS_DEADLINE_SECONDS: u64 = 60;
const DEFAULT_BACKOFF_BASE_SECONDS: u64 = 5;
const DEFAULT_BACKOFF_MAX_SECONDS: u64 = 300;

/// Timing knobs for the controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Requeue interval after a pass that reached Ready
    pub resync_interval: Duration,
    /// Requeue interval after a clean pass that is not Ready yet
    pub pending_requeue: Duration,
    /// Upper bound for a single pass
    pub pass_deadline: Duration,
    /// First retry delay after a failure
    pub backoff_base: Duration,
    /// Retry delay cap
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            pending_requeue: Duration::from_secs(PENDING_REQUEUE_SECONDS),
            pass_deadline: Duration::from_secs(DEFAULT_PASS_DEADLINE_SECONDS),
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECONDS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECONDS),
        }
    }
}

/// Context shared by all reconcile passes
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    pub reconciler: Reconciler,
    pub config: ControllerConfig,
    pub reporter: Reporter,
    /// Metrics recorder
    pub metrics: Option<ControllerMetrics>,
    /// Consecutive failures per object key
    pub error_counts: DashMap<String, u32>,
}

/// Controller metrics
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Counter for status write conflicts
    pub conflicts: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("rivven_pubsub_reconciliations_total"),
            errors: metrics::counter!("rivven_pubsub_reconciliation_errors_total"),
            conflicts: metrics::counter!("rivven_pubsub_status_conflicts_total"),
            duration: metrics::histogram!("rivven_pubsub_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerContext {
    pub fn new(client: Client, reconciler: Reconciler, config: ControllerConfig) -> Self {
        Self {
            client,
            reconciler,
            config,
            reporter: REPORTER.into(),
            metrics: Some(ControllerMetrics::new()),
            error_counts: DashMap::new(),
        }
    }

    fn recorder(&self, ps: &RivvenPullSubscription) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), ps.object_ref(&()))
    }
}

/// Start the RivvenPullSubscription controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    reconciler: Reconciler,
    config: ControllerConfig,
) -> Result<()> {
    let (subscriptions, deployments): (Api<RivvenPullSubscription>, Api<Deployment>) =
        match &namespace {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

    let ctx = Arc::new(ControllerContext::new(client, reconciler, config));

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting RivvenPullSubscription controller"
    );

    Controller::new(subscriptions, Config::default())
        .owns(deployments, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

fn object_key(ps: &RivvenPullSubscription) -> String {
    format!(
        "{}/{}",
        ps.namespace().unwrap_or_default(),
        ps.name_any()
    )
}

/// Main reconciliation function
#[instrument(skip(ps, ctx), fields(name = %ps.name_any(), namespace = ps.namespace()))]
async fn reconcile(ps: Arc<RivvenPullSubscription>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = ps.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<RivvenPullSubscription> = Api::namespaced(ctx.client.clone(), &namespace);

    let adding_finalizer = ps.meta().deletion_timestamp.is_none()
        && !ps.finalizers().iter().any(|f| f == FINALIZER_NAME);

    let result = finalizer(&api, FINALIZER_NAME, ps.clone(), |event| async {
        match event {
            FinalizerEvent::Apply(ps) => apply(ps, &api, ctx.clone()).await,
            FinalizerEvent::Cleanup(ps) => cleanup(ps, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| match e {
        FinalizerError::ApplyFailed(err) | FinalizerError::CleanupFailed(err) => err,
        other => OperatorError::FinalizerError(other.to_string()),
    });

    if adding_finalizer && result.is_ok() {
        let notice = Notice::normal(
            REASON_FINALIZER_UPDATE,
            format!("Updated {:?} finalizers", ps.name_any()),
        );
        events::publish(&ctx.recorder(&ps), &[notice]).await;
    }

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    if result.is_ok() {
        reset_retries(&ctx.error_counts, &object_key(&ps));
    }
    result
}

/// Happy-path branch
async fn apply(
    ps: Arc<RivvenPullSubscription>,
    api: &Api<RivvenPullSubscription>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let outcome = run_pass(ctx.config.pass_deadline, ctx.reconciler.reconcile(&ps)).await?;
    events::publish(&ctx.recorder(&ps), &outcome.notices).await;

    if let Some(status) = &outcome.status {
        if ps.status.as_ref() != Some(status) {
            write_status(api, &ps, status.clone()).await?;
        } else {
            debug!("Status unchanged, skipping write");
        }
    }

    match outcome.error {
        Some(e) => Err(e),
        None if outcome.is_ready() => Ok(Action::requeue(ctx.config.resync_interval)),
        None => Ok(Action::requeue(ctx.config.pending_requeue)),
    }
}

/// Deletion branch. An error keeps the finalizer in place.
async fn cleanup(ps: Arc<RivvenPullSubscription>, ctx: Arc<ControllerContext>) -> Result<Action> {
    info!("Cleaning up RivvenPullSubscription");
    let outcome = run_pass(ctx.config.pass_deadline, ctx.reconciler.finalize(&ps)).await?;
    events::publish(&ctx.recorder(&ps), &outcome.notices).await;

    match outcome.error {
        Some(e) => Err(e),
        None => Ok(Action::await_change()),
    }
}

/// Bound a pass by the configured deadline
async fn run_pass(
    deadline: Duration,
    pass: impl std::future::Future<Output = PassOutcome>,
) -> Result<PassOutcome> {
    timeout(deadline, pass).await.map_err(|_| {
        OperatorError::Timeout(format!(
            "reconcile pass exceeded {}s",
            deadline.as_secs()
        ))
    })
}

/// Replace the status subresource at the resourceVersion the pass started from
async fn write_status(
    api: &Api<RivvenPullSubscription>,
    ps: &RivvenPullSubscription,
    status: RivvenPullSubscriptionStatus,
) -> Result<()> {
    let name = ps.name_any();
    let mut updated = ps.clone();
    updated.metadata.managed_fields = None;
    updated.status = Some(status);

    let data = serde_json::to_vec(&updated)?;
    match api.replace_status(&name, &PostParams::default(), data).await {
        Ok(_) => {
            debug!(name = %name, "Updated status");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => Err(OperatorError::Conflict(name)),
        Err(e) => Err(e.into()),
    }
}

/// Exponential backoff: base, 2·base, 4·base … capped at max
pub fn backoff_delay(retries: u32, base: Duration, max: Duration) -> Duration {
    let exponent = retries.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(max)
}

/// Count a failed pass and return its requeue delay with the failure count
///
/// Conflicts retry at once and leave the count untouched.
fn next_retry(
    counts: &DashMap<String, u32>,
    key: &str,
    error: &OperatorError,
    config: &ControllerConfig,
) -> (Duration, u32) {
    if error.is_conflict() {
        let retries = counts.get(key).map_or(0, |c| *c);
        return (Duration::ZERO, retries);
    }

    let retries = {
        let mut entry = counts.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    };
    (
        backoff_delay(retries, config.backoff_base, config.backoff_max),
        retries,
    )
}

/// Forget the failures of an object after a successful pass
fn reset_retries(counts: &DashMap<String, u32>, key: &str) {
    counts.remove(key);
}

/// Error policy: conflicts retry at once, everything else backs off
fn error_policy(
    ps: Arc<RivvenPullSubscription>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    if let Some(ref metrics) = ctx.metrics {
        metrics.errors.increment(1);
        metrics::counter!("rivven_pubsub_reconciliation_errors_by_kind_total", "kind" => error.kind())
            .increment(1);
    }

    let key = object_key(&ps);
    let (delay, retries) = next_retry(&ctx.error_counts, &key, error, &ctx.config);

    if error.is_conflict() {
        if let Some(ref metrics) = ctx.metrics {
            metrics.conflicts.increment(1);
        }
        debug!(error = %error, "Status conflict, retrying against fresh state");
        return Action::requeue(delay);
    }

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ReconcilePhase;
    use crate::testing::test_subscription;

    fn outcome() -> PassOutcome {
        PassOutcome {
            phase: ReconcilePhase::Ready,
            status: None,
            notices: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(5));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(10));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(40));
        assert_eq!(backoff_delay(7, base, max), Duration::from_secs(300));
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn test_backoff_zero_retries() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(0, base, Duration::from_secs(300)), base);
    }

    #[test]
    fn test_failures_back_off_and_reset() {
        let counts = DashMap::new();
        let config = ControllerConfig::default();
        let failure = OperatorError::Messaging("unavailable".to_string());

        assert_eq!(
            next_retry(&counts, "ns/a", &failure, &config),
            (Duration::from_secs(5), 1)
        );
        assert_eq!(
            next_retry(&counts, "ns/a", &failure, &config),
            (Duration::from_secs(10), 2)
        );
        assert_eq!(
            next_retry(&counts, "ns/b", &failure, &config),
            (Duration::from_secs(5), 1)
        );

        reset_retries(&counts, "ns/a");
        assert_eq!(
            next_retry(&counts, "ns/a", &failure, &config),
            (Duration::from_secs(5), 1)
        );
    }

    #[test]
    fn test_conflict_is_not_counted() {
        let counts = DashMap::new();
        let config = ControllerConfig::default();
        let failure = OperatorError::Messaging("unavailable".to_string());
        let conflict = OperatorError::Conflict("my-ps".to_string());

        next_retry(&counts, "ns/a", &failure, &config);
        assert_eq!(
            next_retry(&counts, "ns/a", &conflict, &config),
            (Duration::ZERO, 1)
        );
        assert_eq!(
            next_retry(&counts, "ns/a", &failure, &config),
            (Duration::from_secs(10), 2)
        );
        assert_eq!(
            next_retry(&counts, "ns/fresh", &conflict, &config),
            (Duration::ZERO, 0)
        );
        assert!(!counts.contains_key("ns/fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_exceeding_deadline_times_out() {
        let err = run_pass(
            Duration::from_secs(60),
            std::future::pending::<PassOutcome>(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, OperatorError::Timeout(_)));
        assert_eq!(err.to_string(), "Operation timed out: reconcile pass exceeded 60s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_within_deadline() {
        let pass = async {
            tokio::time::sleep(Duration::from_secs(59)).await;
            outcome()
        };
        let outcome = run_pass(Duration::from_secs(60), pass).await.unwrap();
        assert!(outcome.is_ready());
    }

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.backoff_base, Duration::from_secs(5));
        assert_eq!(config.backoff_max, Duration::from_secs(300));
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(&test_subscription()), "testnamespace/my-ps");
    }

    #[test]
    fn test_finalizer_name() {
        assert!(FINALIZER_NAME.starts_with(crate::crd::API_GROUP));
    }
}
