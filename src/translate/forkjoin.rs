//! Fork-join coordination of cloud and local translation
//!
//! The cloud call starts before OCR so both run in parallel; the results
//! meet again after aggregation. A per-window image-hash cache short
//! circuits the call entirely for frames the endpoint has already seen.
//! The cloud child is linked to the iteration's cancellation token and is
//! cancelled the moment its result can no longer be used.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capture::frame::{Frame, WindowHandle};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::translate::cache::{frame_hash, CloudResultCache};
use crate::translate::cloud::{
    encode_cloud_payload, CloudError, CloudTranslationResult, CloudTranslationTask, FallbackClient,
};

/// Per-iteration inputs to the fork precondition predicate
#[derive(Debug, Clone, Default)]
pub struct CloudPolicy {
    /// Cloud engine entitled by the license service
    pub entitled: bool,
    /// Cloud translation enabled in settings
    pub enabled: bool,
    /// Local-only mode forced in settings
    pub local_only: bool,
    /// Session token issued by the entitlement service
    pub session_token: Option<String>,
}

impl CloudPolicy {
    /// Entitled, enabled, not local-only, pixel data present, token present.
    pub fn permits(&self, frame: &Frame) -> bool {
        self.entitled
            && self.enabled
            && !self.local_only
            && frame.has_pixels()
            && self.session_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// State of the cloud side of one iteration
pub enum CloudFork {
    /// Cache already holds the result; no task was spawned
    CacheHit(CloudTranslationResult),
    /// Cloud child running in parallel with OCR
    InFlight(CloudForkHandle),
    /// Preconditions failed; local-only this round
    Skipped,
}

impl CloudFork {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CloudFork::InFlight(_))
    }
}

/// Handle to a spawned cloud child
pub struct CloudForkHandle {
    window: WindowHandle,
    hash: u64,
    cancel: CancellationToken,
    join: JoinHandle<Result<CloudTranslationResult, CloudError>>,
}

/// Starts, joins, and cancels cloud children; owns the result cache
pub struct ForkJoinCoordinator {
    task: CloudTranslationTask,
    cache: Arc<CloudResultCache>,
    metrics: Arc<MetricsRegistry>,
}

impl ForkJoinCoordinator {
    pub fn new(
        client: Arc<dyn FallbackClient>,
        cache: Arc<CloudResultCache>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            task: CloudTranslationTask::new(client),
            cache,
            metrics,
        }
    }

    /// Replace the task (tests shorten the timeout through this).
    pub fn with_task(mut self, task: CloudTranslationTask) -> Self {
        self.task = task;
        self
    }

    pub fn cache(&self) -> &Arc<CloudResultCache> {
        &self.cache
    }

    /// Start the cloud side of an iteration.
    ///
    /// Checks the cache first; on a miss and with the preconditions
    /// satisfied, spawns the call on a child token of `iteration` so a
    /// cancelled iteration tears the child down with it.
    pub fn begin(
        &self,
        frame: &Frame,
        policy: &CloudPolicy,
        target_language: &str,
        iteration: &CancellationToken,
    ) -> CloudFork {
        let window = frame.window_handle;
        let hash = frame_hash(frame);

        if let Some(result) = self.cache.get(window, hash) {
            self.metrics.increment(metric_names::CLOUD_CACHE_HITS);
            debug!(window, hash, "cloud cache hit, skipping endpoint call");
            return CloudFork::CacheHit(result);
        }

        if !policy.permits(frame) {
            return CloudFork::Skipped;
        }
        self.metrics.increment(metric_names::CLOUD_CACHE_MISSES);

        let payload = match encode_cloud_payload(frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(window, error = %e, "cloud payload encoding failed, skipping fork");
                return CloudFork::Skipped;
            }
        };

        let cancel = iteration.child_token();
        let task = self.task.clone();
        let target = target_language.to_string();
        let token = policy.session_token.clone().unwrap_or_default();
        let metrics = Arc::clone(&self.metrics);
        let child_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let span = metrics.span(metric_names::CLOUD_MS);
            let outcome = task.run(payload, &target, &token, &child_cancel).await;
            span.finish();
            outcome
        });

        CloudFork::InFlight(CloudForkHandle {
            window,
            hash,
            cancel,
            join,
        })
    }

    /// Cancel the child and wait until it has released the session token.
    /// Waiting matters for disposal ordering: the iteration must not return
    /// while the child still holds shared resources.
    pub async fn cancel_and_discard(&self, fork: CloudFork) {
        if let CloudFork::InFlight(handle) = fork {
            handle.cancel.cancel();
            let _ = handle.join.await;
            debug!(window = handle.window, "cloud child cancelled and discarded");
        }
    }

    /// Wait for the cloud side. Errors degrade to `None`: a failed cloud
    /// call never fails the iteration, it only means no augmentation.
    pub async fn join(&self, fork: CloudFork) -> Option<CloudTranslationResult> {
        match fork {
            CloudFork::CacheHit(result) => Some(result),
            CloudFork::Skipped => None,
            CloudFork::InFlight(handle) => match handle.join.await {
                Ok(Ok(result)) => {
                    if result.success {
                        self.cache.insert(handle.window, handle.hash, result.clone());
                    }
                    Some(result)
                }
                Ok(Err(CloudError::Cancelled)) => None,
                Ok(Err(e)) => {
                    warn!(window = handle.window, error = %e, "cloud translation failed");
                    None
                }
                Err(e) => {
                    warn!(window = handle.window, error = %e, "cloud child panicked");
                    None
                }
            },
        }
    }
}
