//! Translation Orchestrator
//!
//! Top-level loop that drives capture, change detection, OCR, fork-join
//! cloud translation, aggregation, and dispatch. Owns the lifecycle
//! (Stopped -> Running -> Stopping -> Stopped, Disposed terminal), the
//! per-window state maps, cooldown, screen stabilization, duplicate
//! suppression, and the OCR transient-error backoff ladder.
//!
//! Two cancellation tokens exist: an outer one spanning the service
//! lifetime and an inner one per iteration. The cloud child hangs off the
//! inner token, so stopping the service tears down everything in order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::change::{ChangeDetector, ChangeDetectorConfig, ChangeResult};
use crate::capture::frame::{Frame, WindowHandle};
use crate::capture::{CaptureDriver, CaptureError, CaptureOptions};
use crate::config::{canonicalize_language, EngineSettings};
use crate::events::{
    AggregatedChunksReady, DiagnosticSeverity, EventBus, PipelineEvent,
};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::pipeline::aggregator::{AggregatorConfig, ChunkAggregator};
use crate::pipeline::{
    PipelineError, PipelineInput, PipelineStage, PipelineStrategy, TranslationMode,
};
use crate::translate::cloud::FallbackClient;
use crate::translate::forkjoin::{CloudPolicy, ForkJoinCoordinator};
use crate::translate::{LocalTranslator, TranslationResponse, LOCAL_BATCH_TIMEOUT};
use crate::translate::cache::CloudResultCache;
use crate::vision::roi::RoiLearner;
use crate::vision::text_gate::TextChangeGate;
use crate::vision::{signatures, OcrBackend, OcrError, OcrFacade};

/// Ceiling on how long `stop` waits for the loop to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff before the single orchestrator-level retry of a transient OCR error.
const TRANSIENT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Extra cooldown applied after a repeated or engine-specific transient error.
const TRANSIENT_EXTRA_COOLDOWN: Duration = Duration::from_secs(2);
/// Window in which a third transient error degrades the loop interval.
const TRANSIENT_ESCALATION_WINDOW: Duration = Duration::from_secs(30);
/// How long the degraded interval floor stays in force.
const INTERVAL_FLOOR_DURATION: Duration = Duration::from_secs(60);
/// Interval floor while errors are recent.
const ERROR_INTERVAL_FLOOR: Duration = Duration::from_millis(500);
/// Interval floor after repeated transient errors.
const DEGRADED_INTERVAL_FLOOR: Duration = Duration::from_secs(1);
/// How long an error counts as "recent" for the interval clamp.
const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(60);

/// License/entitlement service contract
pub trait EntitlementProvider: Send + Sync {
    /// Whether the cloud engine is entitled for this install
    fn cloud_translation_entitled(&self) -> bool;
    /// Session token for cloud calls, when one is issued
    fn session_token(&self) -> Option<String>;
}

/// Fixed entitlements, for tests and local-only deployments
pub struct StaticEntitlements {
    pub entitled: bool,
    pub token: Option<String>,
}

impl EntitlementProvider for StaticEntitlements {
    fn cloud_translation_entitled(&self) -> bool {
        self.entitled
    }

    fn session_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Orchestrator lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Running,
    Stopping,
    Disposed,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Stopped => write!(f, "Stopped"),
            Lifecycle::Running => write!(f, "Running"),
            Lifecycle::Stopping => write!(f, "Stopping"),
            Lifecycle::Disposed => write!(f, "Disposed"),
        }
    }
}

/// Orchestrator failures surfaced to callers
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is disposed")]
    Disposed,
    #[error("capture driver failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("fatal OCR failure: {0}")]
    OcrFatal(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// How one iteration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Post-translation cooldown still in force
    SkippedCooldown,
    /// Frame identical to the previous one
    SkippedNoChange,
    /// Screen still in transition (stabilization hysteresis)
    SkippedStabilization,
    /// Capture failed this round
    CaptureFailed,
    /// OCR found no text
    NoText,
    /// Text-change gate rejected the result
    GateRejected,
    /// A transient OCR error consumed the iteration
    OcrErrored,
    /// Chunks were handed to the aggregator
    Completed,
}

/// Iteration-level failures that reach the loop
#[derive(Debug, Error)]
enum IterationError {
    #[error("iteration cancelled")]
    Cancelled,
    #[error("{0}")]
    Fatal(String),
}

/// Tracking state for the transient-error ladder
#[derive(Debug, Default)]
struct ErrorBackoff {
    last_signature: Option<String>,
    consecutive_same: u32,
    window_start: Option<Instant>,
    occurrences_in_window: u32,
    extra_cooldown_until: Option<Instant>,
    interval_floor_until: Option<Instant>,
    recent_error_until: Option<Instant>,
}

impl ErrorBackoff {
    /// Record one transient occurrence and apply the ladder.
    fn record(&mut self, signature: &str, now: Instant) {
        if self.last_signature.as_deref() == Some(signature) {
            self.consecutive_same += 1;
        } else {
            self.last_signature = Some(signature.to_string());
            self.consecutive_same = 1;
        }
        self.recent_error_until = Some(now + RECENT_ERROR_WINDOW);

        match self.window_start {
            Some(start) if now.duration_since(start) <= TRANSIENT_ESCALATION_WINDOW => {
                self.occurrences_in_window += 1;
            }
            _ => {
                self.window_start = Some(now);
                self.occurrences_in_window = 1;
            }
        }

        if self.consecutive_same >= 2 {
            self.extra_cooldown_until = Some(now + TRANSIENT_EXTRA_COOLDOWN);
        }
        if self.occurrences_in_window >= 3 {
            self.interval_floor_until = Some(now + INTERVAL_FLOOR_DURATION);
            warn!(
                signature,
                "third transient OCR error within 30s, degrading loop interval"
            );
        }
    }

    fn clear_consecutive(&mut self) {
        self.last_signature = None;
        self.consecutive_same = 0;
    }

    fn apply_extra_cooldown(&mut self, now: Instant) {
        self.extra_cooldown_until = Some(now + TRANSIENT_EXTRA_COOLDOWN);
    }
}

/// Per-window state that outlives individual iterations
#[derive(Default)]
struct SharedState {
    stabilization_active: Mutex<HashMap<WindowHandle, bool>>,
    previous_ocr_text: Mutex<HashMap<WindowHandle, String>>,
    previous_frame: Mutex<Option<Arc<Frame>>>,
    last_translation_completed_at: Mutex<Option<Instant>>,
    last_translated_text: Mutex<String>,
    backoff: Mutex<ErrorBackoff>,
    seen_chunk_ids: Mutex<HashSet<u64>>,
}

struct Inner {
    capture: Arc<dyn CaptureDriver>,
    ocr: Arc<OcrFacade>,
    local: Arc<dyn LocalTranslator>,
    entitlements: Arc<dyn EntitlementProvider>,
    forkjoin: ForkJoinCoordinator,
    strategy: PipelineStrategy,
    aggregator: Arc<ChunkAggregator>,
    gate: Arc<TextChangeGate>,
    roi: Arc<RoiLearner>,
    change_detector: ChangeDetector,
    events: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    settings: RwLock<EngineSettings>,
    cloud_enabled: bool,
    state: SharedState,
    lifecycle: Mutex<Lifecycle>,
    outer_token: Mutex<CancellationToken>,
    loop_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Drives the translation pipeline for one target window (or the screen)
pub struct TranslationOrchestrator {
    inner: Arc<Inner>,
}

impl TranslationOrchestrator {
    /// Wire up the orchestrator and its collaborators.
    pub fn new(
        capture: Arc<dyn CaptureDriver>,
        ocr_backend: Arc<dyn OcrBackend>,
        local: Arc<dyn LocalTranslator>,
        cloud_client: Arc<dyn FallbackClient>,
        entitlements: Arc<dyn EntitlementProvider>,
        settings: EngineSettings,
    ) -> Self {
        Self::with_aggregator_config(
            capture,
            ocr_backend,
            local,
            cloud_client,
            entitlements,
            settings,
            AggregatorConfig::default(),
        )
    }

    /// Same as [`Self::new`] with aggregation tuning exposed.
    pub fn with_aggregator_config(
        capture: Arc<dyn CaptureDriver>,
        ocr_backend: Arc<dyn OcrBackend>,
        local: Arc<dyn LocalTranslator>,
        cloud_client: Arc<dyn FallbackClient>,
        entitlements: Arc<dyn EntitlementProvider>,
        settings: EngineSettings,
        aggregator_config: AggregatorConfig,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let events = Arc::new(EventBus::new());
        let chunk_ids = Arc::new(AtomicU64::new(1));
        let gate = Arc::new(TextChangeGate::new());
        let roi = Arc::new(RoiLearner::new());
        let ocr = Arc::new(OcrFacade::new(ocr_backend, Arc::clone(&chunk_ids)));
        let aggregator = Arc::new(ChunkAggregator::new(
            aggregator_config,
            Arc::clone(&metrics),
            Arc::clone(&chunk_ids),
        ));
        let forkjoin = ForkJoinCoordinator::new(
            cloud_client,
            Arc::new(CloudResultCache::default()),
            Arc::clone(&metrics),
        );
        let change_detector = ChangeDetector::new(ChangeDetectorConfig::default());
        let strategy = PipelineStrategy::new(
            change_detector.clone(),
            Arc::clone(&ocr),
            Arc::clone(&gate),
            Arc::clone(&aggregator),
            Arc::clone(&roi),
            Arc::clone(&events),
            Arc::clone(&metrics),
        );

        Self {
            inner: Arc::new(Inner {
                capture,
                ocr,
                local,
                entitlements,
                forkjoin,
                strategy,
                aggregator,
                gate,
                roi,
                change_detector,
                events,
                metrics,
                settings: RwLock::new(settings),
                cloud_enabled: true,
                state: SharedState::default(),
                lifecycle: Mutex::new(Lifecycle::Stopped),
                outer_token: Mutex::new(CancellationToken::new()),
                loop_task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Event bus the core publishes on.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.events)
    }

    /// Pipeline metrics registry.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.inner.metrics)
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.lock()
    }

    /// Replace the settings snapshot; applies from the next iteration.
    pub async fn update_settings(&self, settings: EngineSettings) -> Result<(), OrchestratorError> {
        if self.lifecycle() == Lifecycle::Disposed {
            return Err(OrchestratorError::Disposed);
        }
        self.inner
            .ocr
            .apply_settings(&settings.ocr, &settings.translation)
            .await
            .map_err(|e| OrchestratorError::OcrFatal(e.to_string()))?;
        *self.inner.settings.write() = settings;
        Ok(())
    }

    /// Start the live loop for a window (`None` captures the primary screen).
    /// Starting while already running is a logged no-op.
    pub async fn start(&self, window: Option<WindowHandle>) -> Result<(), OrchestratorError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Disposed => return Err(OrchestratorError::Disposed),
                Lifecycle::Running | Lifecycle::Stopping => {
                    info!(state = %*lifecycle, "start requested while not stopped, ignoring");
                    return Ok(());
                }
                Lifecycle::Stopped => *lifecycle = Lifecycle::Running,
            }
        }

        let outer = CancellationToken::new();
        *self.inner.outer_token.lock() = outer.clone();

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            run_loop(inner, window, outer).await;
        });
        *self.inner.loop_task.lock().await = Some(handle);
        info!(window = ?window, "orchestrator started");
        Ok(())
    }

    /// Run one single-shot iteration in parallel with the live loop.
    /// Bypasses the text-change gate, stabilization, and cooldown.
    pub async fn trigger_single(
        &self,
        window: Option<WindowHandle>,
    ) -> Result<(), OrchestratorError> {
        match self.lifecycle() {
            Lifecycle::Disposed => return Err(OrchestratorError::Disposed),
            Lifecycle::Running => {}
            other => {
                info!(state = %other, "trigger_single outside Running, ignoring");
                return Ok(());
            }
        }

        let inner = Arc::clone(&self.inner);
        let outer = self.inner.outer_token.lock().clone();
        tokio::spawn(async move {
            let iteration = outer.child_token();
            match run_iteration(&inner, window, TranslationMode::SingleShot, &iteration).await {
                Ok(outcome) => debug!(?outcome, "single-shot iteration finished"),
                Err(IterationError::Cancelled) => debug!("single-shot iteration cancelled"),
                Err(IterationError::Fatal(message)) => {
                    error!(%message, "single-shot iteration failed fatally");
                }
            }
        });
        Ok(())
    }

    /// Stop the live loop. Returns within [`STOP_TIMEOUT`] even if an OCR
    /// call is mid-flight; in-flight work is cancelled, not awaited forever.
    /// Stopping while already stopped is a logged no-op.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Disposed => return Err(OrchestratorError::Disposed),
                Lifecycle::Stopped => {
                    info!("stop requested while already stopped, ignoring");
                    return Ok(());
                }
                Lifecycle::Stopping => return Ok(()),
                Lifecycle::Running => *lifecycle = Lifecycle::Stopping,
            }
        }

        self.inner.outer_token.lock().cancel();
        self.inner.ocr.cancel_current();

        if let Some(handle) = self.inner.loop_task.lock().await.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("loop did not wind down within the stop ceiling, detaching");
                }
            }
        }

        // No emission for the in-flight iteration: drop buffered chunks
        self.inner.aggregator.reset();
        self.clear_window_state();
        *self.inner.lifecycle.lock() = Lifecycle::Stopped;
        info!("orchestrator stopped");
        Ok(())
    }

    /// Clear per-window maps and caches. Idempotent.
    pub fn reset_state(&self) {
        self.clear_window_state();
        self.inner.forkjoin.cache().clear();
        self.inner.aggregator.reset();
        *self.inner.state.backoff.lock() = ErrorBackoff::default();
        info!("orchestrator state reset");
    }

    /// Tear everything down. Terminal; all later calls fail with
    /// [`OrchestratorError::Disposed`]. Double-dispose is a silent no-op.
    pub async fn dispose(&self) -> Result<(), OrchestratorError> {
        if self.lifecycle() == Lifecycle::Disposed {
            return Ok(());
        }
        if self.lifecycle() == Lifecycle::Running {
            self.stop().await?;
        }
        // Release in reverse acquisition order: aggregator buffers, then
        // the cloud cache, then the OCR request slot
        self.inner.aggregator.reset();
        self.inner.forkjoin.cache().clear();
        self.inner.ocr.cancel_current();
        self.clear_window_state();
        *self.inner.lifecycle.lock() = Lifecycle::Disposed;
        info!("orchestrator disposed");
        Ok(())
    }

    fn clear_window_state(&self) {
        let state = &self.inner.state;
        state.stabilization_active.lock().clear();
        state.previous_ocr_text.lock().clear();
        *state.previous_frame.lock() = None;
        *state.last_translated_text.lock() = String::new();
        self.inner.gate.reset();
        self.inner.roi.reset();
    }
}

impl Inner {
    /// Loop interval with the error clamps applied.
    fn current_interval(&self, now: Instant) -> Duration {
        let configured =
            Duration::from_millis(self.settings.read().translation.auto_translation_interval_ms as u64);
        let backoff = self.state.backoff.lock();
        let mut interval = configured;
        if backoff
            .recent_error_until
            .is_some_and(|until| now < until)
        {
            interval = interval.max(ERROR_INTERVAL_FLOOR);
        }
        if backoff
            .interval_floor_until
            .is_some_and(|until| now < until)
        {
            interval = interval.max(DEGRADED_INTERVAL_FLOOR);
        }
        interval
    }

    /// Whether the post-translation cooldown (plus any transient-error
    /// extension) still blocks the next live iteration.
    fn in_cooldown(&self, now: Instant) -> bool {
        let cooldown =
            Duration::from_secs(self.settings.read().translation.post_translation_cooldown_seconds as u64);
        let completed = self.state.last_translation_completed_at.lock();
        if let Some(at) = *completed {
            if now.duration_since(at) < cooldown {
                return true;
            }
        }
        drop(completed);
        self.state
            .backoff
            .lock()
            .extra_cooldown_until
            .is_some_and(|until| now < until)
    }

    /// Stabilization hysteresis. Returns true when the iteration must be
    /// skipped because the screen is still in transition.
    fn stabilization_should_skip(&self, window: WindowHandle, change: f32) -> bool {
        let settings = self.settings.read();
        let hi = settings.image_change.screen_stabilization_threshold;
        let lo = settings.image_change.screen_stabilization_recovery_threshold;
        drop(settings);

        let mut active_map = self.state.stabilization_active.lock();
        let active = active_map.get(&window).copied().unwrap_or(false);

        // Strictly-greater on both edges: exactly-at-threshold proceeds
        if (active && change > lo) || (!active && change > hi) {
            active_map.insert(window, true);
            return true;
        }
        if active {
            active_map.insert(window, false);
            debug!(window, change, "screen stabilized, resuming");
        }
        false
    }

    fn publish_diagnostic(
        &self,
        stage: PipelineStage,
        severity: DiagnosticSeverity,
        session_id: Uuid,
        message: impl Into<String>,
    ) {
        self.events.publish(PipelineEvent::PipelineDiagnostic {
            stage,
            is_success: severity == DiagnosticSeverity::Info,
            processing_time_ms: 0,
            session_id,
            severity,
            message: message.into(),
            metrics: self.metrics.counters_snapshot(),
        });
    }
}

/// The live loop task.
async fn run_loop(inner: Arc<Inner>, window: Option<WindowHandle>, outer: CancellationToken) {
    let ocr_settings = inner.settings.read().ocr.clone();
    if let Err(e) = inner.ocr.ensure_initialized(&ocr_settings).await {
        error!(error = %e, "OCR engine failed to initialize, stopping");
        inner.publish_diagnostic(
            PipelineStage::Ocr,
            DiagnosticSeverity::Error,
            Uuid::new_v4(),
            format!("OCR initialization failed: {e}"),
        );
        *inner.lifecycle.lock() = Lifecycle::Stopped;
        return;
    }

    info!(window = ?window, "live loop running");
    loop {
        if outer.is_cancelled() {
            break;
        }

        // Time-triggered aggregator batches from earlier iterations
        if let Err(e) = dispatch_ready(&inner).await {
            error!(error = %e, "dispatch failed fatally, stopping loop");
            inner.publish_diagnostic(
                PipelineStage::Dispatch,
                DiagnosticSeverity::Error,
                Uuid::new_v4(),
                e.to_string(),
            );
            break;
        }

        let iteration_started = Instant::now();
        let iteration = outer.child_token();
        match run_iteration(&inner, window, TranslationMode::Live, &iteration).await {
            Ok(outcome) => {
                debug!(?outcome, "iteration finished");
            }
            Err(IterationError::Cancelled) => {
                if outer.is_cancelled() {
                    // Clean exit: a stop was requested
                    break;
                }
                inner.metrics.increment(metric_names::ITERATIONS_CANCELLED);
                debug!("iteration cancelled without stop request, continuing");
            }
            Err(IterationError::Fatal(message)) => {
                error!(%message, "fatal iteration failure, stopping loop");
                inner.publish_diagnostic(
                    PipelineStage::Ocr,
                    DiagnosticSeverity::Error,
                    Uuid::new_v4(),
                    message,
                );
                break;
            }
        }
        inner.metrics.record_ms(
            metric_names::ITERATION_MS,
            iteration_started.elapsed().as_secs_f64() * 1000.0,
        );

        let interval = inner.current_interval(Instant::now());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = outer.cancelled() => break,
        }
    }

    // Loop may exit on its own (fatal error); reflect that in the lifecycle
    // unless a stop/dispose is already driving the transition.
    let mut lifecycle = inner.lifecycle.lock();
    if *lifecycle == Lifecycle::Running {
        *lifecycle = Lifecycle::Stopped;
    }
    info!("live loop exited");
}

/// One pass of the per-iteration algorithm.
async fn run_iteration(
    inner: &Arc<Inner>,
    window: Option<WindowHandle>,
    mode: TranslationMode,
    iteration: &CancellationToken,
) -> Result<IterationOutcome, IterationError> {
    let now = Instant::now();
    let session_id = Uuid::new_v4();

    // 1. Post-translation cooldown (live mode only; single shots are
    //    explicit user actions)
    if mode == TranslationMode::Live && inner.in_cooldown(now) {
        inner
            .metrics
            .increment(metric_names::ITERATIONS_SKIPPED_COOLDOWN);
        return Ok(IterationOutcome::SkippedCooldown);
    }

    // 2. Capture, with the learned ROI offered to the driver
    let frame = match capture_frame(inner, window).await? {
        Some(frame) => frame,
        None => return Ok(IterationOutcome::CaptureFailed),
    };
    let handle = frame.window_handle;
    inner.events.publish(PipelineEvent::CaptureCompleted {
        frame: Arc::clone(&frame),
        window: handle,
        timestamp: frame.captured_at,
    });

    // 3. Diff against the previous frame. In live mode the baseline
    //    advances on every diffed frame so hysteresis sees frame-to-frame
    //    change; single shots must not disturb the live baseline.
    let previous = {
        let mut slot = inner.state.previous_frame.lock();
        if mode == TranslationMode::Live {
            slot.replace(Arc::clone(&frame))
        } else {
            slot.clone()
        }
    };
    let change = inner.change_detector.detect(&frame, previous.as_deref());
    if mode == TranslationMode::Live && change.change_percentage == 0.0 {
        return Ok(IterationOutcome::SkippedNoChange);
    }

    // 4. Stabilization hysteresis, only with an OCR baseline to protect
    if mode == TranslationMode::Live
        && inner.state.previous_ocr_text.lock().contains_key(&handle)
        && inner.stabilization_should_skip(handle, change.change_percentage)
    {
        inner
            .metrics
            .increment(metric_names::ITERATIONS_SKIPPED_STABILIZATION);
        debug!(
            window = handle,
            change = change.change_percentage,
            "screen in transition, skipping iteration"
        );
        return Ok(IterationOutcome::SkippedStabilization);
    }

    // 5. Start the cloud fork before OCR so both run in parallel
    let (target_language, policy) = {
        let settings = inner.settings.read();
        let target_language = canonicalize_language(&settings.translation.target_language);
        let policy = CloudPolicy {
            entitled: inner.entitlements.cloud_translation_entitled(),
            enabled: inner.cloud_enabled,
            local_only: settings.translation.use_local_engine,
            session_token: inner.entitlements.session_token(),
        };
        (target_language, policy)
    };
    let fork = inner
        .forkjoin
        .begin(&frame, &policy, &target_language, iteration);

    // 6. Pipeline strategy (change detect is pre-computed above)
    let previous_text = inner.state.previous_ocr_text.lock().get(&handle).cloned();
    let input = PipelineInput {
        frame: Arc::clone(&frame),
        mode,
        previous_ocr_text: previous_text,
        pre_executed_ocr: None,
        pre_computed_change: Some(change.clone()),
        previous_frame: None,
        window_title: String::new(),
        executable_path: String::new(),
        session_id,
    };

    let result = match inner.strategy.execute(input, iteration).await {
        Ok(result) => result,
        Err(PipelineError::Cancelled) => {
            inner.forkjoin.cancel_and_discard(fork).await;
            return Err(IterationError::Cancelled);
        }
        Err(PipelineError::Ocr(e)) => {
            inner.forkjoin.cancel_and_discard(fork).await;
            return handle_ocr_error(inner, e, &frame, mode, change, session_id, iteration).await;
        }
    };

    // A healthy run clears the consecutive-error tracking
    inner.state.backoff.lock().clear_consecutive();

    // 7. Rejected or empty runs cancel the cloud child and end here
    if !result.accepted() {
        inner.forkjoin.cancel_and_discard(fork).await;
        return Ok(match result.last_completed_stage {
            Some(PipelineStage::Ocr) if result.ocr_result_text.is_empty() => {
                IterationOutcome::NoText
            }
            Some(PipelineStage::Ocr) => IterationOutcome::GateRejected,
            _ => IterationOutcome::SkippedNoChange,
        });
    }

    // 8. New accepted baseline for this window
    inner
        .state
        .previous_ocr_text
        .lock()
        .insert(handle, result.ocr_result_text.clone());

    // 9. Await the cloud side and attach it for the aggregator
    if let Some(cloud) = inner.forkjoin.join(fork).await {
        inner.aggregator.set_precomputed_cloud(handle, cloud);
    }

    // Single shots flush immediately instead of waiting out the window
    if mode == TranslationMode::SingleShot {
        if let Some(batch) = inner.aggregator.flush(handle, Instant::now()) {
            dispatch_batch(inner, batch).await?;
        }
    }

    Ok(IterationOutcome::Completed)
}

/// Capture one frame through the blocking driver.
async fn capture_frame(
    inner: &Arc<Inner>,
    window: Option<WindowHandle>,
) -> Result<Option<Arc<Frame>>, IterationError> {
    let capture = Arc::clone(&inner.capture);
    let settings = inner.settings.read().capture.clone();
    let mut options = CaptureOptions::from_settings(&settings);
    if let Some(handle) = window {
        options.region_of_interest = inner.roi.suggest(handle, settings.roi_scale_factor);
    }

    let result = tokio::task::spawn_blocking(move || {
        capture.set_capture_options(options);
        match window {
            Some(handle) => capture.capture_window(handle),
            None => capture.capture_screen(),
        }
    })
    .await
    .map_err(|e| IterationError::Fatal(format!("capture task panicked: {e}")))?;

    match result {
        Ok(frame) => Ok(Some(Arc::new(frame))),
        Err(CaptureError::DriverUnavailable(reason)) => {
            // Resource failure: no driver means no pipeline
            Err(IterationError::Fatal(format!(
                "capture driver unavailable: {reason}"
            )))
        }
        Err(e) => {
            warn!(error = %e, "capture failed, skipping iteration");
            Ok(None)
        }
    }
}

/// Escalation ladder for transient OCR failures: one retry after a short
/// backoff, extra cooldown on a repeat, degraded interval on a streak.
async fn handle_ocr_error(
    inner: &Arc<Inner>,
    error: OcrError,
    frame: &Arc<Frame>,
    mode: TranslationMode,
    change: ChangeResult,
    session_id: Uuid,
    iteration: &CancellationToken,
) -> Result<IterationOutcome, IterationError> {
    let now = Instant::now();
    let window = frame.window_handle;
    match error {
        OcrError::Canceled => Err(IterationError::Cancelled),
        OcrError::Fatal(message) | OcrError::InitFailed(message) => {
            Err(IterationError::Fatal(format!("OCR failure: {message}")))
        }
        OcrError::EngineBusy => {
            debug!(window, "OCR engine busy, skipping iteration");
            Ok(IterationOutcome::OcrErrored)
        }
        OcrError::Timeout => {
            inner.metrics.increment(metric_names::OCR_TRANSIENT_ERRORS);
            inner.state.backoff.lock().record("timeout", now);
            inner.publish_diagnostic(
                PipelineStage::Ocr,
                DiagnosticSeverity::Warning,
                session_id,
                "OCR timed out",
            );
            Ok(IterationOutcome::OcrErrored)
        }
        OcrError::Transient { signature, message } => {
            inner.metrics.increment(metric_names::OCR_TRANSIENT_ERRORS);
            inner.state.backoff.lock().record(&signature, now);

            // Engine-specific predictor faults skip publishing outright and
            // extend the cooldown instead of being retried in-iteration
            if signature == signatures::PADDLE_PREDICTOR || signature == signatures::RUN_FAILED {
                inner.state.backoff.lock().apply_extra_cooldown(now);
                inner.publish_diagnostic(
                    PipelineStage::Ocr,
                    DiagnosticSeverity::Warning,
                    session_id,
                    format!("OCR engine fault ({signature}): {message}"),
                );
                return Ok(IterationOutcome::OcrErrored);
            }

            // One orchestrator-level retry after a short backoff
            tokio::select! {
                _ = tokio::time::sleep(TRANSIENT_RETRY_BACKOFF) => {}
                _ = iteration.cancelled() => return Err(IterationError::Cancelled),
            }

            let retry_input = PipelineInput {
                frame: Arc::clone(frame),
                mode,
                previous_ocr_text: inner.state.previous_ocr_text.lock().get(&window).cloned(),
                pre_executed_ocr: None,
                pre_computed_change: Some(change),
                previous_frame: None,
                window_title: String::new(),
                executable_path: String::new(),
                session_id,
            };
            match inner.strategy.execute(retry_input, iteration).await {
                Ok(result) => {
                    inner.state.backoff.lock().clear_consecutive();
                    if result.accepted() {
                        inner
                            .state
                            .previous_ocr_text
                            .lock()
                            .insert(window, result.ocr_result_text.clone());
                        Ok(IterationOutcome::Completed)
                    } else {
                        Ok(IterationOutcome::OcrErrored)
                    }
                }
                Err(PipelineError::Cancelled) => Err(IterationError::Cancelled),
                Err(PipelineError::Ocr(retry_error)) => {
                    // Second failure in a row: extra cooldown, skip publishing
                    let retry_now = Instant::now();
                    let mut backoff = inner.state.backoff.lock();
                    if let Some(signature) = retry_error.transient_signature() {
                        backoff.record(signature, retry_now);
                    }
                    backoff.apply_extra_cooldown(retry_now);
                    drop(backoff);
                    inner.publish_diagnostic(
                        PipelineStage::Ocr,
                        DiagnosticSeverity::Warning,
                        session_id,
                        format!("OCR retry failed: {retry_error}"),
                    );
                    Ok(IterationOutcome::OcrErrored)
                }
            }
        }
    }
}

/// Dispatch all aggregator batches whose triggers have fired.
async fn dispatch_ready(inner: &Arc<Inner>) -> Result<(), IterationError> {
    let batches = inner.aggregator.take_ready(Instant::now());
    for batch in batches {
        dispatch_batch(inner, batch).await?;
    }
    Ok(())
}

/// Dispatch stage: local-translate what the cloud fusion left untranslated,
/// publish the batch and per-chunk completions, and update the completion
/// bookkeeping with byte-for-byte duplicate suppression.
async fn dispatch_batch(
    inner: &Arc<Inner>,
    mut batch: AggregatedChunksReady,
) -> Result<(), IterationError> {
    let window = batch.window;
    let session_id = Uuid::new_v4();
    let dispatch_started = Instant::now();

    verify_batch_invariants(inner, &batch)?;

    let (source_language, target_language) = {
        let settings = inner.settings.read();
        let source_language = canonicalize_language(&settings.translation.source_language);
        let target_language = canonicalize_language(&settings.translation.target_language);
        (source_language, target_language)
    };

    // Indexes of chunks the cloud did not cover
    let untranslated: Vec<usize> = batch
        .chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.translated_text.is_none() && !c.combined_text.is_empty())
        .map(|(i, _)| i)
        .collect();

    let mut local_failed = false;
    if !untranslated.is_empty() {
        let texts: Vec<String> = untranslated
            .iter()
            .map(|&i| batch.chunks[i].combined_text.clone())
            .collect();
        let local = Arc::clone(&inner.local);
        let src = source_language.clone();
        let tgt = target_language.clone();
        let batch_span = inner.metrics.span(metric_names::LOCAL_BATCH_MS);
        let translations = tokio::time::timeout(
            LOCAL_BATCH_TIMEOUT,
            tokio::task::spawn_blocking(move || local.translate_batch(&texts, &src, &tgt, None)),
        )
        .await;
        batch_span.finish();

        match translations {
            Ok(Ok(responses)) => {
                for (&chunk_index, response) in untranslated.iter().zip(responses.iter()) {
                    apply_local_response(&mut batch.chunks[chunk_index], response);
                }
                // Index-stable contract: a short response leaves the tail
                // untranslated, which we surface as explicit errors
                if responses.len() < untranslated.len() {
                    for &chunk_index in &untranslated[responses.len()..] {
                        apply_local_response(
                            &mut batch.chunks[chunk_index],
                            &TranslationResponse::failure("missing batch result"),
                        );
                    }
                }
            }
            Ok(Err(join_error)) => {
                warn!(error = %join_error, "local translation task panicked");
                local_failed = true;
            }
            Err(_) => {
                warn!("local batch translation exceeded its hard timeout");
                local_failed = true;
            }
        }
    }

    if local_failed {
        let failed_chunks = untranslated
            .iter()
            .map(|&i| batch.chunks[i].clone())
            .collect();
        inner.events.publish(PipelineEvent::AggregatedChunksFailed {
            session_id,
            window,
            failed_chunks,
            error: "local translation engine failed".to_string(),
            source_language,
            target_language,
        });
        return Ok(());
    }

    // Duplicate suppression: byte-for-byte against the last emitted text
    let combined_translation: String = batch
        .chunks
        .iter()
        .filter_map(|c| c.translated_text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");
    {
        let mut last = inner.state.last_translated_text.lock();
        let duplicate = !combined_translation.is_empty() && *last == combined_translation;
        *inner.state.last_translation_completed_at.lock() = Some(Instant::now());
        if duplicate {
            inner
                .metrics
                .increment(metric_names::DUPLICATES_SUPPRESSED);
            debug!(window, "translation identical to previous, suppressing");
            return Ok(());
        }
        *last = combined_translation;
    }

    // Per-chunk completion events, then the batch itself
    let local_engine = inner.local.engine_name().to_string();
    let cloud_engine = batch
        .cloud
        .as_ref()
        .map(|c| c.used_engine.clone())
        .unwrap_or_else(|| "cloud".to_string());
    for chunk in &batch.chunks {
        let Some(translated) = chunk.translated_text.as_ref() else {
            continue;
        };
        // Synthetic chunks and fused chunks came from the cloud side
        let is_fallback = chunk.regions.is_empty() || chunk.combined_text.is_empty();
        let confidence = chunk
            .regions
            .iter()
            .map(|r| r.confidence)
            .fold(f32::INFINITY, f32::min);
        inner
            .events
            .publish(PipelineEvent::TranslationWithBoundsCompleted {
                window,
                source_text: chunk.combined_text.clone(),
                translated_text: translated.clone(),
                bounds: chunk.combined_bounds,
                confidence: if confidence.is_finite() { confidence } else { 1.0 },
                engine_name: if is_fallback {
                    cloud_engine.clone()
                } else {
                    local_engine.clone()
                },
                is_fallback,
            });
    }

    inner
        .events
        .publish(PipelineEvent::AggregatedChunksReady(batch));
    let elapsed_ms = dispatch_started.elapsed().as_secs_f64() * 1000.0;
    inner.metrics.record_ms(metric_names::DISPATCH_MS, elapsed_ms);
    inner.events.publish(PipelineEvent::PipelineDiagnostic {
        stage: PipelineStage::Dispatch,
        is_success: true,
        processing_time_ms: elapsed_ms as u64,
        session_id,
        severity: DiagnosticSeverity::Info,
        message: "batch dispatched".to_string(),
        metrics: inner.metrics.counters_snapshot(),
    });
    Ok(())
}

/// Attach one local translation result to a chunk.
fn apply_local_response(chunk: &mut crate::vision::TextChunk, response: &TranslationResponse) {
    if response.is_success {
        chunk.translated_text = Some(response.translated_text.clone());
    } else {
        // Explicit error translation: empty text, error carried by events
        chunk.translated_text = Some(String::new());
    }
}

/// Chunk ids must never repeat and bounds must stay in the positive
/// quadrant; violations are fatal.
fn verify_batch_invariants(
    inner: &Arc<Inner>,
    batch: &AggregatedChunksReady,
) -> Result<(), IterationError> {
    let mut seen = inner.state.seen_chunk_ids.lock();
    for chunk in &batch.chunks {
        if !chunk.bounds_are_consistent() {
            return Err(IterationError::Fatal(format!(
                "invariant violation: chunk {} has inconsistent bounds",
                chunk.chunk_id
            )));
        }
        if !seen.insert(chunk.chunk_id) {
            return Err(IterationError::Fatal(format!(
                "invariant violation: chunk id {} reused",
                chunk.chunk_id
            )));
        }
    }
    // The id set only ever grows; cap the memory it can take
    if seen.len() > 100_000 {
        seen.clear();
    }
    Ok(())
}
