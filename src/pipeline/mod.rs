//! Pipeline Strategy
//!
//! Stage machine for one translation iteration:
//! `Capture -> ChangeDetect -> OCR -> Aggregate` (Dispatch happens in the
//! orchestrator once the aggregator triggers). Every stage can end the
//! iteration early; `early_terminated` separates a clean no-op from a
//! failure. Work the orchestrator already did (frame diff, OCR run during
//! capture) is reused instead of repeated.

pub mod aggregator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::capture::change::{ChangeDetector, ChangeResult};
use crate::capture::frame::Frame;
use crate::events::{DiagnosticSeverity, EventBus, ImageContext, PipelineEvent};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::vision::roi::{RoiLearner, RoiObservation};
use crate::vision::text_gate::TextChangeGate;
use crate::vision::{OcrError, OcrFacade, OcrResult};

use aggregator::ChunkAggregator;

/// Orchestrator operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationMode {
    /// Continuous loop at the configured interval
    Live,
    /// One iteration, bypassing change gating and stabilization
    SingleShot,
}

/// Stages of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Capture,
    ChangeDetect,
    Ocr,
    Aggregate,
    Dispatch,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Capture => write!(f, "Capture"),
            PipelineStage::ChangeDetect => write!(f, "ChangeDetect"),
            PipelineStage::Ocr => write!(f, "OCR"),
            PipelineStage::Aggregate => write!(f, "Aggregate"),
            PipelineStage::Dispatch => write!(f, "Dispatch"),
        }
    }
}

/// Everything one pipeline run needs
pub struct PipelineInput {
    pub frame: Arc<Frame>,
    pub mode: TranslationMode,
    /// Baseline text for this window, from the orchestrator's cache
    pub previous_ocr_text: Option<String>,
    /// OCR that already ran during capture; reused to avoid double inference
    pub pre_executed_ocr: Option<OcrResult>,
    /// Frame diff the orchestrator already computed for stabilization
    pub pre_computed_change: Option<ChangeResult>,
    /// Previous accepted frame, when the diff still has to run here
    pub previous_frame: Option<Arc<Frame>>,
    /// Capture metadata forwarded to the ROI learner
    pub window_title: String,
    pub executable_path: String,
    pub session_id: Uuid,
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub ocr_result: Option<OcrResult>,
    pub ocr_result_text: String,
    pub image_change: Option<ChangeResult>,
    pub should_continue: bool,
    /// A stage ended the run as a clean no-op rather than a failure
    pub early_terminated: bool,
    pub last_completed_stage: Option<PipelineStage>,
}

impl PipelineResult {
    /// The run produced an accepted batch that reached the aggregator.
    pub fn accepted(&self) -> bool {
        self.should_continue && self.last_completed_stage == Some(PipelineStage::Aggregate)
    }

    fn terminated_at(stage: Option<PipelineStage>, clean: bool) -> Self {
        Self {
            should_continue: false,
            early_terminated: clean,
            last_completed_stage: stage,
            ..Default::default()
        }
    }
}

/// Pipeline failures that reach the orchestrator
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The iteration token fired before inference started
    #[error("pipeline cancelled")]
    Cancelled,
    /// OCR failed; the orchestrator applies its backoff policy
    #[error(transparent)]
    Ocr(#[from] OcrError),
}

/// Executes the stage machine for one frame
pub struct PipelineStrategy {
    change_detector: ChangeDetector,
    ocr: Arc<OcrFacade>,
    gate: Arc<TextChangeGate>,
    aggregator: Arc<ChunkAggregator>,
    roi: Arc<RoiLearner>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
}

impl PipelineStrategy {
    pub fn new(
        change_detector: ChangeDetector,
        ocr: Arc<OcrFacade>,
        gate: Arc<TextChangeGate>,
        aggregator: Arc<ChunkAggregator>,
        roi: Arc<RoiLearner>,
        events: Arc<EventBus>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            change_detector,
            ocr,
            gate,
            aggregator,
            roi,
            events,
            metrics,
        }
    }

    pub fn aggregator(&self) -> &Arc<ChunkAggregator> {
        &self.aggregator
    }

    pub fn gate(&self) -> &Arc<TextChangeGate> {
        &self.gate
    }

    /// Run the stage machine over one frame.
    ///
    /// Cancellation is honored up to the moment inference starts; once OCR
    /// has completed, the rest of the run finishes even if the token fires,
    /// so parallel chunk work already in flight is not lost.
    pub async fn execute(
        &self,
        input: PipelineInput,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        let window = input.frame.window_handle;

        // --- Capture stage: the frame arrives pre-captured; validate it ---
        let capture_start = Instant::now();
        if !input.frame.has_pixels() {
            self.publish_stage(
                PipelineStage::Capture,
                false,
                capture_start,
                input.session_id,
                "frame has no pixel data",
            );
            return Ok(PipelineResult::terminated_at(None, false));
        }
        self.publish_stage(
            PipelineStage::Capture,
            true,
            capture_start,
            input.session_id,
            "frame validated",
        );

        // --- ChangeDetect stage ---
        let change_start = Instant::now();
        let image_change = match input.pre_computed_change {
            Some(change) => change,
            None => self
                .change_detector
                .detect(&input.frame, input.previous_frame.as_deref()),
        };
        self.metrics.record_ms(
            metric_names::CHANGE_DETECT_MS,
            change_start.elapsed().as_secs_f64() * 1000.0,
        );
        self.publish_stage(
            PipelineStage::ChangeDetect,
            true,
            change_start,
            input.session_id,
            "frame diff complete",
        );

        if input.mode == TranslationMode::Live && image_change.change_percentage == 0.0 {
            debug!(window, "no frame change, ending iteration early");
            let mut result =
                PipelineResult::terminated_at(Some(PipelineStage::ChangeDetect), true);
            result.image_change = Some(image_change);
            return Ok(result);
        }

        // --- OCR stage ---
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let ocr_start = Instant::now();
        let ocr_result = match input.pre_executed_ocr {
            Some(result) => result,
            None => {
                // ROI focus happens at capture time (the learner feeds the
                // driver's options); recognition always sees the full frame
                self.ocr
                    .recognize(Arc::clone(&input.frame), None, cancel)
                    .await?
            }
        };
        self.metrics.record_ms(
            metric_names::OCR_MS,
            ocr_start.elapsed().as_secs_f64() * 1000.0,
        );
        self.publish_stage(
            PipelineStage::Ocr,
            true,
            ocr_start,
            input.session_id,
            "recognition complete",
        );

        // Feed the ROI learner opportunistically; it never blocks the run
        if !ocr_result.is_empty() {
            self.roi.record(RoiObservation {
                window_handle: window,
                window_title: input.window_title.clone(),
                executable_path: input.executable_path.clone(),
                rects: ocr_result
                    .chunks
                    .iter()
                    .map(|c| c.combined_bounds)
                    .collect(),
                changed_regions: Some(image_change.changed_regions.clone()),
            });
        }

        let ocr_result_text = ocr_result.combined_text();
        if ocr_result.is_empty() {
            debug!(window, "OCR produced no chunks");
            let mut result = PipelineResult::terminated_at(Some(PipelineStage::Ocr), true);
            result.image_change = Some(image_change);
            result.ocr_result = Some(ocr_result);
            return Ok(result);
        }

        // --- Aggregate stage: text gate, then buffer ---
        let aggregate_start = Instant::now();
        let decision = self.gate.accept(window, &ocr_result_text, input.mode);
        if !decision.is_accepted() {
            self.metrics.increment(metric_names::GATE_REJECTIONS);
            self.publish_stage(
                PipelineStage::Aggregate,
                true,
                aggregate_start,
                input.session_id,
                "text unchanged, batch rejected",
            );
            let mut result = PipelineResult::terminated_at(Some(PipelineStage::Ocr), true);
            result.image_change = Some(image_change);
            result.ocr_result_text = ocr_result_text;
            result.ocr_result = Some(ocr_result);
            return Ok(result);
        }

        let accepted = self.aggregator.try_add_batch(
            window,
            ocr_result.chunks.clone(),
            ImageContext::from_frame(&input.frame),
            input.mode,
        );
        self.metrics.record_ms(
            metric_names::AGGREGATE_MS,
            aggregate_start.elapsed().as_secs_f64() * 1000.0,
        );
        self.publish_stage(
            PipelineStage::Aggregate,
            true,
            aggregate_start,
            input.session_id,
            "batch buffered",
        );
        debug!(window, accepted, "chunks handed to aggregator");

        Ok(PipelineResult {
            ocr_result: Some(ocr_result),
            ocr_result_text,
            image_change: Some(image_change),
            should_continue: true,
            early_terminated: false,
            last_completed_stage: Some(PipelineStage::Aggregate),
        })
    }

    fn publish_stage(
        &self,
        stage: PipelineStage,
        is_success: bool,
        started: Instant,
        session_id: Uuid,
        message: &str,
    ) {
        let severity = if is_success {
            DiagnosticSeverity::Info
        } else {
            DiagnosticSeverity::Error
        };
        self.events.publish(PipelineEvent::PipelineDiagnostic {
            stage,
            is_success,
            processing_time_ms: started.elapsed().as_millis() as u64,
            session_id,
            severity,
            message: message.to_string(),
            metrics: HashMap::new(),
        });
    }
}
