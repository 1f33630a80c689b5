//! Vision/OCR Layer
//!
//! Turns captured frames into ordered text chunks with pixel-space bounds.
//! The GPU inference engine itself lives outside this crate behind the
//! [`OcrBackend`] trait; this module owns request serialization,
//! latest-wins cancellation, spatial ordering, and text grouping.

pub mod roi;
pub mod text_gate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capture::frame::{Frame, WindowHandle};
use crate::config::{OcrSettings, TranslationSettings};
use crate::geometry::Rect;

/// Soft ceiling for engine warmup; crossing it logs and keeps waiting.
const WARMUP_SOFT_TIMEOUT: Duration = Duration::from_secs(10);

/// Well-known transient error signatures, matched by the orchestrator's
/// backoff ladder.
pub mod signatures {
    pub const PADDLE_PREDICTOR: &str = "paddle_predictor";
    pub const RUN_FAILED: &str = "run_failed";
}

/// Detected text region from OCR
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TextRegion {
    /// Detected text content
    pub text: String,
    /// Bounding box in original-window pixels
    pub bounds: Rect,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    /// Language the engine detected for this region, if any
    pub detected_language: Option<String>,
}

/// A group of text regions treated as one utterance
///
/// `combined_bounds` is always the axis-aligned hull of the member region
/// bounds; `chunk_id` is unique across the process lifetime.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TextChunk {
    /// Process-unique monotonic identifier
    pub chunk_id: u64,
    /// Member texts joined in reading order
    pub combined_text: String,
    /// Hull of all member region bounds, in original-window pixels
    pub combined_bounds: Rect,
    /// Window the text was detected on
    pub source_window_handle: WindowHandle,
    /// Screen-space region of the frame, for ROI captures
    pub capture_region: Option<Rect>,
    /// Member regions in reading order
    pub regions: Vec<TextRegion>,
    /// Translation attached later by the dispatch stage
    pub translated_text: Option<String>,
}

impl TextChunk {
    /// Hull invariant: `combined_bounds` must equal the hull of the member
    /// bounds and may not extend into negative coordinates.
    pub fn bounds_are_consistent(&self) -> bool {
        if !self.combined_bounds.is_non_negative() {
            return false;
        }
        match Rect::hull(&self.regions.iter().map(|r| r.bounds).collect::<Vec<_>>()) {
            Some(hull) => hull == self.combined_bounds,
            None => true, // synthetic chunks carry no member regions
        }
    }
}

/// Ordered OCR output for one frame
#[derive(Debug, Clone, Default)]
pub struct OcrResult {
    /// Chunks sorted top-to-bottom, then left-to-right
    pub chunks: Vec<TextChunk>,
    /// Wall time spent in recognition
    pub processing_time_ms: u64,
}

impl OcrResult {
    /// All chunk texts joined with newlines, for the text-change gate.
    pub fn combined_text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.combined_text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// OCR failures
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    /// Engine failed to initialize
    #[error("OCR engine initialization failed: {0}")]
    InitFailed(String),
    /// Inference exceeded its deadline
    #[error("OCR timed out")]
    Timeout,
    /// An earlier invocation for the same engine is still in flight
    #[error("OCR engine busy")]
    EngineBusy,
    /// The request was cancelled before inference ran
    #[error("OCR canceled")]
    Canceled,
    /// Recoverable failure; the orchestrator retries once after a backoff
    #[error("transient OCR failure ({signature}): {message}")]
    Transient { signature: String, message: String },
    /// Unrecoverable failure; surfaced to the caller
    #[error("fatal OCR failure: {0}")]
    Fatal(String),
}

impl OcrError {
    /// Signature used by the orchestrator to spot repeated transient failures.
    pub fn transient_signature(&self) -> Option<&str> {
        match self {
            OcrError::Transient { signature, .. } => Some(signature),
            _ => None,
        }
    }
}

/// Contract of the external OCR inference engine
///
/// Implementations block (CPU/GPU-bound); the facade dispatches them on a
/// blocking-friendly executor. Bounds in returned regions are in the
/// frame's capture pixel space; the facade performs all back-mapping.
pub trait OcrBackend: Send + Sync {
    /// One-time engine initialization
    fn initialize(&self, settings: &OcrSettings) -> Result<(), OcrError>;

    /// Apply updated settings to an initialized engine
    fn apply_settings(&self, settings: &OcrSettings) -> Result<(), OcrError>;

    /// Run recognition over the frame, optionally restricted to a ROI
    fn recognize(&self, frame: &Frame, roi: Option<Rect>) -> Result<Vec<TextRegion>, OcrError>;

    /// Ask the engine to abandon its current inference deadline
    fn cancel_current_timeout(&self);

    /// Engine display name
    fn engine_name(&self) -> &str;

    /// Whether `initialize` has completed
    fn is_initialized(&self) -> bool;
}

/// How OCR regions merge into chunks
#[derive(Debug, Clone)]
pub struct GroupingConfig {
    /// Merge regions at all; disabled means one chunk per region
    pub enabled: bool,
    /// Merge lines into paragraph chunks
    pub preserve_paragraphs: bool,
    /// Vertical-center tolerance for same-line grouping, in line heights
    pub same_line_threshold: f32,
    /// Vertical gap that splits paragraphs, in line heights
    pub paragraph_separation_threshold: f32,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preserve_paragraphs: true,
            same_line_threshold: 0.5,
            paragraph_separation_threshold: 1.5,
        }
    }
}

impl GroupingConfig {
    pub fn from_settings(settings: &TranslationSettings) -> Self {
        Self {
            enabled: settings.enable_text_grouping,
            preserve_paragraphs: settings.preserve_paragraphs,
            same_line_threshold: settings.same_line_threshold,
            paragraph_separation_threshold: settings.paragraph_separation_threshold,
        }
    }
}

/// Facade over the OCR backend
///
/// Serializes inference through an engine lock, cancels the previous
/// request when a new one arrives (latest-wins), maps bounds back to
/// original-window pixels, sorts, groups, and assigns chunk ids.
pub struct OcrFacade {
    backend: Arc<dyn OcrBackend>,
    /// Serializes inference and settings updates on the single-owner engine
    engine_lock: tokio::sync::Mutex<()>,
    /// Cancellation handle of the most recent request
    current_request: Mutex<Option<CancellationToken>>,
    /// Process-wide chunk id source, shared with synthetic chunk creation
    chunk_ids: Arc<AtomicU64>,
    grouping: RwLock<GroupingConfig>,
    detection_threshold: RwLock<f32>,
}

impl OcrFacade {
    pub fn new(backend: Arc<dyn OcrBackend>, chunk_ids: Arc<AtomicU64>) -> Self {
        Self {
            backend,
            engine_lock: tokio::sync::Mutex::new(()),
            current_request: Mutex::new(None),
            chunk_ids,
            grouping: RwLock::new(GroupingConfig::default()),
            detection_threshold: RwLock::new(OcrSettings::default().detection_threshold),
        }
    }

    pub fn engine_name(&self) -> String {
        self.backend.engine_name().to_string()
    }

    /// Trip the in-flight request, if any, and the engine's own deadline.
    /// Used by the orchestrator's stop path so a blocking inference call
    /// cannot hold the loop past the stop ceiling.
    pub fn cancel_current(&self) {
        if let Some(token) = self.current_request.lock().take() {
            token.cancel();
        }
        self.backend.cancel_current_timeout();
    }

    /// Initialize the engine if needed. The warmup ceiling is soft: crossing
    /// it logs a warning and keeps waiting; only init failure is an error.
    pub async fn ensure_initialized(&self, settings: &OcrSettings) -> Result<(), OcrError> {
        if self.backend.is_initialized() {
            return Ok(());
        }
        let _engine = self.engine_lock.lock().await;
        if self.backend.is_initialized() {
            return Ok(());
        }
        let backend = Arc::clone(&self.backend);
        let settings = settings.clone();
        let mut init = tokio::task::spawn_blocking(move || backend.initialize(&settings));

        match tokio::time::timeout(WARMUP_SOFT_TIMEOUT, &mut init).await {
            Ok(joined) => joined.map_err(|e| OcrError::InitFailed(e.to_string()))?,
            Err(_) => {
                warn!(
                    timeout_s = WARMUP_SOFT_TIMEOUT.as_secs(),
                    "OCR warmup exceeded soft timeout, still waiting"
                );
                init.await.map_err(|e| OcrError::InitFailed(e.to_string()))?
            }
        }
    }

    /// Push updated settings to the engine and the grouping logic.
    pub async fn apply_settings(
        &self,
        ocr: &OcrSettings,
        translation: &TranslationSettings,
    ) -> Result<(), OcrError> {
        let _engine = self.engine_lock.lock().await;
        *self.detection_threshold.write() = ocr.detection_threshold;
        *self.grouping.write() = GroupingConfig::from_settings(translation);
        let backend = Arc::clone(&self.backend);
        let ocr = ocr.clone();
        tokio::task::spawn_blocking(move || backend.apply_settings(&ocr))
            .await
            .map_err(|e| OcrError::Fatal(e.to_string()))?
    }

    /// Recognize text on the frame.
    ///
    /// A new call trips the cancellation handle of the previous one before
    /// queueing on the engine lock, so per window at most one invocation is
    /// ever in flight and the latest request wins. Once inference has
    /// completed, a late cancellation no longer discards the result; the
    /// caller keeps the work already done.
    pub async fn recognize(
        &self,
        frame: Arc<Frame>,
        roi: Option<Rect>,
        cancel: &CancellationToken,
    ) -> Result<OcrResult, OcrError> {
        let my_token = cancel.child_token();
        {
            let mut slot = self.current_request.lock();
            if let Some(previous) = slot.replace(my_token.clone()) {
                previous.cancel();
                self.backend.cancel_current_timeout();
            }
        }

        let _engine = tokio::select! {
            guard = self.engine_lock.lock() => guard,
            _ = my_token.cancelled() => return Err(OcrError::Canceled),
        };
        if my_token.is_cancelled() {
            return Err(OcrError::Canceled);
        }

        let start = Instant::now();
        let backend = Arc::clone(&self.backend);
        let frame_for_inference = Arc::clone(&frame);
        let regions = tokio::task::spawn_blocking(move || {
            backend.recognize(&frame_for_inference, roi)
        })
        .await
        .map_err(|e| OcrError::Fatal(format!("OCR task panicked: {e}")))??;

        let threshold = *self.detection_threshold.read();
        let grouping = self.grouping.read().clone();
        let chunks = build_chunks(regions, &frame, threshold, &grouping, &self.chunk_ids);
        let processing_time_ms = start.elapsed().as_millis() as u64;

        debug!(
            window = frame.window_handle,
            chunks = chunks.len(),
            elapsed_ms = processing_time_ms,
            "OCR complete"
        );

        Ok(OcrResult {
            chunks,
            processing_time_ms,
        })
    }
}

/// Filter, back-map, sort, and group raw engine regions into chunks.
fn build_chunks(
    regions: Vec<TextRegion>,
    frame: &Frame,
    detection_threshold: f32,
    grouping: &GroupingConfig,
    chunk_ids: &AtomicU64,
) -> Vec<TextChunk> {
    let mut regions: Vec<TextRegion> = regions
        .into_iter()
        .filter(|r| r.confidence >= detection_threshold && !r.text.trim().is_empty())
        .map(|mut r| {
            // Capture pixels -> original-window pixels, then ROI offset
            let mut bounds = frame.to_original_space(&r.bounds);
            if let Some(region) = &frame.capture_region {
                bounds = bounds.offset(region.x, region.y);
            }
            r.bounds = bounds;
            r
        })
        .collect();

    // Reading order: top-to-bottom, then left-to-right
    regions.sort_by(|a, b| {
        (a.bounds.center_y() as i32, a.bounds.x).cmp(&(b.bounds.center_y() as i32, b.bounds.x))
    });

    let groups: Vec<Vec<TextRegion>> = if grouping.enabled {
        let lines = group_into_lines(regions, grouping.same_line_threshold);
        if grouping.preserve_paragraphs {
            group_into_paragraphs(lines, grouping.paragraph_separation_threshold)
        } else {
            lines
        }
    } else {
        regions.into_iter().map(|r| vec![r]).collect()
    };

    let mut chunks: Vec<TextChunk> = groups
        .into_iter()
        .filter_map(|group| make_chunk(group, frame, grouping, chunk_ids))
        .collect();

    chunks.sort_by_key(|c| (c.combined_bounds.y, c.combined_bounds.x));
    chunks
}

/// Cluster regions whose vertical centers sit within the same-line tolerance.
fn group_into_lines(regions: Vec<TextRegion>, same_line_threshold: f32) -> Vec<Vec<TextRegion>> {
    let mut lines: Vec<Vec<TextRegion>> = Vec::new();

    for region in regions {
        let joined = match lines.last_mut() {
            Some(line) => {
                let line_bounds =
                    Rect::hull(&line.iter().map(|r| r.bounds).collect::<Vec<_>>()).unwrap();
                let reference_height = line_bounds.height.max(region.bounds.height).max(1) as f32;
                let delta = (region.bounds.center_y() - line_bounds.center_y()).abs();
                if delta <= same_line_threshold * reference_height {
                    line.push(region.clone());
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if !joined {
            lines.push(vec![region]);
        }
    }

    // Left-to-right inside each line
    for line in &mut lines {
        line.sort_by_key(|r| r.bounds.x);
    }
    lines
}

/// Merge consecutive lines separated by less than the paragraph gap.
fn group_into_paragraphs(
    lines: Vec<Vec<TextRegion>>,
    separation_threshold: f32,
) -> Vec<Vec<TextRegion>> {
    let mut paragraphs: Vec<Vec<TextRegion>> = Vec::new();

    for line in lines {
        let line_bounds = match Rect::hull(&line.iter().map(|r| r.bounds).collect::<Vec<_>>()) {
            Some(b) => b,
            None => continue,
        };
        let joined = match paragraphs.last_mut() {
            Some(para) => {
                let para_bounds =
                    Rect::hull(&para.iter().map(|r| r.bounds).collect::<Vec<_>>()).unwrap();
                let line_height = line_bounds.height.max(1) as f32;
                let gap = (line_bounds.top() - para_bounds.bottom()) as f32;
                if gap <= separation_threshold * line_height {
                    para.extend(line.iter().cloned());
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if !joined {
            paragraphs.push(line);
        }
    }
    paragraphs
}

/// Assemble one chunk from grouped regions, assigning the next chunk id.
fn make_chunk(
    regions: Vec<TextRegion>,
    frame: &Frame,
    grouping: &GroupingConfig,
    chunk_ids: &AtomicU64,
) -> Option<TextChunk> {
    let combined_bounds = Rect::hull(&regions.iter().map(|r| r.bounds).collect::<Vec<_>>())?;

    // Joined with spaces within a line; line breaks survive when paragraphs
    // are preserved (regions already arrive in reading order).
    let combined_text = if grouping.enabled && grouping.preserve_paragraphs {
        join_with_line_breaks(&regions)
    } else {
        regions
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };

    Some(TextChunk {
        chunk_id: chunk_ids.fetch_add(1, Ordering::Relaxed),
        combined_text,
        combined_bounds,
        source_window_handle: frame.window_handle,
        capture_region: frame.capture_region,
        regions,
        translated_text: None,
    })
}

/// Join region texts, inserting '\n' where the vertical step indicates a
/// new line inside the paragraph.
fn join_with_line_breaks(regions: &[TextRegion]) -> String {
    let mut out = String::new();
    let mut previous: Option<&TextRegion> = None;
    for region in regions {
        if let Some(prev) = previous {
            let line_step = region.bounds.center_y() - prev.bounds.center_y();
            let reference = prev.bounds.height.max(1) as f32 * 0.5;
            if line_step > reference {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
        out.push_str(&region.text);
        previous = Some(region);
    }
    out
}
