//! Chunk aggregator
//!
//! Buffers OCR chunks per window over a short interval so bursts of small
//! detections merge into one overlay update. Two triggers close a batch:
//! enough pending chunks, or the window timing out. The cloud result
//! computed in parallel is attached at trigger time, with its 0-1000
//! bounds mapped into original-window pixels and fused onto chunks by IoU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::capture::frame::WindowHandle;
use crate::events::{AggregatedChunksReady, ImageContext};
use crate::geometry::Rect;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::pipeline::TranslationMode;
use crate::translate::cloud::CloudTranslationResult;
use crate::vision::TextChunk;

/// Aggregation tuning
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Pending chunks that close a batch immediately
    pub size_trigger: usize,
    /// Batch window duration
    pub window: Duration,
    /// Hard cap on buffered chunks per window; excess is dropped
    pub max_pending: usize,
    /// Minimum IoU for a cloud translation to attach to a local chunk
    pub fusion_iou_threshold: f32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            size_trigger: 8,
            window: Duration::from_millis(300),
            max_pending: 64,
            fusion_iou_threshold: 0.4,
        }
    }
}

/// Buffer state for one window
struct WindowState {
    pending: Vec<TextChunk>,
    open_since: Option<Instant>,
    pre_computed_cloud: Option<CloudTranslationResult>,
    image_context: Option<ImageContext>,
    mode: TranslationMode,
}

impl WindowState {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            open_since: None,
            pre_computed_cloud: None,
            image_context: None,
            mode: TranslationMode::Live,
        }
    }
}

/// Per-window bounded chunk buffer with size and time triggers
pub struct ChunkAggregator {
    config: AggregatorConfig,
    windows: Mutex<HashMap<WindowHandle, WindowState>>,
    metrics: Arc<MetricsRegistry>,
    /// Shared with the OCR facade so synthetic chunks keep ids unique
    chunk_ids: Arc<AtomicU64>,
}

impl ChunkAggregator {
    pub fn new(
        config: AggregatorConfig,
        metrics: Arc<MetricsRegistry>,
        chunk_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            metrics,
            chunk_ids,
        }
    }

    /// Buffer a batch of chunks for a window.
    ///
    /// Returns how many were actually accepted. When the pending buffer is
    /// full the excess is dropped and counted, never treated as an error.
    pub fn try_add_batch(
        &self,
        window: WindowHandle,
        chunks: Vec<TextChunk>,
        image_context: ImageContext,
        mode: TranslationMode,
    ) -> usize {
        let mut windows = self.windows.lock();
        let state = windows.entry(window).or_insert_with(WindowState::new);
        state.image_context = Some(image_context);
        state.mode = mode;
        if state.open_since.is_none() {
            state.open_since = Some(Instant::now());
        }

        let room = self.config.max_pending.saturating_sub(state.pending.len());
        let accepted = chunks.len().min(room);
        let dropped = chunks.len() - accepted;
        state.pending.extend(chunks.into_iter().take(accepted));

        if dropped > 0 {
            self.metrics
                .add(metric_names::CHUNKS_DROPPED, dropped as u64);
            warn!(window, dropped, "aggregator buffer full, dropping chunks");
        }
        accepted
    }

    /// Attach the cloud result that the fork-join computed for this window.
    pub fn set_precomputed_cloud(&self, window: WindowHandle, result: CloudTranslationResult) {
        let mut windows = self.windows.lock();
        let state = windows.entry(window).or_insert_with(WindowState::new);
        state.pre_computed_cloud = Some(result);
    }

    /// Pending chunk count for a window.
    pub fn pending_len(&self, window: WindowHandle) -> usize {
        self.windows
            .lock()
            .get(&window)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    /// Collect batches whose size or time trigger has fired, in trigger
    /// order. Call regularly; the time trigger only fires when polled.
    pub fn take_ready(&self, now: Instant) -> Vec<AggregatedChunksReady> {
        let mut windows = self.windows.lock();
        let mut triggered: Vec<(Instant, WindowHandle)> = Vec::new();

        for (&window, state) in windows.iter() {
            if state.pending.is_empty() {
                continue;
            }
            let size_hit = state.pending.len() >= self.config.size_trigger;
            let time_hit = state
                .open_since
                .map(|open| now.duration_since(open) >= self.config.window)
                .unwrap_or(false);
            if size_hit || time_hit {
                triggered.push((state.open_since.unwrap_or(now), window));
            }
        }

        // Oldest batch first so emission follows trigger order
        triggered.sort_by_key(|&(open, window)| (open, window));
        triggered
            .into_iter()
            .filter_map(|(_, window)| {
                let state = windows.get_mut(&window)?;
                Some(self.build_event(window, state, now))
            })
            .collect()
    }

    /// Close a window's batch immediately, regardless of triggers.
    /// Single-shot iterations use this; an empty buffer yields nothing.
    pub fn flush(&self, window: WindowHandle, now: Instant) -> Option<AggregatedChunksReady> {
        let mut windows = self.windows.lock();
        let state = windows.get_mut(&window)?;
        if state.pending.is_empty() {
            return None;
        }
        Some(self.build_event(window, state, now))
    }

    /// Discard everything buffered for one window without emitting.
    pub fn discard_window(&self, window: WindowHandle) {
        self.windows.lock().remove(&window);
    }

    /// Discard all buffers without emitting.
    pub fn reset(&self) {
        self.windows.lock().clear();
    }

    /// Drain one window's state into a ready event, fusing the cloud result.
    fn build_event(
        &self,
        window: WindowHandle,
        state: &mut WindowState,
        now: Instant,
    ) -> AggregatedChunksReady {
        let mut chunks = std::mem::take(&mut state.pending);
        let cloud = state.pre_computed_cloud.take();
        let image_context = state.image_context.unwrap_or(ImageContext {
            original_width: 0,
            original_height: 0,
            width: 0,
            height: 0,
        });
        state.open_since = None;

        if let Some(result) = &cloud {
            if let Some(payload) = &result.response {
                let synthetic = fuse_cloud_translations(
                    &mut chunks,
                    &payload.translations,
                    &image_context,
                    self.config.fusion_iou_threshold,
                    window,
                    &self.chunk_ids,
                );
                chunks.extend(synthetic);
            }
        }

        debug!(
            window,
            chunks = chunks.len(),
            has_cloud = cloud.is_some(),
            "aggregated batch ready"
        );

        AggregatedChunksReady {
            window,
            chunks,
            cloud,
            image_context,
            mode: state.mode,
            triggered_at: now.into_std(),
        }
    }
}

/// Map cloud bounds to original pixels and attach each translation to the
/// best-overlapping chunk. Translations that match nothing become synthetic
/// chunks positioned by the cloud mapping alone.
fn fuse_cloud_translations(
    chunks: &mut [TextChunk],
    translations: &[crate::translate::cloud::CloudTranslationEntry],
    image_context: &ImageContext,
    iou_threshold: f32,
    window: WindowHandle,
    chunk_ids: &AtomicU64,
) -> Vec<TextChunk> {
    let mut synthetic = Vec::new();

    for entry in translations {
        let bounds = Rect::from_cloud_scale(
            &entry.bounds,
            image_context.original_width,
            image_context.original_height,
        );

        let best = chunks
            .iter_mut()
            .map(|chunk| {
                let iou = chunk.combined_bounds.iou(&bounds);
                (chunk, iou)
            })
            .filter(|(chunk, iou)| *iou >= iou_threshold && chunk.translated_text.is_none())
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((chunk, _)) => {
                chunk.translated_text = Some(entry.text.clone());
            }
            None => {
                synthetic.push(TextChunk {
                    chunk_id: chunk_ids.fetch_add(1, Ordering::Relaxed),
                    combined_text: String::new(),
                    combined_bounds: bounds,
                    source_window_handle: window,
                    capture_region: None,
                    regions: Vec::new(),
                    translated_text: Some(entry.text.clone()),
                });
            }
        }
    }

    synthetic.sort_by_key(|c| (c.combined_bounds.y, c.combined_bounds.x));
    synthetic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::cloud::{CloudResponsePayload, CloudTranslationEntry};

    fn aggregator(config: AggregatorConfig) -> ChunkAggregator {
        ChunkAggregator::new(
            config,
            Arc::new(MetricsRegistry::new()),
            Arc::new(AtomicU64::new(1000)),
        )
    }

    fn chunk(id: u64, text: &str, bounds: Rect) -> TextChunk {
        TextChunk {
            chunk_id: id,
            combined_text: text.to_string(),
            combined_bounds: bounds,
            source_window_handle: 1,
            capture_region: None,
            regions: Vec::new(),
            translated_text: None,
        }
    }

    fn context() -> ImageContext {
        ImageContext {
            original_width: 1000,
            original_height: 1000,
            width: 500,
            height: 500,
        }
    }

    fn cloud_with(entries: Vec<CloudTranslationEntry>) -> CloudTranslationResult {
        CloudTranslationResult {
            success: true,
            used_engine: "cloud".to_string(),
            response: Some(CloudResponsePayload {
                translations: entries,
                source_language: Some("ja".to_string()),
            }),
            error: None,
        }
    }

    #[test]
    fn test_size_trigger_fires() {
        let agg = aggregator(AggregatorConfig {
            size_trigger: 2,
            ..Default::default()
        });
        let now = Instant::now();

        agg.try_add_batch(
            1,
            vec![chunk(1, "a", Rect::new(0, 0, 10, 10))],
            context(),
            TranslationMode::Live,
        );
        assert!(agg.take_ready(now).is_empty());

        agg.try_add_batch(
            1,
            vec![chunk(2, "b", Rect::new(0, 20, 10, 10))],
            context(),
            TranslationMode::Live,
        );
        let ready = agg.take_ready(now);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].chunks.len(), 2);
        assert_eq!(agg.pending_len(1), 0);
    }

    #[test]
    fn test_time_trigger_fires() {
        let agg = aggregator(AggregatorConfig {
            size_trigger: 100,
            window: Duration::from_millis(300),
            ..Default::default()
        });
        let start = Instant::now();
        agg.try_add_batch(
            1,
            vec![chunk(1, "a", Rect::new(0, 0, 10, 10))],
            context(),
            TranslationMode::Live,
        );

        assert!(agg.take_ready(start + Duration::from_millis(100)).is_empty());
        let ready = agg.take_ready(start + Duration::from_millis(400));
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_backpressure_reports_accepted_count() {
        let agg = aggregator(AggregatorConfig {
            max_pending: 3,
            size_trigger: 100,
            ..Default::default()
        });
        let batch: Vec<TextChunk> = (0..5)
            .map(|i| chunk(i, "x", Rect::new(0, i as i32 * 20, 10, 10)))
            .collect();

        let accepted = agg.try_add_batch(1, batch, context(), TranslationMode::Live);
        assert_eq!(accepted, 3);
        assert_eq!(agg.pending_len(1), 3);
        assert_eq!(agg.metrics.counter(metric_names::CHUNKS_DROPPED), 2);
    }

    #[test]
    fn test_cloud_fusion_attaches_by_iou() {
        let agg = aggregator(AggregatorConfig {
            size_trigger: 1,
            ..Default::default()
        });
        // Chunk occupies (100,100)-(300,150) in original pixels
        agg.try_add_batch(
            1,
            vec![chunk(1, "こんにちは", Rect::new(100, 100, 200, 50))],
            context(),
            TranslationMode::Live,
        );
        // Cloud bounds on 0-1000 over a 1000px original map 1:1
        agg.set_precomputed_cloud(
            1,
            cloud_with(vec![CloudTranslationEntry {
                text: "Hello".to_string(),
                bounds: Rect::new(100, 100, 200, 50),
                confidence: 0.95,
            }]),
        );

        let ready = agg.take_ready(Instant::now());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].chunks.len(), 1);
        assert_eq!(ready[0].chunks[0].translated_text.as_deref(), Some("Hello"));
        assert!(ready[0].cloud.is_some());
    }

    #[test]
    fn test_unmatched_cloud_entry_becomes_synthetic_chunk() {
        let agg = aggregator(AggregatorConfig {
            size_trigger: 1,
            ..Default::default()
        });
        agg.try_add_batch(
            1,
            vec![chunk(1, "menu", Rect::new(0, 0, 50, 20))],
            context(),
            TranslationMode::Live,
        );
        agg.set_precomputed_cloud(
            1,
            cloud_with(vec![CloudTranslationEntry {
                text: "Options".to_string(),
                bounds: Rect::new(800, 800, 100, 40),
                confidence: 0.9,
            }]),
        );

        let ready = agg.take_ready(Instant::now());
        let chunks = &ready[0].chunks;
        assert_eq!(chunks.len(), 2);
        let synthetic = &chunks[1];
        assert!(synthetic.combined_text.is_empty());
        assert_eq!(synthetic.translated_text.as_deref(), Some("Options"));
        assert_eq!(synthetic.combined_bounds, Rect::new(800, 800, 100, 40));
        // Synthetic ids come from the shared counter, so they stay unique
        assert!(synthetic.chunk_id >= 1000);
    }

    #[test]
    fn test_flush_emits_immediately() {
        let agg = aggregator(AggregatorConfig {
            size_trigger: 100,
            window: Duration::from_secs(60),
            ..Default::default()
        });
        agg.try_add_batch(
            1,
            vec![chunk(1, "a", Rect::new(0, 0, 10, 10))],
            context(),
            TranslationMode::SingleShot,
        );
        let event = agg.flush(1, Instant::now()).unwrap();
        assert_eq!(event.mode, TranslationMode::SingleShot);
        assert!(agg.flush(1, Instant::now()).is_none());
    }

    #[test]
    fn test_windows_emit_in_trigger_order() {
        let agg = aggregator(AggregatorConfig {
            size_trigger: 100,
            window: Duration::from_millis(10),
            ..Default::default()
        });
        let start = Instant::now();
        agg.try_add_batch(
            2,
            vec![chunk(1, "older", Rect::new(0, 0, 10, 10))],
            context(),
            TranslationMode::Live,
        );
        std::thread::sleep(Duration::from_millis(5));
        agg.try_add_batch(
            1,
            vec![chunk(2, "newer", Rect::new(0, 0, 10, 10))],
            context(),
            TranslationMode::Live,
        );

        let ready = agg.take_ready(start + Duration::from_secs(1));
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].window, 2);
        assert_eq!(ready[1].window, 1);
    }

    #[test]
    fn test_reset_discards_pending() {
        let agg = aggregator(AggregatorConfig::default());
        agg.try_add_batch(
            1,
            vec![chunk(1, "a", Rect::new(0, 0, 10, 10))],
            context(),
            TranslationMode::Live,
        );
        agg.reset();
        assert!(agg.take_ready(Instant::now() + Duration::from_secs(10)).is_empty());
    }
}
