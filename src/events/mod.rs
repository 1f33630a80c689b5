//! Pipeline event bus
//!
//! Publish-only surface of the core. Downstream overlay logic subscribes
//! here; the core never waits on consumers. Publication is fire-and-forget
//! but in-order per window: events for one window arrive in the order they
//! were published.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::capture::frame::{Frame, WindowHandle};
use crate::geometry::Rect;
use crate::pipeline::{PipelineStage, TranslationMode};
use crate::translate::cloud::CloudTranslationResult;
use crate::vision::TextChunk;

/// Severity attached to diagnostic events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    Info,
    Warning,
    Error,
}

/// Original and downscaled dimensions, for coordinate mapping downstream
#[derive(Debug, Clone, Copy)]
pub struct ImageContext {
    pub original_width: u32,
    pub original_height: u32,
    pub width: u32,
    pub height: u32,
}

impl ImageContext {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            original_width: frame.original_width,
            original_height: frame.original_height,
            width: frame.width,
            height: frame.height,
        }
    }
}

/// One aggregated batch ready for display
#[derive(Debug, Clone)]
pub struct AggregatedChunksReady {
    pub window: WindowHandle,
    /// Chunks in spatial order, translations attached where known
    pub chunks: Vec<TextChunk>,
    /// Cloud result computed in parallel, when one arrived in time
    pub cloud: Option<CloudTranslationResult>,
    pub image_context: ImageContext,
    pub mode: TranslationMode,
    /// Trigger time; consumers rely on this being nondecreasing per window
    pub triggered_at: Instant,
}

/// Events published by the core
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A frame was captured
    CaptureCompleted {
        frame: Arc<Frame>,
        window: WindowHandle,
        timestamp: Instant,
    },
    /// Aggregated chunks are ready for the overlay
    AggregatedChunksReady(AggregatedChunksReady),
    /// A batch failed translation
    AggregatedChunksFailed {
        session_id: Uuid,
        window: WindowHandle,
        failed_chunks: Vec<TextChunk>,
        error: String,
        source_language: String,
        target_language: String,
    },
    /// One chunk finished translating
    TranslationWithBoundsCompleted {
        window: WindowHandle,
        source_text: String,
        translated_text: String,
        bounds: Rect,
        confidence: f32,
        engine_name: String,
        is_fallback: bool,
    },
    /// Stage-level diagnostics
    PipelineDiagnostic {
        stage: PipelineStage,
        is_success: bool,
        processing_time_ms: u64,
        session_id: Uuid,
        severity: DiagnosticSeverity,
        message: String,
        metrics: HashMap<String, f64>,
    },
}

impl PipelineEvent {
    /// Window the event concerns, when it concerns one.
    pub fn window(&self) -> Option<WindowHandle> {
        match self {
            PipelineEvent::CaptureCompleted { window, .. } => Some(*window),
            PipelineEvent::AggregatedChunksReady(ready) => Some(ready.window),
            PipelineEvent::AggregatedChunksFailed { window, .. } => Some(*window),
            PipelineEvent::TranslationWithBoundsCompleted { window, .. } => Some(*window),
            PipelineEvent::PipelineDiagnostic { .. } => None,
        }
    }
}

/// Fan-out bus for pipeline events
///
/// Slow or dropped subscribers never affect control flow: a send failure
/// unsubscribes the receiver and nothing else.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<PipelineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Delivery starts with the next publish.
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.write().push(tx);
        rx
    }

    /// Deliver an event to all live subscribers.
    pub fn publish(&self, event: PipelineEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnostic(message: &str) -> PipelineEvent {
        PipelineEvent::PipelineDiagnostic {
            stage: PipelineStage::Capture,
            is_success: true,
            processing_time_ms: 1,
            session_id: Uuid::new_v4(),
            severity: DiagnosticSeverity::Info,
            message: message.to_string(),
            metrics: HashMap::new(),
        }
    }

    #[test]
    fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.publish(diagnostic("first"));
        bus.publish(diagnostic("second"));

        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        match (first, second) {
            (
                PipelineEvent::PipelineDiagnostic { message: a, .. },
                PipelineEvent::PipelineDiagnostic { message: b, .. },
            ) => {
                assert_eq!(a, "first");
                assert_eq!(b, "second");
            }
            _ => panic!("unexpected event kinds"),
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);

        // Publish must neither fail nor keep the dead sender around
        bus.publish(diagnostic("after drop"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.publish(diagnostic("shared"));
        assert!(rx1.recv().is_ok());
        assert!(rx2.recv().is_ok());
    }
}
