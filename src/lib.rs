//! lingolay - real-time screen translation engine for games
//!
//! Captures a window's framebuffer, recognizes on-screen text via OCR,
//! translates it through parallel local and cloud engines, and publishes
//! positional overlay events. This crate is the orchestration core: capture
//! cadence, change detection, text aggregation, fork-join translation with
//! early cancellation, duplicate suppression, and lifecycle management.
//! The native capture driver, the OCR inference engine, the translation
//! engines, and the overlay renderer live behind the traits in their
//! respective modules.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use lingolay::config::EngineSettings;
//! # use lingolay::orchestrator::{StaticEntitlements, TranslationOrchestrator};
//! # async fn example(
//! #     capture: Arc<dyn lingolay::capture::CaptureDriver>,
//! #     ocr: Arc<dyn lingolay::vision::OcrBackend>,
//! #     local: Arc<dyn lingolay::translate::LocalTranslator>,
//! #     cloud: Arc<dyn lingolay::translate::cloud::FallbackClient>,
//! # ) -> anyhow::Result<()> {
//! let orchestrator = TranslationOrchestrator::new(
//!     capture,
//!     ocr,
//!     local,
//!     cloud,
//!     Arc::new(StaticEntitlements { entitled: true, token: None }),
//!     EngineSettings::default(),
//! );
//! let events = orchestrator.events().subscribe();
//! orchestrator.start(Some(0x2104)).await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod events;
pub mod geometry;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod translate;
pub mod vision;

pub use capture::frame::{Frame, WindowHandle};
pub use capture::CaptureDriver;
pub use config::EngineSettings;
pub use events::{EventBus, PipelineEvent};
pub use orchestrator::{TranslationOrchestrator, EntitlementProvider};
pub use pipeline::TranslationMode;
pub use translate::LocalTranslator;
pub use vision::{OcrBackend, OcrResult, TextChunk, TextRegion};
