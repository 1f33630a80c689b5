//! Screen Capture Layer
//!
//! The native capture driver lives outside this crate; this module defines
//! the contract the orchestrator consumes. Capture is a read-only operation
//! that produces timestamped frames without touching the target process.

pub mod change;
pub mod frame;

use thiserror::Error;

pub use frame::{Frame, WindowHandle};

/// Options forwarded to the capture driver
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Quality hint for drivers that compress or downsample (1 - 100)
    pub quality: u8,
    /// Capture the cursor in frames
    pub include_cursor: bool,
    /// Driver-side capture interval in milliseconds
    pub interval_ms: u32,
    /// Driver optimization level (0 = off)
    pub optimization_level: u8,
    /// Margin applied around a learned region of interest
    pub roi_scale_factor: f32,
    /// Learned region of interest in original-window pixels, when available
    pub region_of_interest: Option<crate::geometry::Rect>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            quality: 85,
            include_cursor: false,
            interval_ms: 100,
            optimization_level: 1,
            roi_scale_factor: 1.2,
            region_of_interest: None,
        }
    }
}

impl CaptureOptions {
    /// Build options from the capture section of the settings file
    pub fn from_settings(settings: &crate::config::CaptureSettings) -> Self {
        Self {
            quality: settings.quality,
            include_cursor: settings.include_cursor,
            interval_ms: settings.interval_ms,
            optimization_level: settings.optimization_level,
            roi_scale_factor: settings.roi_scale_factor,
            region_of_interest: None,
        }
    }
}

/// Capture failures surfaced to the orchestrator
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The target window no longer exists
    #[error("capture target window is gone")]
    WindowGone,
    /// The driver is not available on this system
    #[error("capture driver unavailable: {0}")]
    DriverUnavailable(String),
    /// Any other driver-reported failure
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Contract of the native capture driver
///
/// Implementations block; the orchestrator calls them through a blocking
/// task so capture I/O never stalls the async scheduler.
pub trait CaptureDriver: Send + Sync {
    /// Capture a frame of the given window
    fn capture_window(&self, handle: WindowHandle) -> Result<Frame, CaptureError>;

    /// Capture a frame of the primary screen
    fn capture_screen(&self) -> Result<Frame, CaptureError>;

    /// Update driver-side options; takes effect on the next capture
    fn set_capture_options(&self, options: CaptureOptions);
}
