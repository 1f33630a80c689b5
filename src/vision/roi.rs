//! Region-of-interest learner
//!
//! Fire-and-forget sink fed from OCR detections. Remembers where text has
//! been appearing per window so the next capture can focus there. Nothing
//! upstream depends on it; failures are logged and swallowed.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::capture::frame::WindowHandle;
use crate::geometry::Rect;

/// One batch of detection positions for a window
#[derive(Debug, Clone)]
pub struct RoiObservation {
    pub window_handle: WindowHandle,
    pub window_title: String,
    pub executable_path: String,
    /// Detection bounds, normalized to original-window pixels
    pub rects: Vec<Rect>,
    /// Changed regions from the frame diff, when available
    pub changed_regions: Option<Vec<Rect>>,
}

/// Smoothed per-window interest rect
#[derive(Debug, Clone)]
struct LearnedRegion {
    rect: Rect,
    observations: u64,
}

/// Sink that records detection positions and suggests capture regions
#[derive(Debug)]
pub struct RoiLearner {
    regions: Mutex<HashMap<WindowHandle, LearnedRegion>>,
    /// Blend factor for new observations (0 = frozen, 1 = latest only)
    alpha: f32,
}

impl Default for RoiLearner {
    fn default() -> Self {
        Self::new()
    }
}

impl RoiLearner {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            alpha: 0.3,
        }
    }

    /// Record an observation. Never propagates failure upstream.
    pub fn record(&self, observation: RoiObservation) {
        let Some(mut hull) = Rect::hull(&observation.rects) else {
            // Nothing detected this round; keep what we have
            return;
        };
        if hull.is_empty() {
            warn!(
                window = observation.window_handle,
                "ignoring degenerate ROI observation"
            );
            return;
        }

        // Frame-diff regions that touch the detected text widen the hull:
        // text that is changing tends to reappear in the same area, while
        // unrelated motion elsewhere on screen stays out of the region
        if let Some(changed) = &observation.changed_regions {
            for region in changed {
                if region.intersection(&hull).is_some() {
                    hull = hull.union(region);
                }
            }
        }

        let mut regions = self.regions.lock();
        let entry = regions
            .entry(observation.window_handle)
            .and_modify(|learned| {
                learned.rect = blend(&learned.rect, &hull, self.alpha);
                learned.observations += 1;
            })
            .or_insert(LearnedRegion {
                rect: hull,
                observations: 1,
            });

        debug!(
            window = observation.window_handle,
            title = %observation.window_title,
            executable = %observation.executable_path,
            observations = entry.observations,
            "ROI updated"
        );
    }

    /// Suggested capture region for a window, expanded by the given margin.
    pub fn suggest(&self, window: WindowHandle, scale_factor: f32) -> Option<Rect> {
        let regions = self.regions.lock();
        let learned = regions.get(&window)?;
        Some(expand(&learned.rect, scale_factor))
    }

    /// Forget one window.
    pub fn clear_window(&self, window: WindowHandle) {
        self.regions.lock().remove(&window);
    }

    /// Forget everything.
    pub fn reset(&self) {
        self.regions.lock().clear();
    }
}

/// Exponential blend of the learned rect toward the new hull.
fn blend(learned: &Rect, new: &Rect, alpha: f32) -> Rect {
    let mix = |old: i32, new: i32| -> i32 {
        (old as f32 * (1.0 - alpha) + new as f32 * alpha).round() as i32
    };
    Rect::from_edges(
        mix(learned.left(), new.left()),
        mix(learned.top(), new.top()),
        mix(learned.right(), new.right()),
        mix(learned.bottom(), new.bottom()),
    )
}

/// Grow a rect around its center by `scale_factor`.
fn expand(rect: &Rect, scale_factor: f32) -> Rect {
    let factor = scale_factor.max(1.0);
    let extra_w = (rect.width as f32 * (factor - 1.0) / 2.0).round() as i32;
    let extra_h = (rect.height as f32 * (factor - 1.0) / 2.0).round() as i32;
    Rect::from_edges(
        (rect.left() - extra_w).max(0),
        (rect.top() - extra_h).max(0),
        rect.right() + extra_w,
        rect.bottom() + extra_h,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(window: WindowHandle, rects: Vec<Rect>) -> RoiObservation {
        RoiObservation {
            window_handle: window,
            window_title: "Game".to_string(),
            executable_path: "game.exe".to_string(),
            rects,
            changed_regions: None,
        }
    }

    #[test]
    fn test_first_observation_is_the_hull() {
        let learner = RoiLearner::new();
        learner.record(observation(
            1,
            vec![Rect::new(10, 10, 100, 20), Rect::new(10, 50, 150, 20)],
        ));
        let suggested = learner.suggest(1, 1.0).unwrap();
        assert_eq!(suggested, Rect::from_edges(10, 10, 160, 70));
    }

    #[test]
    fn test_empty_observation_is_ignored() {
        let learner = RoiLearner::new();
        learner.record(observation(1, vec![]));
        assert!(learner.suggest(1, 1.0).is_none());
    }

    #[test]
    fn test_overlapping_changed_regions_widen_hull() {
        let learner = RoiLearner::new();
        let mut obs = observation(1, vec![Rect::new(100, 100, 100, 40)]);
        // One diff region overlaps the text, one is unrelated motion
        obs.changed_regions = Some(vec![
            Rect::new(180, 90, 80, 60),
            Rect::new(600, 600, 50, 50),
        ]);
        learner.record(obs);

        let suggested = learner.suggest(1, 1.0).unwrap();
        // Widened by the overlapping region only
        assert_eq!(suggested, Rect::from_edges(100, 90, 260, 150));
    }

    #[test]
    fn test_disjoint_changed_regions_are_ignored() {
        let learner = RoiLearner::new();
        let mut obs = observation(1, vec![Rect::new(100, 100, 100, 40)]);
        obs.changed_regions = Some(vec![Rect::new(600, 600, 50, 50)]);
        learner.record(obs);

        assert_eq!(
            learner.suggest(1, 1.0).unwrap(),
            Rect::new(100, 100, 100, 40)
        );
    }

    #[test]
    fn test_repeated_observations_converge() {
        let learner = RoiLearner::new();
        learner.record(observation(1, vec![Rect::new(0, 0, 100, 100)]));
        for _ in 0..20 {
            learner.record(observation(1, vec![Rect::new(200, 200, 100, 100)]));
        }
        let suggested = learner.suggest(1, 1.0).unwrap();
        // After enough observations the learned rect sits at the new hull
        assert!((suggested.x - 200).abs() <= 2);
        assert!((suggested.y - 200).abs() <= 2);
    }

    #[test]
    fn test_scale_factor_expands_suggestion() {
        let learner = RoiLearner::new();
        learner.record(observation(1, vec![Rect::new(100, 100, 100, 100)]));
        let suggested = learner.suggest(1, 1.2).unwrap();
        assert_eq!(suggested, Rect::from_edges(90, 90, 210, 210));
    }

    #[test]
    fn test_reset_forgets_windows() {
        let learner = RoiLearner::new();
        learner.record(observation(1, vec![Rect::new(0, 0, 10, 10)]));
        learner.reset();
        assert!(learner.suggest(1, 1.0).is_none());
    }
}
