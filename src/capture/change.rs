//! Frame change detection
//!
//! Compares a captured frame against the previous accepted frame for the
//! same window and reports how much of the screen changed, plus the regions
//! where the change is concentrated. Pure pixel math; no I/O.

use crate::capture::frame::Frame;
use crate::geometry::Rect;

/// Number of blocks per axis in the coarse diff grid.
const GRID_SIZE: u32 = 16;

/// Tunable kernel for the diff mask. Defaults: luma deltas of 12/255 or
/// less count as sensor noise; a block is "changed" when at least 12% of
/// its pixels moved past the noise floor.
#[derive(Debug, Clone)]
pub struct ChangeDetectorConfig {
    /// Luma delta at or below this value is treated as noise
    pub noise_floor: u8,
    /// Fraction of changed pixels that marks a grid block as changed
    pub block_change_fraction: f32,
}

impl Default for ChangeDetectorConfig {
    fn default() -> Self {
        Self {
            noise_floor: 12,
            block_change_fraction: 0.12,
        }
    }
}

/// Outcome of comparing two frames
#[derive(Debug, Clone, Default)]
pub struct ChangeResult {
    /// Fraction of pixels whose luma delta exceeded the noise floor (0.0 - 1.0)
    pub change_percentage: f32,
    /// Bounding rectangles of connected changed areas, in capture pixels
    pub changed_regions: Vec<Rect>,
}

impl ChangeResult {
    /// Result used when no baseline exists: everything counts as changed.
    pub fn full_change() -> Self {
        Self {
            change_percentage: 1.0,
            changed_regions: Vec::new(),
        }
    }
}

/// Detects frame-to-frame change on a coarse grid
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    config: ChangeDetectorConfig,
}

impl ChangeDetector {
    pub fn new(config: ChangeDetectorConfig) -> Self {
        Self { config }
    }

    /// Compare `current` against `previous`.
    ///
    /// Deterministic for identical inputs. With no previous frame, or when
    /// the dimensions disagree (window resized between captures), the whole
    /// frame is reported changed with no region detail.
    pub fn detect(&self, current: &Frame, previous: Option<&Frame>) -> ChangeResult {
        let Some(prev) = previous else {
            return ChangeResult::full_change();
        };
        if prev.width != current.width || prev.height != current.height {
            return ChangeResult::full_change();
        }
        let pixel_count = (current.width as usize) * (current.height as usize);
        if pixel_count == 0
            || current.data.len() < pixel_count * 4
            || prev.data.len() < pixel_count * 4
        {
            return ChangeResult::full_change();
        }

        let width = current.width;
        let height = current.height;
        let block_w = width.div_ceil(GRID_SIZE).max(1);
        let block_h = height.div_ceil(GRID_SIZE).max(1);
        let blocks_x = width.div_ceil(block_w) as usize;
        let blocks_y = height.div_ceil(block_h) as usize;

        let mut block_changed = vec![0u32; blocks_x * blocks_y];
        let mut changed_total: u64 = 0;
        let noise_floor = self.config.noise_floor as i32;

        for y in 0..height {
            let by = (y / block_h) as usize;
            let row = (y * width) as usize * 4;
            for x in 0..width {
                let idx = row + x as usize * 4;
                let delta = luma(&current.data[idx..idx + 3]) - luma(&prev.data[idx..idx + 3]);
                if delta.abs() > noise_floor {
                    changed_total += 1;
                    let bx = (x / block_w) as usize;
                    block_changed[by * blocks_x + bx] += 1;
                }
            }
        }

        let change_percentage = changed_total as f32 / pixel_count as f32;

        // Mark blocks whose changed-pixel fraction passes the kernel threshold
        let mut mask = vec![false; blocks_x * blocks_y];
        for by in 0..blocks_y {
            for bx in 0..blocks_x {
                let bw = block_w.min(width - bx as u32 * block_w);
                let bh = block_h.min(height - by as u32 * block_h);
                let block_pixels = (bw * bh).max(1) as f32;
                let fraction = block_changed[by * blocks_x + bx] as f32 / block_pixels;
                mask[by * blocks_x + bx] = fraction >= self.config.block_change_fraction;
            }
        }

        let changed_regions =
            connected_regions(&mask, blocks_x, blocks_y, block_w, block_h, width, height);

        ChangeResult {
            change_percentage,
            changed_regions,
        }
    }
}

/// Integer luma approximation (Rec. 601 weights) from an RGB(A) pixel slice.
#[inline]
fn luma(px: &[u8]) -> i32 {
    (299 * px[0] as i32 + 587 * px[1] as i32 + 114 * px[2] as i32) / 1000
}

/// Bounding rectangles of 4-connected components of changed blocks,
/// expressed in capture pixels.
fn connected_regions(
    mask: &[bool],
    blocks_x: usize,
    blocks_y: usize,
    block_w: u32,
    block_h: u32,
    width: u32,
    height: u32,
) -> Vec<Rect> {
    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        // Flood fill one component, tracking its block-space bounds
        let (mut min_bx, mut min_by) = (blocks_x, blocks_y);
        let (mut max_bx, mut max_by) = (0usize, 0usize);
        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            let bx = idx % blocks_x;
            let by = idx / blocks_x;
            min_bx = min_bx.min(bx);
            min_by = min_by.min(by);
            max_bx = max_bx.max(bx);
            max_by = max_by.max(by);

            let mut push = |nidx: usize| {
                if mask[nidx] && !visited[nidx] {
                    visited[nidx] = true;
                    stack.push(nidx);
                }
            };
            if bx > 0 {
                push(idx - 1);
            }
            if bx + 1 < blocks_x {
                push(idx + 1);
            }
            if by > 0 {
                push(idx - blocks_x);
            }
            if by + 1 < blocks_y {
                push(idx + blocks_x);
            }
        }

        let left = (min_bx as u32 * block_w) as i32;
        let top = (min_by as u32 * block_h) as i32;
        let right = ((max_bx as u32 + 1) * block_w).min(width) as i32;
        let bottom = ((max_by as u32 + 1) * block_h).min(height) as i32;
        regions.push(Rect::from_edges(left, top, right, bottom));
    }

    // Stable report order: top-to-bottom, then left-to-right
    regions.sort_by_key(|r| (r.y, r.x));
    regions
}
