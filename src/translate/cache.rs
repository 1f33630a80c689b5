//! Cloud result cache
//!
//! Identical frames should hit the cloud endpoint once. Results are keyed
//! by `(window handle, 64-bit frame hash)` in a bounded LRU that lives in
//! memory only and is cleared on orchestrator reset.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::capture::frame::{Frame, WindowHandle};
use crate::translate::cloud::CloudTranslationResult;

/// Default cache capacity.
pub const CLOUD_CACHE_CAPACITY: usize = 32;

/// Longest axis of the strided downsample fed to the hash.
const HASH_SAMPLE_GRID: u32 = 64;

/// 64-bit content hash of a frame.
///
/// Samples the pixel buffer on a coarse grid (so the cost is independent of
/// resolution), feeds the samples plus the dimensions through SHA-256, and
/// truncates to the first 8 bytes. Deterministic: same pixels, same value.
/// The window handle is kept out of the hash; it prefixes the cache key
/// instead, which keeps cross-window collisions structurally impossible.
pub fn frame_hash(frame: &Frame) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(frame.width.to_le_bytes());
    hasher.update(frame.height.to_le_bytes());

    if frame.width > 0 && frame.height > 0 && frame.has_pixels() {
        let step_x = (frame.width / HASH_SAMPLE_GRID).max(1);
        let step_y = (frame.height / HASH_SAMPLE_GRID).max(1);
        let mut y = 0;
        while y < frame.height {
            let row = (y * frame.width) as usize * 4;
            let mut x = 0;
            while x < frame.width {
                let idx = row + x as usize * 4;
                hasher.update(&frame.data[idx..idx + 4]);
                x += step_x;
            }
            y += step_y;
        }
    }

    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Bounded per-window cache of cloud translation results
pub struct CloudResultCache {
    inner: Mutex<LruCache<(WindowHandle, u64), CloudTranslationResult>>,
}

impl CloudResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be > 0"),
            )),
        }
    }

    /// Look up a cached result for this window and frame hash.
    pub fn get(&self, window: WindowHandle, hash: u64) -> Option<CloudTranslationResult> {
        self.inner.lock().get(&(window, hash)).cloned()
    }

    /// Store a successful result.
    pub fn insert(&self, window: WindowHandle, hash: u64, result: CloudTranslationResult) {
        self.inner.lock().put((window, hash), result);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop everything; called on orchestrator reset and dispose.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for CloudResultCache {
    fn default() -> Self {
        Self::new(CLOUD_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(data_value: u8) -> Frame {
        Frame::new(vec![data_value; 128 * 128 * 4], 128, 128, 1)
    }

    fn result_named(engine: &str) -> CloudTranslationResult {
        CloudTranslationResult {
            success: true,
            used_engine: engine.to_string(),
            response: None,
            error: None,
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let a = frame_with(120);
        let b = frame_with(120);
        assert_eq!(frame_hash(&a), frame_hash(&b));
    }

    #[test]
    fn test_hash_differs_for_changed_pixels() {
        let a = frame_with(120);
        let mut b = frame_with(120);
        b.data[0] = 7;
        assert_ne!(frame_hash(&a), frame_hash(&b));
    }

    #[test]
    fn test_hash_differs_for_dimensions() {
        let a = Frame::new(vec![9; 64 * 64 * 4], 64, 64, 1);
        let b = Frame::new(vec![9; 32 * 128 * 4], 32, 128, 1);
        assert_ne!(frame_hash(&a), frame_hash(&b));
    }

    #[test]
    fn test_cache_round_trip_per_window() {
        let cache = CloudResultCache::default();
        cache.insert(1, 0xABCD, result_named("gemini"));

        assert_eq!(cache.get(1, 0xABCD).unwrap().used_engine, "gemini");
        // Same hash under a different window misses
        assert!(cache.get(2, 0xABCD).is_none());
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let cache = CloudResultCache::new(2);
        cache.insert(1, 1, result_named("a"));
        cache.insert(1, 2, result_named("b"));
        cache.insert(1, 3, result_named("c"));

        assert!(cache.get(1, 1).is_none());
        assert!(cache.get(1, 2).is_some());
        assert!(cache.get(1, 3).is_some());
    }

    #[test]
    fn test_clear_empties_cache() {
        let cache = CloudResultCache::default();
        cache.insert(1, 1, result_named("a"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
