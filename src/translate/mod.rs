//! Translation Layer
//!
//! Two independent engines feed the pipeline: a local batch engine behind
//! [`LocalTranslator`] and a cloud fallback endpoint driven by
//! [`cloud::CloudTranslationTask`]. The fork-join coordinator runs them in
//! parallel and reconciles the results.

pub mod cache;
pub mod cloud;
pub mod forkjoin;

use std::time::Duration;

use thiserror::Error;

/// Hard ceiling for one local batch translation.
pub const LOCAL_BATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Response contract of the local translation service
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TranslationResponse {
    pub translated_text: String,
    pub is_success: bool,
    pub error: Option<String>,
    pub processing_time_ms: u64,
    pub confidence_score: f32,
}

impl TranslationResponse {
    /// Successful translation
    pub fn success(translated_text: impl Into<String>, processing_time_ms: u64) -> Self {
        Self {
            translated_text: translated_text.into(),
            is_success: true,
            error: None,
            processing_time_ms,
            confidence_score: 1.0,
        }
    }

    /// Explicit error translation: empty text plus an error record, so the
    /// overlay layer can decide display policy instead of losing the chunk.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            translated_text: String::new(),
            is_success: false,
            error: Some(error.into()),
            processing_time_ms: 0,
            confidence_score: 0.0,
        }
    }
}

/// Translation failures at the engine seam
#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    /// Batch exceeded the hard timeout
    #[error("local translation timed out")]
    Timeout,
    /// The surrounding iteration was cancelled
    #[error("translation cancelled")]
    Cancelled,
    /// Engine-reported failure
    #[error("translation engine error: {0}")]
    Engine(String),
}

/// Contract of the local translation engine
///
/// Batch results are index-stable: `result[i]` always corresponds to
/// `texts[i]`, including per-item failures. Implementations block
/// (CPU-bound model inference); callers dispatch through a blocking task
/// and apply [`LOCAL_BATCH_TIMEOUT`].
pub trait LocalTranslator: Send + Sync {
    /// Translate a single text
    fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
        context: Option<&str>,
    ) -> TranslationResponse;

    /// Translate a batch; the default delegates item by item
    fn translate_batch(
        &self,
        texts: &[String],
        source: &str,
        target: &str,
        context: Option<&str>,
    ) -> Vec<TranslationResponse> {
        texts
            .iter()
            .map(|t| self.translate(t, source, target, context))
            .collect()
    }

    /// Engine display name for events and diagnostics
    fn engine_name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl LocalTranslator for Doubler {
        fn translate(
            &self,
            text: &str,
            _source: &str,
            _target: &str,
            _context: Option<&str>,
        ) -> TranslationResponse {
            TranslationResponse::success(format!("{text}{text}"), 1)
        }
    }

    #[test]
    fn test_batch_is_index_stable() {
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let results = Doubler.translate_batch(&texts, "en", "ja", None);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].translated_text, "aa");
        assert_eq!(results[1].translated_text, "bb");
        assert_eq!(results[2].translated_text, "cc");
    }

    #[test]
    fn test_failure_response_shape() {
        let response = TranslationResponse::failure("engine offline");
        assert!(!response.is_success);
        assert!(response.translated_text.is_empty());
        assert_eq!(response.error.as_deref(), Some("engine offline"));
    }
}
