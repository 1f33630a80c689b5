//! Cloud translation task
//!
//! Sends a downscaled JPEG of the frame to the cloud fallback endpoint and
//! returns its translations with 0-1000 normalized bounds. Mapping those
//! bounds into pixel space is the aggregator's job; this task never touches
//! coordinates. Fully cancellable, with a hard 30 second deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::capture::frame::Frame;
use crate::geometry::Rect;

/// Hard wall-clock deadline for one cloud call.
pub const CLOUD_TIMEOUT: Duration = Duration::from_secs(30);
/// The payload's longest side is downscaled to this many pixels.
pub const CLOUD_MAX_DIMENSION: u32 = 960;
/// JPEG quality of the payload.
pub const CLOUD_JPEG_QUALITY: u8 = 85;

/// Request body for the fallback endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub image_b64: String,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub target_language: String,
    pub session_token: String,
}

/// One translated span in the endpoint's response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudTranslationEntry {
    pub text: String,
    /// Bounds on the 0-1000 scale, independent of the submitted resolution
    pub bounds: Rect,
    pub confidence: f32,
}

/// Body of a successful fallback response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudResponsePayload {
    pub translations: Vec<CloudTranslationEntry>,
    #[serde(default)]
    pub source_language: Option<String>,
}

/// Outcome of one cloud translation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudTranslationResult {
    pub success: bool,
    pub used_engine: String,
    #[serde(default)]
    pub response: Option<CloudResponsePayload>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Cloud task failures. None of these ever fail an iteration; they only
/// mean "no cloud augmentation this round".
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    #[error("cloud translation timed out")]
    Timeout,
    #[error("cloud translation cancelled")]
    Cancelled,
    #[error("cloud transport error: {0}")]
    Transport(String),
    #[error("cloud payload error: {0}")]
    Payload(String),
    #[error("cloud endpoint unavailable: {0}")]
    Unavailable(String),
}

/// Contract of the external fallback orchestrator
#[async_trait]
pub trait FallbackClient: Send + Sync {
    async fn translate_with_fallback(
        &self,
        request: ImageRequest,
    ) -> Result<CloudTranslationResult, CloudError>;
}

/// HTTP implementation of the fallback contract
pub struct HttpFallbackClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpFallbackClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(CLOUD_TIMEOUT)
            .build()
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl FallbackClient for HttpFallbackClient {
    async fn translate_with_fallback(
        &self,
        request: ImageRequest,
    ) -> Result<CloudTranslationResult, CloudError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", request.session_token))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CloudError::Timeout
                } else {
                    CloudError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CloudError::Unavailable(format!("server error: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Transport(format!(
                "unexpected status {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json::<CloudTranslationResult>()
            .await
            .map_err(|e| CloudError::Payload(e.to_string()))
    }
}

/// Encoded frame ready for the wire
#[derive(Debug, Clone)]
pub struct CloudPayload {
    pub image_b64: String,
    /// Payload dimensions after downscaling
    pub cloud_width: u32,
    pub cloud_height: u32,
}

/// Downscale the frame so its longest side is at most
/// [`CLOUD_MAX_DIMENSION`], encode as JPEG, and base64 the bytes.
pub fn encode_cloud_payload(frame: &Frame) -> Result<CloudPayload, CloudError> {
    if !frame.has_pixels() {
        return Err(CloudError::Payload("frame has no pixel data".into()));
    }
    let rgba = RgbaImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| CloudError::Payload("pixel buffer does not match dimensions".into()))?;

    let image = DynamicImage::ImageRgba8(rgba);
    let image = if frame.width.max(frame.height) > CLOUD_MAX_DIMENSION {
        image.resize(CLOUD_MAX_DIMENSION, CLOUD_MAX_DIMENSION, FilterType::Triangle)
    } else {
        image
    };

    let rgb = image.to_rgb8();
    let (cloud_width, cloud_height) = rgb.dimensions();

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, CLOUD_JPEG_QUALITY);
    encoder
        .encode_image(&rgb)
        .map_err(|e| CloudError::Payload(e.to_string()))?;

    Ok(CloudPayload {
        image_b64: BASE64.encode(&jpeg),
        cloud_width,
        cloud_height,
    })
}

/// Runs one cancellable cloud translation against the fallback endpoint
#[derive(Clone)]
pub struct CloudTranslationTask {
    client: Arc<dyn FallbackClient>,
    timeout: Duration,
}

impl CloudTranslationTask {
    pub fn new(client: Arc<dyn FallbackClient>) -> Self {
        Self {
            client,
            timeout: CLOUD_TIMEOUT,
        }
    }

    /// Override the deadline (tests only; production keeps the 30 s hard cap).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute the call. Cancellation is observed at every await point; the
    /// in-flight HTTP request is dropped when the token fires.
    pub async fn run(
        &self,
        payload: CloudPayload,
        target_language: &str,
        session_token: &str,
        cancel: &CancellationToken,
    ) -> Result<CloudTranslationResult, CloudError> {
        if cancel.is_cancelled() {
            return Err(CloudError::Cancelled);
        }

        let request = ImageRequest {
            image_b64: payload.image_b64,
            width: payload.cloud_width,
            height: payload.cloud_height,
            mime_type: "image/jpeg".to_string(),
            target_language: target_language.to_string(),
            session_token: session_token.to_string(),
        };

        let call = self.client.translate_with_fallback(request);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(CloudError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, call) => {
                outcome.map_err(|_| CloudError::Timeout)?
            }
        }?;

        debug!(
            success = result.success,
            engine = %result.used_engine,
            translations = result.response.as_ref().map(|r| r.translations.len()).unwrap_or(0),
            "cloud translation finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClient {
        delay: Duration,
    }

    #[async_trait]
    impl FallbackClient for SlowClient {
        async fn translate_with_fallback(
            &self,
            _request: ImageRequest,
        ) -> Result<CloudTranslationResult, CloudError> {
            tokio::time::sleep(self.delay).await;
            Ok(CloudTranslationResult {
                success: true,
                used_engine: "slow".to_string(),
                response: Some(CloudResponsePayload::default()),
                error: None,
            })
        }
    }

    fn payload() -> CloudPayload {
        CloudPayload {
            image_b64: "AAAA".to_string(),
            cloud_width: 100,
            cloud_height: 100,
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request = ImageRequest {
            image_b64: "QUJD".to_string(),
            width: 960,
            height: 540,
            mime_type: "image/jpeg".to_string(),
            target_language: "en".to_string(),
            session_token: "tok".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["image_b64"], "QUJD");
        assert_eq!(value["width"], 960);
        assert_eq!(value["mime_type"], "image/jpeg");
        assert_eq!(value["target_language"], "en");
    }

    #[test]
    fn test_response_parses_normalized_bounds() {
        let result: CloudTranslationResult = serde_json::from_str(
            r#"{
                "success": true,
                "used_engine": "gemini",
                "response": {
                    "translations": [
                        {"text": "Hello", "bounds": {"x": 100, "y": 50, "width": 250, "height": 40}, "confidence": 0.97}
                    ],
                    "source_language": "ja"
                }
            }"#,
        )
        .unwrap();
        let payload = result.response.unwrap();
        assert_eq!(payload.translations[0].bounds, Rect::new(100, 50, 250, 40));
        assert_eq!(payload.source_language.as_deref(), Some("ja"));
    }

    #[test]
    fn test_payload_downscales_longest_side() {
        let frame = Frame::new(vec![200; 1920 * 1080 * 4], 1920, 1080, 1);
        let encoded = encode_cloud_payload(&frame).unwrap();
        assert_eq!(encoded.cloud_width, 960);
        assert_eq!(encoded.cloud_height, 540);
        // Base64 decodes to JPEG magic bytes
        let bytes = BASE64.decode(encoded.image_b64).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_small_frame_kept_at_native_size() {
        let frame = Frame::new(vec![200; 320 * 200 * 4], 320, 200, 1);
        let encoded = encode_cloud_payload(&frame).unwrap();
        assert_eq!((encoded.cloud_width, encoded.cloud_height), (320, 200));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let frame = Frame::new(Vec::new(), 64, 64, 1);
        assert!(matches!(
            encode_cloud_payload(&frame),
            Err(CloudError::Payload(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires() {
        let task = CloudTranslationTask::new(Arc::new(SlowClient {
            delay: Duration::from_secs(60),
        }));
        let result = task
            .run(payload(), "en", "token", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CloudError::Timeout)));
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_call() {
        let task = CloudTranslationTask::new(Arc::new(SlowClient {
            delay: Duration::from_secs(60),
        }));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = task.run(payload(), "en", "token", &cancel).await;
        assert!(matches!(result, Err(CloudError::Cancelled)));
    }

    #[tokio::test]
    async fn test_successful_call_passes_through() {
        let task = CloudTranslationTask::new(Arc::new(SlowClient {
            delay: Duration::from_millis(1),
        }));
        let result = task
            .run(payload(), "en", "token", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.used_engine, "slow");
    }
}
