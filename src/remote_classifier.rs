// src/remote_classifier.rs
//
// Second-opinion classification of sonar marks by a hosted vision model.
//
// The largest detection is cropped, downscaled, JPEG-encoded and sent as a
// base64 data URI inside an OpenAI-compatible chat-completions request.
// The model answers with `CLASS:` / `CONFIDENCE:` / `REASONING:` lines.
//
// Every failure (no key, encode error, transport, HTTP status, timeout,
// unparseable body) degrades to an `unknown` result; nothing here can stall
// or fail the frame loop.

use async_trait::async_trait;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{duration_from_secs, DEFAULT_CLASSIFIER_TIMEOUT};
use crate::types::{
    BoundingBox, ClassificationLabel, ClassificationResult, ClassifierConfig, Detection,
};

const PROMPT: &str = "Analyze this sonar/fishfinder image and classify what you see.

Focus on identifying:
- school: Clear fish school or multiple fish arches (bright clustered marks)
- debris: Scattered objects, likely non-fish (vegetation, structure fragments)
- thermocline: Horizontal band/layer (temperature boundary)
- unknown: Unclear or empty

Respond in this exact format:
CLASS: <school|debris|thermocline|unknown>
CONFIDENCE: <0.0-1.0>
REASONING: <brief 1-sentence explanation>

Be conservative with fish classifications - only say \"school\" if you see clear arches or clusters.";

const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 300;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier disabled: {0}")]
    Disabled(String),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unparseable response: {0}")]
    Parse(String),
}

impl ClassifierError {
    /// Short reason carried into the `unknown` result.
    pub fn reason(&self) -> String {
        match self {
            Self::Disabled(_) => "Classifier not configured".to_string(),
            Self::Encode(e) => format!("Encoding error: {}", e),
            Self::Transport(e) => format!("Request error: {}", e),
            Self::Status { status, .. } => format!("API error {}", status),
            Self::Timeout(_) => "Request timeout".to_string(),
            Self::Parse(_) => "Parse error".to_string(),
        }
    }
}

// ============================================================================
// REQUEST
// ============================================================================

/// Image region queued for classification.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub id: Uuid,
    pub frame_index: u64,
    /// Already cropped to `crop` when one is set.
    pub image: DynamicImage,
    pub crop: Option<BoundingBox>,
}

impl ClassificationRequest {
    pub fn new(frame_index: u64, image: DynamicImage, crop: Option<BoundingBox>) -> Self {
        let image = match crop {
            Some(b) => crop_clamped(&image, b).unwrap_or(image),
            None => image,
        };
        Self {
            id: Uuid::new_v4(),
            frame_index,
            image,
            crop,
        }
    }

    /// Crop the frame to the largest detection by area; whole frame when
    /// there are none.
    pub fn for_detections(frame_index: u64, image: &DynamicImage, detections: &[Detection]) -> Self {
        let crop = largest_detection(detections).map(|d| d.bbox);
        Self::new(frame_index, image.clone(), crop)
    }
}

pub fn largest_detection(detections: &[Detection]) -> Option<&Detection> {
    detections
        .iter()
        .max_by(|a, b| a.area.partial_cmp(&b.area).unwrap_or(std::cmp::Ordering::Equal))
}

fn crop_clamped(image: &DynamicImage, bbox: BoundingBox) -> Option<DynamicImage> {
    if bbox.x >= image.width() || bbox.y >= image.height() {
        return None;
    }
    let w = bbox.w.min(image.width() - bbox.x);
    let h = bbox.h.min(image.height() - bbox.y);
    if w == 0 || h == 0 {
        return None;
    }
    Some(image.crop_imm(bbox.x, bbox.y, w, h))
}

// ============================================================================
// CLASSIFIER SEAM
// ============================================================================

#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    /// False when queries would fail immediately (e.g. no credentials).
    fn is_available(&self) -> bool;

    async fn classify(
        &self,
        request: ClassificationRequest,
    ) -> Result<ClassificationResult, ClassifierError>;
}

/// Run `classify` on its own task bounded by `timeout`. Dropping or
/// aborting the handle abandons the query.
pub fn spawn_classification(
    classifier: Arc<dyn RemoteClassifier>,
    request: ClassificationRequest,
    timeout: Duration,
) -> JoinHandle<Result<ClassificationResult, ClassifierError>> {
    tokio::spawn(async move {
        let id = request.id;
        let outcome = match tokio::time::timeout(timeout, classifier.classify(request)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(timeout)),
        };
        if let Ok(result) = &outcome {
            debug!(
                "Classification {}: {} ({:.2})",
                id,
                result.label.as_str(),
                result.confidence
            );
        }
        outcome
    })
}

/// Collapse a classifier outcome into a result, logging failures.
pub fn or_unknown(outcome: Result<ClassificationResult, ClassifierError>) -> ClassificationResult {
    match outcome {
        Ok(result) => result,
        Err(e @ ClassifierError::Disabled(_)) => {
            debug!("Classification skipped: {}", e);
            ClassificationResult::unknown(e.reason())
        }
        Err(e) => {
            warn!("Classification failed: {}", e);
            ClassificationResult::unknown(e.reason())
        }
    }
}

// ============================================================================
// VISION CLIENT
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Handle to the hosted vision model, built once at startup.
pub struct VisionContext {
    http_client: reqwest::Client,
    endpoint: String,
    model_id: String,
    api_key: Option<String>,
    request_timeout: Duration,
    max_image_size: u32,
    jpeg_quality: u8,
}

impl VisionContext {
    /// Reads the API key from the environment variable named in the config.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::new(config, api_key)
    }

    pub fn new(config: &ClassifierConfig, api_key: Option<String>) -> Result<Self, ClassifierError> {
        let request_timeout =
            duration_from_secs(config.timeout_sec.max(0.1), DEFAULT_CLASSIFIER_TIMEOUT);
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        if api_key.is_none() {
            warn!(
                "{} not set; vision classification disabled",
                config.api_key_env
            );
        } else {
            info!("✓ Vision classifier ready ({})", config.model_id);
        }

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            model_id: config.model_id.clone(),
            api_key,
            request_timeout,
            max_image_size: config.max_image_size,
            jpeg_quality: config.jpeg_quality,
        })
    }

    fn build_request(&self, data_uri: String) -> ChatRequest<'_> {
        ChatRequest {
            model: &self.model_id,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_uri },
                    },
                ],
            }],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        }
    }
}

#[async_trait]
impl RemoteClassifier for VisionContext {
    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn classify(
        &self,
        request: ClassificationRequest,
    ) -> Result<ClassificationResult, ClassifierError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ClassifierError::Disabled("no API key".to_string()));
        };

        let data_uri = encode_data_uri(&request.image, self.max_image_size, self.jpeg_quality)?;
        let body = self.build_request(data_uri);

        debug!(
            "🌐 Classification {} (frame {}, crop={:?}) -> {}",
            request.id, request.frame_index, request.crop, self.endpoint
        );

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .header("X-Request-Id", request.id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(self.request_timeout)
                } else {
                    ClassifierError::Transport(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ClassifierError::Parse("no choices".to_string()))?;

        Ok(parse_response(&content))
    }
}

/// A classifier that is never available.
pub struct DisabledClassifier;

#[async_trait]
impl RemoteClassifier for DisabledClassifier {
    fn is_available(&self) -> bool {
        false
    }

    async fn classify(
        &self,
        _request: ClassificationRequest,
    ) -> Result<ClassificationResult, ClassifierError> {
        Err(ClassifierError::Disabled("disabled by configuration".to_string()))
    }
}

// ============================================================================
// ENCODING / PARSING
// ============================================================================

/// Downscale so the longest side is at most `max_size`, then JPEG + base64.
pub fn encode_data_uri(
    image: &DynamicImage,
    max_size: u32,
    quality: u8,
) -> Result<String, ClassifierError> {
    let longest = image.width().max(image.height());
    let resized;
    let image = if max_size > 0 && longest > max_size {
        let scale = max_size as f64 / longest as f64;
        let w = ((image.width() as f64 * scale) as u32).max(1);
        let h = ((image.height() as f64 * scale) as u32).max(1);
        resized = image.resize_exact(w, h, FilterType::Triangle);
        &resized
    } else {
        image
    };

    let rgb = image.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode_image(&rgb)?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(&jpeg);
    Ok(format!("data:image/jpeg;base64,{}", encoded))
}

/// Line-oriented `key: value` parse. Unknown classes stay `unknown`,
/// confidence is clamped to `[0, 1]`, malformed numbers are ignored.
pub fn parse_response(content: &str) -> ClassificationResult {
    let mut result = ClassificationResult::unknown("");

    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_lowercase().as_str() {
            "class" => {
                if let Some(label) = ClassificationLabel::parse(value) {
                    result.label = label;
                }
            }
            "confidence" => {
                if let Ok(conf) = value.parse::<f32>() {
                    if conf.is_finite() {
                        result.confidence = conf.clamp(0.0, 1.0);
                    }
                }
            }
            "reasoning" => result.reasoning = value.to_string(),
            _ => {}
        }
    }
    result
}
