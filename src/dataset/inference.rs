//! Inference service boundary
//!
//! The captioning, scoring, detection and tagging models run outside this
//! program. Each is reached through a small trait so the stages can be driven
//! by the HTTP client below or by an in-process fake.

use std::path::PathBuf;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::dataset::InferenceConfig;

/// Error types for calls into the inference service
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Expected {expected} results, service returned {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Service error: {0}")]
    Service(String),
}

/// Result type for inference operations
pub type InferenceResult<T> = Result<T, InferenceError>;

/// One image handed to a model, with an optional text hint.
#[derive(Debug, Clone)]
pub struct InferenceInput {
    pub path: PathBuf,
    pub image_bytes: Vec<u8>,
    pub hint: Option<String>,
}

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Center point, rounded down.
    pub fn center(&self) -> (u32, u32) {
        (
            ((self.x1 as u64 + self.x2 as u64) / 2) as u32,
            ((self.y1 as u64 + self.y2 as u64) / 2) as u32,
        )
    }
}

/// Natural-language captioning, one caption per input, same order.
pub trait CaptionService {
    fn caption_batch(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<String>>;
}

/// Aesthetic quality in `[0, 1]`, one score per input, same order.
pub trait QualityScorer {
    fn score_batch(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<f32>>;
}

/// Locates the main subject of an image.
pub trait SubjectDetector {
    fn detect(&mut self, input: &InferenceInput) -> InferenceResult<Option<BoundingBox>>;
}

/// Predicts booru-style tags for an image, using the hint as context.
pub trait TagPredictor {
    fn predict_tags(&mut self, input: &InferenceInput) -> InferenceResult<Vec<String>>;
}

/// Fails the whole call unless there is exactly one result per input.
pub fn expect_len<T>(results: Vec<T>, expected: usize) -> InferenceResult<Vec<T>> {
    if results.len() != expected {
        return Err(InferenceError::LengthMismatch {
            expected,
            actual: results.len(),
        });
    }
    Ok(results)
}

#[derive(Serialize)]
struct WireItem<'a> {
    name: String,
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
}

#[derive(Serialize)]
struct WireBatch<'a> {
    items: Vec<WireItem<'a>>,
}

impl<'a> WireBatch<'a> {
    fn new(inputs: &'a [InferenceInput]) -> Self {
        let items = inputs
            .iter()
            .map(|input| WireItem {
                name: input
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                image: BASE64.encode(&input.image_bytes),
                hint: input.hint.as_deref(),
            })
            .collect();
        Self { items }
    }
}

#[derive(Deserialize)]
struct CaptionResponse {
    captions: Vec<String>,
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<f32>,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(rename = "box")]
    bbox: Option<[u32; 4]>,
}

#[derive(Deserialize)]
struct TagResponse {
    tags: Vec<String>,
}

/// JSON-over-HTTP client for a model server.
///
/// Every route takes `{"items": [{"name", "image" (base64), "hint"}]}`.
pub struct HttpInferenceClient {
    client: Client,
    endpoint: String,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> InferenceResult<Self> {
        let timeout = match config.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let client = Client::builder()
            .user_agent(format!("booru_dataset/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn post<T: DeserializeOwned>(&self, route: &str, inputs: &[InferenceInput]) -> InferenceResult<T> {
        let url = format!("{}/{}", self.endpoint, route);
        debug!(url = %url, items = inputs.len(), "Calling inference service");

        let response = self.client.post(&url).json(&WireBatch::new(inputs)).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(response.json()?)
    }
}

impl CaptionService for HttpInferenceClient {
    fn caption_batch(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<String>> {
        let response: CaptionResponse = self.post("caption", inputs)?;
        expect_len(response.captions, inputs.len())
    }
}

impl QualityScorer for HttpInferenceClient {
    fn score_batch(&mut self, inputs: &[InferenceInput]) -> InferenceResult<Vec<f32>> {
        let response: ScoreResponse = self.post("score", inputs)?;
        expect_len(response.scores, inputs.len())
    }
}

impl SubjectDetector for HttpInferenceClient {
    fn detect(&mut self, input: &InferenceInput) -> InferenceResult<Option<BoundingBox>> {
        let response: DetectResponse = self.post("detect", std::slice::from_ref(input))?;
        Ok(response
            .bbox
            .map(|[x1, y1, x2, y2]| BoundingBox::new(x1, y1, x2, y2)))
    }
}

impl TagPredictor for HttpInferenceClient {
    fn predict_tags(&mut self, input: &InferenceInput) -> InferenceResult<Vec<String>> {
        let response: TagResponse = self.post("tags", std::slice::from_ref(input))?;
        Ok(response.tags)
    }
}
