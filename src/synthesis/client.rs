//! Inference service client
//!
//! Talks to a running GPT-SoVITS API server (default: 127.0.0.1:9880)

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::config::InferenceConfig;
use crate::error::{VoiceError, VoiceResult};

/// Longest slice of an error body kept in `InferenceFailed`
const ERROR_BODY_LIMIT: usize = 200;

/// Body of a `POST /tts` request
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TtsRequest {
    pub text: String,
    pub text_lang: String,
    pub ref_audio_path: String,
    pub prompt_text: String,
    pub prompt_lang: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aux_ref_audio_paths: Vec<String>,
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub text_split_method: String,
    pub batch_size: u32,
    pub speed_factor: f32,
    pub streaming_mode: bool,
}

impl TtsRequest {
    pub fn new(
        text: impl Into<String>,
        language: impl Into<String>,
        ref_audio_path: impl Into<String>,
        prompt_text: impl Into<String>,
    ) -> Self {
        let language = language.into();
        Self {
            text: text.into(),
            text_lang: language.clone(),
            ref_audio_path: ref_audio_path.into(),
            prompt_text: prompt_text.into(),
            prompt_lang: language,
            aux_ref_audio_paths: Vec::new(),
            top_k: 5,
            top_p: 1.0,
            temperature: 1.0,
            text_split_method: "cut5".to_string(),
            batch_size: 1,
            speed_factor: 1.0,
            streaming_mode: false,
        }
    }

    pub fn with_aux_references(mut self, paths: Vec<String>) -> Self {
        self.aux_ref_audio_paths = paths;
        self
    }
}

/// Speech synthesis backend
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Whether the service answers at all
    async fn health(&self) -> bool;

    /// Hot-swap the stage-1 (GPT) weights
    async fn set_gpt_weights(&self, weights_path: &str) -> VoiceResult<()>;

    /// Hot-swap the stage-2 (SoVITS) weights
    async fn set_sovits_weights(&self, weights_path: &str) -> VoiceResult<()>;

    /// Generate audio; returns the encoded WAV bytes
    async fn synthesize(&self, request: &TtsRequest) -> VoiceResult<Bytes>;
}

/// reqwest-backed client for the GPT-SoVITS HTTP API
pub struct SovitsApiClient {
    base_url: String,
    client: Client,
    health_timeout: Duration,
}

impl SovitsApiClient {
    pub fn new(config: &InferenceConfig) -> VoiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| VoiceError::InferenceFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            client,
            health_timeout: Duration::from_secs(config.health_timeout_secs),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn set_weights(&self, endpoint: &str, weights_path: &str) -> VoiceResult<()> {
        let url = format!("{}/{}", self.base_url, endpoint);

        let response = self
            .client
            .get(&url)
            .query(&[("weights_path", weights_path)])
            .send()
            .await
            .map_err(|e| VoiceError::InferenceFailed(format!("Cannot reach {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(error_from_response(endpoint, response).await);
        }

        log::info!("{} -> {}", endpoint, weights_path);
        Ok(())
    }
}

async fn error_from_response(endpoint: &str, response: reqwest::Response) -> VoiceError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    VoiceError::InferenceFailed(format!("{} returned {}: {}", endpoint, status, body))
}

#[async_trait]
impl InferenceClient for SovitsApiClient {
    async fn health(&self) -> bool {
        let url = format!("{}/", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            // The API serves no index page; a 404 still means it is up
            Ok(response) => {
                response.status().is_success()
                    || response.status() == reqwest::StatusCode::NOT_FOUND
            }
            Err(e) => {
                log::debug!("Inference service at {} unreachable: {}", self.base_url, e);
                false
            }
        }
    }

    async fn set_gpt_weights(&self, weights_path: &str) -> VoiceResult<()> {
        self.set_weights("set_gpt_weights", weights_path).await
    }

    async fn set_sovits_weights(&self, weights_path: &str) -> VoiceResult<()> {
        self.set_weights("set_sovits_weights", weights_path).await
    }

    async fn synthesize(&self, request: &TtsRequest) -> VoiceResult<Bytes> {
        let url = format!("{}/tts", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| VoiceError::InferenceFailed(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(error_from_response("tts", response).await);
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| VoiceError::InferenceFailed(format!("Invalid response: {}", e)))?;
        if audio.is_empty() {
            return Err(VoiceError::InferenceFailed("tts returned no audio".to_string()));
        }
        Ok(audio)
    }
}
