//! Narration (text-to-speech) client
//!
//! [`HttpNarrator`] POSTs `{text, voice}` JSON to a configured endpoint and
//! expects audio bytes back. The audio length is read from the
//! `X-Audio-Duration` response header (seconds); when the service does not
//! send one, it is estimated from the word count.

use crate::models::VoiceConfig;
use async_trait::async_trait;
use pagecast_common::config::NarrationConfig;
use serde::Serialize;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

/// Response header carrying the audio duration in seconds
pub const DURATION_HEADER: &str = "x-audio-duration";

const USER_AGENT: &str = concat!("pagecast/", env!("CARGO_PKG_VERSION"));

/// Speaking rate used when the service does not report a duration
const ESTIMATED_WORDS_PER_MINUTE: f64 = 150.0;

#[derive(Debug, Error)]
pub enum NarrationError {
    #[error("Narration service not configured")]
    NotConfigured,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Narration service error {status}: {message}")]
    Service { status: u16, message: String },

    #[error("Narration request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid narration response: {0}")]
    InvalidResponse(String),
}

/// Narrated audio for one page
#[derive(Debug, Clone, PartialEq)]
pub struct Narration {
    pub audio: Vec<u8>,
    /// Seconds
    pub duration: f64,
}

/// Text + voice → audio
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, text: &str, voice: &VoiceConfig) -> Result<Narration, NarrationError>;
}

#[derive(Debug, Serialize)]
struct NarrationRequest<'a> {
    text: &'a str,
    voice: &'a VoiceConfig,
}

/// HTTP text-to-speech client
pub struct HttpNarrator {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    rate_limiter: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl HttpNarrator {
    pub fn new(config: &NarrationConfig) -> Result<Self, NarrationError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| NarrationError::Network(e.to_string()))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = governor::RateLimiter::direct(governor::Quota::per_second(per_second));

        if config.endpoint.is_none() {
            tracing::warn!("No narration endpoint configured; every narration attempt will fail");
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            rate_limiter,
        })
    }
}

#[async_trait]
impl Narrator for HttpNarrator {
    async fn narrate(&self, text: &str, voice: &VoiceConfig) -> Result<Narration, NarrationError> {
        let endpoint = self.endpoint.as_deref().ok_or(NarrationError::NotConfigured)?;

        self.rate_limiter.until_ready().await;

        tracing::debug!(
            chars = text.len(),
            language = %voice.language,
            gender = %voice.gender,
            "Requesting narration"
        );

        let mut request = self.client.post(endpoint).json(&NarrationRequest { text, voice });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NarrationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let code = status.as_u16();
            return Err(if status.is_client_error() && code != 429 {
                NarrationError::Rejected { status: code, message }
            } else {
                NarrationError::Service { status: code, message }
            });
        }

        let reported_duration = response
            .headers()
            .get(DURATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0);

        let audio = response
            .bytes()
            .await
            .map_err(|e| NarrationError::Network(e.to_string()))?
            .to_vec();

        if audio.is_empty() {
            return Err(NarrationError::InvalidResponse("empty audio body".to_string()));
        }

        Ok(Narration {
            audio,
            duration: reported_duration.unwrap_or_else(|| estimate_duration(text)),
        })
    }
}

/// Rough spoken length of `text` in seconds
pub fn estimate_duration(text: &str) -> f64 {
    let words = text.split_whitespace().count() as f64;
    (words / ESTIMATED_WORDS_PER_MINUTE * 60.0 * 10.0).round() / 10.0
}
