//! HTTP-backed collaborator implementations.
//!
//! The production deployment runs speech-to-text, text-to-speech, and the
//! conversational assistant as separate HTTP services; these clients speak
//! their request shapes. One shared `reqwest::Client` (connection pooling,
//! rustls) serves all three.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{CollaboratorError, ResponseGenerator, SpeechToText, TextToSpeech};
use crate::audio::session::CallSession;
use crate::config::CollaboratorConfig;

pub fn build_client(cfg: &CollaboratorConfig) -> Result<reqwest::Client, CollaboratorError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.request_timeout_ms))
        .build()?)
}

/// Client for the transcription service: raw PCM in, transcript out.
pub struct HttpSpeechToText {
    client: reqwest::Client,
    url: String,
    language: String,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    transcript: String,
}

impl HttpSpeechToText {
    pub fn new(client: reqwest::Client, cfg: &CollaboratorConfig) -> Self {
        Self {
            client,
            url: cfg.stt_url.clone(),
            language: cfg.language.clone(),
        }
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(&self, pcm: &[u8], session_id: &str) -> Result<String, CollaboratorError> {
        let response = self
            .client
            .post(&self.url)
            .query(&[("session_id", session_id), ("language", &self.language)])
            .header("content-type", "application/octet-stream")
            .body(pcm.to_vec())
            .send()
            .await?
            .error_for_status()?;

        let body: TranscribeResponse = response.json().await?;
        debug!(session_id, transcript = %body.transcript, "utterance transcribed");
        Ok(body.transcript)
    }
}

/// Client for the synthesis service: text in, linear PCM out.
pub struct HttpTextToSpeech {
    client: reqwest::Client,
    url: String,
    voice: String,
    language: String,
    sample_rate: u32,
}

impl HttpTextToSpeech {
    pub fn new(client: reqwest::Client, cfg: &CollaboratorConfig, sample_rate: u32) -> Self {
        Self {
            client,
            url: cfg.tts_url.clone(),
            voice: cfg.voice.clone(),
            language: cfg.language.clone(),
            sample_rate,
        }
    }
}

#[async_trait]
impl TextToSpeech for HttpTextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "text": text,
                "voice": self.voice,
                "languageCode": self.language,
                "sampleRateHertz": self.sample_rate,
            }))
            .send()
            .await?
            .error_for_status()?;

        let pcm = response.bytes().await?.to_vec();
        if pcm.is_empty() {
            return Err(CollaboratorError::InvalidResponse(
                "synthesis returned no audio".to_string(),
            ));
        }
        Ok(pcm)
    }
}

/// Client for the conversational assistant.
pub struct HttpResponseGenerator {
    client: reqwest::Client,
    url: String,
    language: String,
}

#[derive(Deserialize)]
struct AssistantResponse {
    response: String,
}

impl HttpResponseGenerator {
    pub fn new(client: reqwest::Client, cfg: &CollaboratorConfig) -> Self {
        Self {
            client,
            url: cfg.assistant_url.clone(),
            language: cfg.language.clone(),
        }
    }
}

#[async_trait]
impl ResponseGenerator for HttpResponseGenerator {
    async fn respond(
        &self,
        transcript: &str,
        session: &CallSession,
    ) -> Result<String, CollaboratorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "message": transcript,
                "language": self.language,
                "uniqueId": session.session_id,
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: AssistantResponse = response.json().await?;
        if body.response.trim().is_empty() {
            return Err(CollaboratorError::InvalidResponse(
                "assistant returned an empty reply".to_string(),
            ));
        }
        Ok(body.response)
    }
}
