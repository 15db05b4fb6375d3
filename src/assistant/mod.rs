//! # Assistant Collaborators
//!
//! The bridge itself never does speech recognition, response generation, or
//! synthesis; those live behind three trait seams so that deployments wire
//! in whatever engines they run and tests substitute scripted fakes. All
//! three are object-safe and `Send + Sync` so one set of collaborators can
//! serve every connection task.

pub mod http;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::audio::session::CallSession;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collaborator returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// Turns one utterance of PCM into text.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, pcm: &[u8], session_id: &str) -> Result<String, CollaboratorError>;
}

/// Turns response text into PCM at the deployment sample rate.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// Produces the assistant's reply to a transcribed utterance.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn respond(
        &self,
        transcript: &str,
        session: &CallSession,
    ) -> Result<String, CollaboratorError>;
}

/// The collaborator set a connection handler works with.
#[derive(Clone)]
pub struct Collaborators {
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub responder: Arc<dyn ResponseGenerator>,
}
