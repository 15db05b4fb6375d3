//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`/`PORT` (deployment-platform convention)
//! 2. Environment variables (`APP_SERVER__HOST`, `APP_VAD__HANGOVER_MS`,
//!    `APP_COLLABORATORS__STT_URL`, ...) — a double underscore separates
//!    nesting levels so that multi-word keys like `hangover_ms` survive
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Configuration is read-only once the process is up: the listen ports and
//! the audio format cannot change underneath live calls.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audiosocket: AudioSocketConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub session: SessionConfig,
    pub speech: SpeechConfig,
    pub collaborators: CollaboratorConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// TCP listener the PBX connects its media streams to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSocketConfig {
    pub host: String,
    pub port: u16,
}

/// Audio format shared by both directions of every call.
///
/// Telephony media arrives as 16-bit signed linear PCM; `sample_rate` and
/// `frame_duration_ms` together fix the frame size everything downstream
/// (segmenter, playback pacing) works in. For 8 kHz at 20 ms that is
/// 320 bytes per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
}

/// Voice-activity detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Consecutive silence that closes an utterance, in milliseconds
    pub hangover_ms: u32,
    /// RMS amplitude above which a frame counts as speech
    pub energy_threshold: f64,
}

/// Call session lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

/// Canned call-flow speech.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub greeting: String,
    pub farewell: String,
    /// Spoken when a collaborator fails; the call must never just go quiet
    pub fallback: String,
}

/// Endpoints and request settings for the external speech and assistant
/// services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    pub stt_url: String,
    pub tts_url: String,
    pub assistant_url: String,
    pub language: String,
    pub voice: String,
    pub request_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audiosocket: AudioSocketConfig {
                host: "0.0.0.0".to_string(),
                port: 9093,
            },
            audio: AudioConfig {
                sample_rate: 8000,
                frame_duration_ms: 20,
            },
            vad: VadConfig {
                hangover_ms: 400,
                energy_threshold: 500.0,
            },
            session: SessionConfig {
                ttl_seconds: 60,
                sweep_interval_seconds: 60,
            },
            speech: SpeechConfig {
                greeting: "Thank you for calling. How can I help you today?".to_string(),
                farewell: "Goodbye!".to_string(),
                fallback: "I'm sorry, I'm having trouble processing that right now. Could you please repeat?".to_string(),
            },
            collaborators: CollaboratorConfig {
                stt_url: "http://127.0.0.1:8085/transcribe".to_string(),
                tts_url: "http://127.0.0.1:8086/synthesize".to_string(),
                assistant_url: "http://127.0.0.1:8087/assistant".to_string(),
                language: "en-US".to_string(),
                voice: "en-US-Neural2-C".to_string(),
                request_timeout_ms: 15000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, then the environment.
    ///
    /// `HOST` and `PORT` are honored last as deployment-platform special
    /// cases that do not follow the `APP_` prefix convention.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double-underscore nesting: a single "_" would split keys like
            // hangover_ms into bogus levels and drop the override
            .add_source(
                config::Environment::with_prefix("APP")
                    // Without an explicit prefix separator the config crate
                    // reuses the nesting separator, demanding "APP__..." keys
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Catch nonsense values before anything binds a port or accepts a call.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audiosocket.port == 0 {
            return Err(anyhow::anyhow!("Audio socket port cannot be 0"));
        }

        if self.server.port == self.audiosocket.port {
            return Err(anyhow::anyhow!(
                "HTTP and audio socket ports must differ (both {})",
                self.server.port
            ));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if !(10..=60).contains(&self.audio.frame_duration_ms) {
            return Err(anyhow::anyhow!(
                "Frame duration must be between 10 and 60 ms, got {}",
                self.audio.frame_duration_ms
            ));
        }

        if !(100..=5000).contains(&self.vad.hangover_ms) {
            return Err(anyhow::anyhow!(
                "VAD hangover must be between 100 and 5000 ms, got {}",
                self.vad.hangover_ms
            ));
        }

        if self.session.ttl_seconds == 0 {
            return Err(anyhow::anyhow!("Session TTL must be greater than 0"));
        }

        if self.collaborators.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Collaborator timeout must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.sample_rate, 8000);
        assert_eq!(config.audio.frame_duration_ms, 20);
        assert_eq!(config.audiosocket.port, 9093);
    }

    #[test]
    fn test_port_zero_rejected() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_collision_rejected() {
        let mut config = AppConfig::default();
        config.audiosocket.port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hangover_bounds() {
        let mut config = AppConfig::default();
        config.vad.hangover_ms = 50;
        assert!(config.validate().is_err());
        config.vad.hangover_ms = 5000;
        assert!(config.validate().is_ok());
        config.vad.hangover_ms = 5001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_nested_keys() {
        // Multi-word leaves must survive the env layer, not just
        // single-word ones like server.host
        std::env::set_var("APP_VAD__HANGOVER_MS", "777");
        std::env::set_var("APP_SESSION__TTL_SECONDS", "120");
        std::env::set_var("APP_COLLABORATORS__STT_URL", "http://stt.internal/v1");

        let config = AppConfig::load().unwrap();

        std::env::remove_var("APP_VAD__HANGOVER_MS");
        std::env::remove_var("APP_SESSION__TTL_SECONDS");
        std::env::remove_var("APP_COLLABORATORS__STT_URL");

        assert_eq!(config.vad.hangover_ms, 777);
        assert_eq!(config.session.ttl_seconds, 120);
        assert_eq!(config.collaborators.stt_url, "http://stt.internal/v1");
    }

    #[test]
    fn test_frame_duration_bounds() {
        let mut config = AppConfig::default();
        config.audio.frame_duration_ms = 5;
        assert!(config.validate().is_err());
        config.audio.frame_duration_ms = 60;
        assert!(config.validate().is_ok());
    }
}
