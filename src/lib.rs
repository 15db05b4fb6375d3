//! # Voice Bridge Backend
//!
//! Real-time audio bridge between a telephony PBX and a voice assistant.
//! Two listeners run side by side:
//!
//! - an **audio socket** (TCP) the PBX streams call media into: one framed
//!   session-id handshake, then raw 8 kHz PCM in both directions
//! - an **HTTP API** (actix-web) for registering call metadata ahead of the
//!   media stream, listing active calls, forcing hang-ups, and the usual
//!   health/metrics/config endpoints
//!
//! ## Module layout:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared HTTP-side state and request metrics
//! - **audio**: wire codec, voice segmentation, playback pacing, sessions,
//!   and the TCP connection handler
//! - **assistant**: trait seams for the STT/TTS/assistant collaborators
//! - **handlers**: call-management REST endpoints
//! - **middleware**: request logging and metrics
//! - **health**: health check and metrics endpoints
//! - **error**: HTTP error types and responses

pub mod assistant;
pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod state;
