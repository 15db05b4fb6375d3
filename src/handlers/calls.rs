//! # Call Management REST API Handlers
//!
//! The control-plane side of a call. The PBX registers metadata here before
//! (or while) opening the media connection, operators can list what's live,
//! and upstream systems can force a hang-up.
//!
//! ## Available Endpoints:
//! - `POST /api/v1/calls/metadata` - register a call ahead of its media stream
//! - `GET  /api/v1/calls` - list active (non-expired) calls
//! - `POST /api/v1/calls/{session_id}/hangup` - stop playback, terminate, delete

use crate::audio::codec;
use crate::audio::session::CallMetadata;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// One row in the active-calls listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub session_id: String,
    #[serde(rename = "DID")]
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub playing: bool,
    pub connected: bool,
}

/// `POST /api/v1/calls/metadata`
///
/// Creates (or replaces) the session the media connection will later claim
/// by UUID handshake. The session id therefore has to be a UUID, and the
/// call must dial in before the configured TTL runs out.
pub async fn register_call_metadata(
    state: web::Data<AppState>,
    body: web::Json<CallMetadata>,
) -> Result<HttpResponse, AppError> {
    let metadata = body.into_inner();

    if metadata.session_id.trim().is_empty() {
        return Err(AppError::ValidationError(
            "sessionId must not be empty".to_string(),
        ));
    }
    if Uuid::parse_str(&metadata.session_id).is_err() {
        return Err(AppError::ValidationError(format!(
            "sessionId must be a UUID, got '{}'",
            metadata.session_id
        )));
    }
    if metadata.did.trim().is_empty() {
        return Err(AppError::ValidationError(
            "DID must not be empty".to_string(),
        ));
    }

    let ttl = Duration::from_secs(state.get_config().session.ttl_seconds);
    let session = state.registry.create(metadata, ttl);
    info!(
        session_id = %session.session_id,
        did = %session.metadata.did,
        "call metadata registered"
    );

    Ok(HttpResponse::Created().json(json!({
        "status": "registered",
        "sessionId": session.session_id,
        "expiresAt": session.expires_at.to_rfc3339()
    })))
}

/// `GET /api/v1/calls`
pub async fn list_active_calls(state: web::Data<AppState>) -> HttpResponse {
    let mut calls: Vec<CallSummary> = state
        .registry
        .active_sessions()
        .iter()
        .map(|session| CallSummary {
            session_id: session.session_id.clone(),
            did: session.metadata.did.clone(),
            caller_name: session.metadata.caller_name.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
            playing: session.is_playing(),
            connected: session.sink().is_some(),
        })
        .collect();
    calls.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    HttpResponse::Ok().json(json!({
        "count": calls.len(),
        "calls": calls
    }))
}

/// `POST /api/v1/calls/{session_id}/hangup`
///
/// Cancels playback, asks the PBX to drop the media leg with a terminate
/// packet, and deletes the session. The media connection's own close path
/// then runs its normal cleanup when the PBX disconnects.
pub async fn hangup_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("no active call {}", session_id)))?;

    session.interrupt_playback();

    // Best-effort: if the media leg never connected there is no sink
    if let Some(sink) = session.sink() {
        let _ = sink.try_send(codec::encode_terminate());
    }

    state.registry.delete(&session_id);
    info!(%session_id, "call hung up via API");

    Ok(HttpResponse::Ok().json(json!({
        "status": "hangup",
        "sessionId": session_id
    })))
}
