use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config` — current configuration snapshot.
///
/// Collaborator URLs are included, credentials never appear in config, and
/// nothing here is writable at runtime.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "audiosocket": {
                "host": config.audiosocket.host,
                "port": config.audiosocket.port
            },
            "audio": {
                "sample_rate": config.audio.sample_rate,
                "frame_duration_ms": config.audio.frame_duration_ms
            },
            "vad": {
                "hangover_ms": config.vad.hangover_ms,
                "energy_threshold": config.vad.energy_threshold
            },
            "session": {
                "ttl_seconds": config.session.ttl_seconds,
                "sweep_interval_seconds": config.session.sweep_interval_seconds
            },
            "collaborators": {
                "stt_url": config.collaborators.stt_url,
                "tts_url": config.collaborators.tts_url,
                "assistant_url": config.collaborators.assistant_url,
                "language": config.collaborators.language,
                "voice": config.collaborators.voice,
                "request_timeout_ms": config.collaborators.request_timeout_ms
            }
        }
    }))
}
