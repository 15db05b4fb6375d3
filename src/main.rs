//! # Voice Bridge Backend - Main Application Entry Point
//!
//! Bootstraps both listeners: the PBX-facing TCP audio socket and the
//! actix-web HTTP API. All the actual machinery lives in the library crate.

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_bridge_backend::assistant::http::{
    build_client, HttpResponseGenerator, HttpSpeechToText, HttpTextToSpeech,
};
use voice_bridge_backend::assistant::Collaborators;
use voice_bridge_backend::audio::playback::PlaybackScheduler;
use voice_bridge_backend::audio::session::SessionRegistry;
use voice_bridge_backend::audio::socket::{AudioSocketServer, CallPipeline};
use voice_bridge_backend::config::AppConfig;
use voice_bridge_backend::state::AppState;
use voice_bridge_backend::{handlers, health, middleware};

/// Global shutdown flag, set by the signal handler task and polled by the
/// main select loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-bridge-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "HTTP on {}:{}, audio socket on {}:{}",
        config.server.host, config.server.port, config.audiosocket.host, config.audiosocket.port
    );

    let registry = Arc::new(SessionRegistry::new());
    let app_state = AppState::new(config.clone(), Arc::clone(&registry));

    // Registry sweep: lazy expiry in get() handles lookups, this catches
    // sessions nobody ever asks about again
    let sweep_registry = Arc::clone(&registry);
    let sweep_interval = Duration::from_secs(config.session.sweep_interval_seconds);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep_registry.sweep_expired();
        }
    });

    // Collaborators share one pooled HTTP client
    let client = build_client(&config.collaborators)
        .context("building collaborator HTTP client")?;
    let collaborators = Collaborators {
        stt: Arc::new(HttpSpeechToText::new(client.clone(), &config.collaborators)),
        tts: Arc::new(HttpTextToSpeech::new(
            client.clone(),
            &config.collaborators,
            config.audio.sample_rate,
        )),
        responder: Arc::new(HttpResponseGenerator::new(client, &config.collaborators)),
    };

    let pipeline = Arc::new(CallPipeline::new(
        collaborators,
        PlaybackScheduler::new(config.audio.sample_rate, config.audio.frame_duration_ms),
        config.speech.clone(),
    ));

    let audio_server = Arc::new(AudioSocketServer::new(
        Arc::clone(&registry),
        pipeline,
        config.audio.clone(),
        config.vad.clone(),
    ));
    let audio_addr = format!("{}:{}", config.audiosocket.host, config.audiosocket.port);
    let audio_listener = TcpListener::bind(&audio_addr)
        .await
        .with_context(|| format!("binding audio socket on {}", audio_addr))?;
    let audio_task = tokio::spawn(audio_server.serve(audio_listener));

    setup_signal_handlers();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route(
                        "/calls/metadata",
                        web::post().to(handlers::register_call_metadata),
                    )
                    .route("/calls", web::get().to(handlers::list_active_calls))
                    .route(
                        "/calls/{session_id}/hangup",
                        web::post().to(handlers::hangup_call),
                    ),
            )
            // Health check at root level too, for load balancers
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        result = audio_task => {
            match result {
                Ok(Ok(())) => info!("Audio socket server stopped"),
                Ok(Err(e)) => error!("Audio socket server error: {}", e),
                Err(e) => error!("Audio socket task error: {}", e),
            }
            server_handle.stop(true).await;
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// SIGTERM/SIGINT set the shutdown flag; the main select loop does the rest.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
