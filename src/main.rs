//! # Voice Gateway Backend - Main Application Entry Point
//!
//! Realtime voice streaming gateway. Clients hold one WebSocket connection
//! each; the gateway buffers their audio into windows, dispatches the
//! windows to a speech-to-text backend, and streams synthesized speech back
//! through a provider chain guarded by circuit breakers.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared collaborators handed to every handler
//! - **audio**: window buffering and sample format validation
//! - **session**: per-connection state machines, registry, result ordering
//! - **transcription**: speech-to-text dispatch with bounded timeout/retry
//! - **synthesis**: provider chain behind per-provider circuit breakers
//! - **gateway**: the WebSocket protocol actor
//! - **health / handlers / middleware**: REST surface and observability

mod audio;
mod config;
mod error;
mod gateway;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod synthesis;
mod transcription;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use session::SessionRegistry;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synthesis::SpeechSynthesisRouter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::HttpTranscriptionClient;

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-gateway-backend v{}", env!("CARGO_PKG_VERSION"));

    // Build the collaborators every connection shares.
    let registry = Arc::new(SessionRegistry::new(
        config.session.max_concurrent,
        Duration::from_secs(config.session.idle_timeout_secs),
    ));
    let transcriber = Arc::new(HttpTranscriptionClient::new(config.transcription.clone()));
    let synthesizer = Arc::new(SpeechSynthesisRouter::from_config(&config.synthesis));

    info!(
        "Configuration loaded: {}:{}, {} max sessions, {} synthesis providers",
        config.server.host,
        config.server.port,
        config.session.max_concurrent,
        synthesizer.provider_count()
    );

    // Abandoned connections release their session slots on a fixed cadence.
    session::spawn_idle_sweeper(
        Arc::clone(&registry),
        Duration::from_secs(config.session.sweep_interval_secs),
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, registry, transcriber, synthesizer);

    setup_signal_handlers();

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
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route(
                        "/sessions/{id}",
                        web::delete().to(handlers::terminate_session),
                    ),
            )
            .route("/ws/voice", web::get().to(gateway::voice_websocket))
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to the console; `RUST_LOG` overrides the defaults.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_gateway_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip the shutdown flag on SIGTERM or SIGINT so in-flight requests drain
/// before the process exits.
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
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
