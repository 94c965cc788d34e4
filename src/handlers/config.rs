//! Read-only configuration endpoint.
//!
//! Configuration is frozen at startup, so there is no update counterpart;
//! API keys are withheld from the response.

use crate::{error::GatewayError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    let config = &state.config;

    let providers: Vec<_> = config
        .synthesis
        .providers
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "endpoint_url": p.endpoint_url,
                "default_voice": p.default_voice
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "audio": {
                "sample_rate": config.audio.sample_rate,
                "channels": config.audio.channels,
                "bit_depth": config.audio.bit_depth,
                "min_window_ms": config.audio.min_window_ms,
                "max_window_ms": config.audio.max_window_ms,
                "hard_max_ms": config.audio.hard_max_ms
            },
            "session": {
                "max_concurrent": config.session.max_concurrent,
                "idle_timeout_secs": config.session.idle_timeout_secs,
                "sweep_interval_secs": config.session.sweep_interval_secs
            },
            "transcription": {
                "endpoint_url": config.transcription.endpoint_url,
                "model": config.transcription.model,
                "timeout_ms": config.transcription.timeout_ms,
                "retry_backoff_ms": config.transcription.retry_backoff_ms
            },
            "synthesis": {
                "providers": providers,
                "request_timeout_ms": config.synthesis.request_timeout_ms,
                "breaker_failure_threshold": config.synthesis.breaker_failure_threshold,
                "breaker_cooldown_ms": config.synthesis.breaker_cooldown_ms
            }
        }
    })))
}
