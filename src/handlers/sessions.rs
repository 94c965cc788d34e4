//! Session inspection and administrative termination.
//!
//! The WebSocket connection owns the session lifecycle; these endpoints
//! exist for operators: list what is active, inspect one session, or force
//! one closed. Termination flips the session's close signal, which cancels
//! its in-flight remote calls and makes the owning connection shut down.

use crate::{error::GatewayError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, GatewayError> {
    let statuses = state.registry.statuses();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active": statuses.len(),
        "max": state.registry.capacity(),
        "sessions": statuses
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    let status = state.registry.status_of(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(status))
}

pub async fn terminate_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    let id = path.into_inner();
    state.registry.terminate(&id)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "terminated",
        "session_id": id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
