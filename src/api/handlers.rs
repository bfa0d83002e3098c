use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

use crate::errors::AppError;
use crate::models::decision::LocalResolution;
use crate::models::AskRequest;
use crate::relay::Relay;

#[derive(Debug, Serialize)]
pub struct ProbeResponse {
    pub status: &'static str,
    pub mode: &'static str,
    pub connected: bool,
}

pub async fn probe(State(relay): State<Arc<Relay>>) -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "operational",
        mode: "tunnel",
        connected: relay.is_connected(),
    })
}

/// Holds the connection until the ask is decided, its hold timeout passes,
/// or the client goes away. Dropping this future releases the pending entry.
pub async fn ingest(
    State(relay): State<Arc<Relay>>,
    body: Bytes,
) -> Result<Json<LocalResolution>, AppError> {
    let ask = parse_ask(&body)?;
    let parked = relay.park(ask).await?;
    let request_id = parked.request_id.clone();

    let decision = parked.wait().await?;
    tracing::info!(request_id = %request_id, status = %decision.status, "ask resolved");
    Ok(Json(LocalResolution::from(decision)))
}

fn parse_ask(body: &[u8]) -> Result<AskRequest, AppError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidRequest(format!("body is not JSON: {}", e)))?;
    if !value.is_object() {
        return Err(AppError::InvalidRequest("body must be a JSON object".into()));
    }
    serde_json::from_value(value).map_err(|e| AppError::InvalidRequest(e.to_string()))
}

/// Unknown paths: GET answers with the probe, anything else is 404.
pub async fn fallback(State(relay): State<Arc<Relay>>, method: Method) -> Response {
    if method == Method::GET {
        probe(State(relay)).await.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
