use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::http::AppState;
use crate::notifications::{BatchStatus, NotificationValidator};

#[derive(Debug, Deserialize)]
pub struct ValidationQuery {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

fn handshake_response(token: &str) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        NotificationValidator::handshake(token),
    )
        .into_response()
}

pub async fn notify_validation(
    Query(ValidationQuery { validation_token }): Query<ValidationQuery>,
) -> Response {
    match validation_token {
        Some(token) => handshake_response(&token),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

#[instrument(name = "webhook.notify", skip_all)]
pub async fn notify(
    State(state): State<AppState>,
    Query(ValidationQuery { validation_token }): Query<ValidationQuery>,
    body: Bytes,
) -> Response {
    if let Some(token) = validation_token {
        return handshake_response(&token);
    }

    let report = match state.dispatcher.dispatch_body(&body).await {
        Ok(report) => report,
        Err(error) => {
            warn!(error = %error, "rejecting unparseable notification body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match report.status() {
        BatchStatus::Acknowledged => StatusCode::OK.into_response(),
        BatchStatus::HandlerFailure => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        BatchStatus::Saturated => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[instrument(name = "webhook.lifecycle", skip_all)]
pub async fn lifecycle(
    State(state): State<AppState>,
    Query(ValidationQuery { validation_token }): Query<ValidationQuery>,
    body: Bytes,
) -> Response {
    if let Some(token) = validation_token {
        return handshake_response(&token);
    }

    match state.lifecycle.process_body(&body).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(error) => {
            warn!(error = %error, "rejecting unparseable lifecycle body");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

pub async fn healthz() -> &'static str {
    "ok"
}
