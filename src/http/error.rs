use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::SubscriptionError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    detail: String,
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Invalid request", detail)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                status: "error",
                message: self.message,
                error: self.detail,
            }),
        )
            .into_response()
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(value: SubscriptionError) -> Self {
        let detail = value.to_string();
        match value {
            SubscriptionError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "Subscription not found", detail)
            }
            SubscriptionError::AlreadyActive { .. }
            | SubscriptionError::CreateInFlight { .. }
            | SubscriptionError::RenewalInFlight(_)
            | SubscriptionError::NotRenewable { .. }
            | SubscriptionError::Expired(_) => {
                Self::new(StatusCode::CONFLICT, "Subscription state conflict", detail)
            }
            SubscriptionError::InvalidRequest(_) | SubscriptionError::MissingNotificationUrl => {
                Self::bad_request(detail)
            }
            SubscriptionError::HandshakeTimeout { .. } | SubscriptionError::Create { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "Failed to create subscription", detail)
            }
            SubscriptionError::RenewalTransient { .. }
            | SubscriptionError::RenewalPermanent { .. }
            | SubscriptionError::RenewalExhausted { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "Failed to renew subscription", detail)
            }
            SubscriptionError::SecretGeneration
            | SubscriptionError::Interrupted { .. }
            | SubscriptionError::Store(_) => {
                error!(error = %detail, "subscription api internal failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error", detail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::ApiError;
    use crate::db::models::SubscriptionState;
    use crate::error::SubscriptionError;

    #[test]
    fn maps_lifecycle_errors_to_statuses() {
        let cases = [
            (SubscriptionError::NotFound("a".into()), StatusCode::NOT_FOUND),
            (SubscriptionError::RenewalInFlight("a".into()), StatusCode::CONFLICT),
            (
                SubscriptionError::NotRenewable {
                    id: "a".into(),
                    state: SubscriptionState::Failed,
                },
                StatusCode::CONFLICT,
            ),
            (SubscriptionError::MissingNotificationUrl, StatusCode::BAD_REQUEST),
            (
                SubscriptionError::RenewalPermanent {
                    id: "a".into(),
                    reason: "403".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }
}
