use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::db::models::{ChangeType, SubscriptionState, SubscriptionView};
use crate::http::error::ApiError;
use crate::http::AppState;
use crate::subscriptions::{CallbackUrls, MAX_SUBSCRIPTION_TTL_MINUTES};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub resource: Option<String>,
    pub change_type: Option<String>,
    pub ttl_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CreatedBody {
    status: &'static str,
    message: String,
    webhook_url: String,
    #[serde(flatten)]
    subscription: SubscriptionView,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    state: Option<String>,
}

fn callbacks_for(state: &AppState, headers: &HeaderMap) -> Result<CallbackUrls, ApiError> {
    if let Some(configured) = state.manager.callbacks() {
        return Ok(configured.clone());
    }
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("no public url configured and no Host header"))?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("https");
    Ok(CallbackUrls::from_base(&format!("{scheme}://{host}")))
}

#[instrument(name = "api.create_subscription", skip_all)]
pub async fn create_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CreateSubscriptionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSubscriptionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|error| ApiError::bad_request(error.to_string()))?
    };

    let resource = request
        .resource
        .or_else(|| state.defaults.resource.clone())
        .ok_or_else(|| ApiError::bad_request("resource is required when AZURE_USER_ID is unset"))?;
    let change_type = match request.change_type {
        Some(raw) => raw.parse::<ChangeType>().map_err(ApiError::bad_request)?,
        None => state.defaults.change_type.clone(),
    };
    let ttl = match request.ttl_minutes {
        Some(minutes) if minutes <= 0 => {
            return Err(ApiError::bad_request("ttlMinutes must be positive"));
        }
        Some(minutes) => Duration::minutes(minutes.min(MAX_SUBSCRIPTION_TTL_MINUTES)),
        None => state.defaults.ttl,
    };
    let callbacks = callbacks_for(&state, &headers)?;

    let subscription = state
        .manager
        .create_with(&resource, &change_type, ttl, &callbacks)
        .await?;
    info!(id = %subscription.id, "subscription created via api");

    let body = CreatedBody {
        status: "success",
        message: "Subscription created successfully".to_string(),
        webhook_url: callbacks.notification_url,
        subscription: subscription.view(),
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SubscriptionView>>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<SubscriptionState>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let states = filter.map(|state| [state]);
    let subscriptions = state.manager.list(states.as_ref().map(|s| s.as_slice()))?;
    Ok(Json(subscriptions.iter().map(|s| s.view()).collect()))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionView>, ApiError> {
    Ok(Json(state.manager.get(&id)?.view()))
}

#[instrument(name = "api.renew_subscription", skip(state))]
pub async fn renew_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionView>, ApiError> {
    Ok(Json(state.manager.renew(&id).await?.view()))
}

#[instrument(name = "api.retire_subscription", skip(state))]
pub async fn retire_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionView>, ApiError> {
    Ok(Json(state.manager.retire(&id).await?.view()))
}
