//! Framework-agnostic handlers for the read API
//!
//! Each handler returns an [`ApiResponse`] (status + JSON body) that an HTTP
//! layer can send unchanged.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::cloudflare::CloudflareClient;
use crate::error::InboxError;
use crate::models::InboxAddress;
use crate::notify::{Notification, NotificationPublisher};
use crate::router::FallbackRouter;
use crate::stream::{ChangeStream, Subscription};

/// Status code and JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            body: json!({ "error": message.into() }),
        }
    }
}

impl From<&InboxError> for ApiResponse {
    fn from(err: &InboxError) -> Self {
        let status = err.status_code();
        let body = match err {
            InboxError::Validation(message) => json!({ "error": message }),
            InboxError::Parse(e) => json!({ "error": e.to_string() }),
            InboxError::NotFound { .. } => json!({ "error": "Email not found" }),
            InboxError::RateLimited { .. } | InboxError::RetriesExhausted { .. } => json!({
                "error": "Too many requests",
                "retryAfter": err.retry_after_secs().unwrap_or(1),
            }),
            InboxError::BackendUnavailable => json!({ "error": "Storage unavailable" }),
            InboxError::Write(_) | InboxError::Storage(_) => {
                log::error!("[API] {:#}", err);
                json!({ "error": "Internal server error" })
            }
        };
        Self { status, body }
    }
}

/// Body of a delete request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub email_id: Option<String>,
}

/// Body of a manual notification request
#[derive(Debug, Default, Deserialize)]
pub struct NotifyRequest {
    pub email: Option<String>,
    pub message: Option<String>,
}

/// Decode a JSON request body, answering 400 when it is malformed
pub fn parse_body<T: DeserializeOwned>(raw: &str) -> Result<T, ApiResponse> {
    serde_json::from_str(raw).map_err(|e| ApiResponse::bad_request(format!("Invalid request body: {}", e)))
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, ApiResponse> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiResponse::bad_request(format!("{} is required", what)))
}

/// `GET /inbox?email=`
pub fn get_inbox(router: &FallbackRouter, email: Option<&str>) -> ApiResponse {
    let email = match required(email, "Email address") {
        Ok(email) => email,
        Err(response) => return response,
    };

    match router.list_by_address(email) {
        Ok(messages) => ApiResponse::ok(json!(messages)),
        Err(e) => ApiResponse::from(&e),
    }
}

/// `POST /inbox?email=` with `{ "emailId": ... }`
pub fn delete_message(router: &FallbackRouter, email: Option<&str>, request: &DeleteRequest) -> ApiResponse {
    let email = match required(email, "Email address") {
        Ok(email) => email,
        Err(response) => return response,
    };
    let id = match required(request.email_id.as_deref(), "Email ID") {
        Ok(id) => id,
        Err(response) => return response,
    };

    match router.soft_delete(email, id) {
        Ok(()) => ApiResponse::ok(json!({ "success": true })),
        Err(e) => ApiResponse::from(&e),
    }
}

/// `POST /inbox/notify` with `{ "email": ..., "message"?: ... }`
pub fn notify(publisher: &dyn NotificationPublisher, request: &NotifyRequest) -> ApiResponse {
    let address = match request.email.as_deref().map(InboxAddress::parse) {
        Some(Ok(address)) => address,
        _ => return ApiResponse::bad_request("Invalid email format"),
    };

    if !publisher.is_configured() {
        log::warn!("[API] Notification for {} requested but no channel is configured", address);
        return ApiResponse {
            status: 503,
            body: json!({ "error": "Notification channel not configured" }),
        };
    }

    let notification = Notification::new(
        address.as_str(),
        request.message.as_deref().unwrap_or("New email received"),
    );
    match publisher.publish(&address, &notification) {
        Ok(()) => ApiResponse::ok(json!({
            "success": true,
            "message": "Notification sent",
            "email": address.as_str(),
            "timestamp": notification.timestamp,
        })),
        Err(e) => {
            log::error!("[API] Notification for {} failed: {:#}", address, e);
            ApiResponse {
                status: 500,
                body: json!({ "error": "Failed to send notification" }),
            }
        }
    }
}

/// `GET /email-logs`: Email Routing events of the configured zone over `window`
pub fn email_logs(
    client: Option<&CloudflareClient>,
    zone_id: Option<&str>,
    window: chrono::Duration,
) -> ApiResponse {
    let (Some(client), Some(zone_id)) = (client, zone_id) else {
        return ApiResponse {
            status: 503,
            body: json!({ "error": "Email routing logs are not configured" }),
        };
    };

    match client.email_routing_logs(zone_id, window) {
        Ok(logs) => ApiResponse::ok(json!(logs)),
        Err(e) if e.is_rate_limited() => ApiResponse::from(&e),
        Err(e) => {
            log::error!("[API] Email routing logs for zone {} failed: {:#}", zone_id, e);
            ApiResponse {
                status: 500,
                body: json!({ "error": "Failed to fetch data from Cloudflare API." }),
            }
        }
    }
}

/// Response headers for `GET /inbox/stream`
pub fn stream_headers() -> [(&'static str, &'static str); 4] {
    [
        ("Content-Type", "text/event-stream"),
        ("Cache-Control", "no-cache"),
        ("Connection", "keep-alive"),
        ("X-Accel-Buffering", "no"),
    ]
}

/// `GET /inbox/stream?email=`: a subscription, or the error response to send instead
pub fn open_stream(stream: &ChangeStream, email: Option<&str>) -> Result<Subscription, ApiResponse> {
    let email = required(email, "Email address")?;
    stream.subscribe(email).map_err(|e| ApiResponse::from(&e))
}
