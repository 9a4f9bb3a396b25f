//! HTTP transport used by the Cloudflare client
//!
//! Uses synchronous HTTP (ureq) to stay executor-agnostic. Non-2xx statuses
//! are returned as responses rather than errors so callers can read the
//! `Retry-After` header of a 429.

use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub bearer_token: String,
    pub content_type: &'static str,
    pub body: Option<String>,
}

/// Response as seen by the client, whatever the status
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, when present
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one HTTP request
pub trait HttpTransport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Production transport backed by a shared ureq agent
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl HttpTransport for UreqTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let auth = format!("Bearer {}", request.bearer_token);
        let body = request.body.as_deref().unwrap_or("");

        let result = match request.method {
            HttpMethod::Get => self
                .agent
                .get(&request.url)
                .header("Authorization", &auth)
                .call(),
            HttpMethod::Delete => self
                .agent
                .delete(&request.url)
                .header("Authorization", &auth)
                .call(),
            HttpMethod::Post => self
                .agent
                .post(&request.url)
                .header("Authorization", &auth)
                .header("Content-Type", request.content_type)
                .send(body),
            HttpMethod::Put => self
                .agent
                .put(&request.url)
                .header("Authorization", &auth)
                .header("Content-Type", request.content_type)
                .send(body),
        };

        let mut response = result
            .with_context(|| format!("Failed to send {} request", request.method.as_str()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .body_mut()
            .read_to_string()
            .context("Failed to read response body")?;

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Parse a `Retry-After` value given in (possibly fractional) seconds
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
