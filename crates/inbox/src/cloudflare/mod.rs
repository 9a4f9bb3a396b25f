//! Cloudflare HTTP API integration
//!
//! This module provides:
//! - A transport seam over synchronous HTTP
//! - A client for the D1 query endpoint and the Workers KV REST API
//! - Email Routing logs from the GraphQL Analytics API
//! - Response types for all of them

mod client;
mod transport;

pub use client::{CloudflareClient, DEFAULT_BASE_URL, KvExpiry};
pub use transport::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, UreqTransport, parse_retry_after,
};

#[cfg(test)]
pub(crate) use transport::testing;

/// Cloudflare API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Standard v4 response envelope
    #[derive(Debug, Deserialize)]
    pub struct Envelope<T> {
        #[serde(default)]
        pub success: bool,
        #[serde(default)]
        pub errors: Vec<ApiMessage>,
        pub result: Option<T>,
        pub result_info: Option<ResultInfo>,
    }

    impl<T> Envelope<T> {
        /// Error messages joined for logging
        pub fn error_summary(&self) -> String {
            if self.errors.is_empty() {
                return "unknown error".to_string();
            }
            self.errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ")
        }
    }

    #[derive(Debug, Deserialize)]
    pub struct ApiMessage {
        #[serde(default)]
        pub code: i64,
        #[serde(default)]
        pub message: String,
    }

    /// Pagination info; KV key listings carry a cursor here
    #[derive(Debug, Deserialize)]
    pub struct ResultInfo {
        pub cursor: Option<String>,
        pub count: Option<u64>,
    }

    /// Key returned by a KV key listing
    #[derive(Debug, Clone, Deserialize)]
    pub struct KvKey {
        pub name: String,
        /// Absolute expiry, seconds since the epoch
        pub expiration: Option<i64>,
    }

    /// Body of a D1 query request
    #[derive(Debug, Serialize)]
    pub struct D1Query<'a> {
        pub sql: &'a str,
        pub params: Vec<serde_json::Value>,
    }

    /// One statement result from a D1 query
    #[derive(Debug, Deserialize)]
    pub struct D1Result {
        #[serde(default)]
        pub results: Vec<serde_json::Value>,
        #[serde(default)]
        pub success: bool,
        pub meta: Option<D1Meta>,
    }

    impl D1Result {
        /// Rows written by the statement; zero when the server omitted it
        pub fn changes(&self) -> u64 {
            self.meta.as_ref().and_then(|m| m.changes).unwrap_or(0)
        }
    }

    #[derive(Debug, Deserialize)]
    pub struct D1Meta {
        pub changes: Option<u64>,
        pub duration: Option<f64>,
    }

    /// Row of the `emails` table as returned by D1
    #[derive(Debug, Deserialize)]
    pub struct EmailRow {
        pub id: String,
        pub to_address: String,
        pub from_address: String,
        pub from_name: Option<String>,
        pub subject: Option<String>,
        pub html_content: Option<String>,
        pub text_content: Option<String>,
        pub attachments: Option<String>,
        pub date_received: String,
        #[serde(default)]
        pub is_deleted: Option<i64>,
    }

    /// Body of a GraphQL Analytics request
    #[derive(Debug, Serialize)]
    pub struct GraphqlRequest<'a> {
        pub query: &'a str,
        pub variables: serde_json::Value,
    }

    /// GraphQL response; `errors` is non-empty when the query failed
    #[derive(Debug, Deserialize)]
    pub struct GraphqlResponse<T> {
        pub data: Option<T>,
        #[serde(default)]
        pub errors: Option<Vec<ApiMessage>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct EmailLogsData {
        pub viewer: EmailLogsViewer,
    }

    #[derive(Debug, Deserialize)]
    pub struct EmailLogsViewer {
        #[serde(default)]
        pub zones: Vec<EmailLogsZone>,
    }

    #[derive(Debug, Deserialize)]
    pub struct EmailLogsZone {
        #[serde(rename = "emailRoutingAdaptive", default)]
        pub email_routing_adaptive: Vec<EmailRoutingLog>,
    }

    /// One Email Routing event for a zone
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EmailRoutingLog {
        pub datetime: String,
        /// Routing session id
        pub id: String,
        #[serde(default)]
        pub message_id: Option<String>,
        #[serde(default)]
        pub from: Option<String>,
        #[serde(default)]
        pub to: Option<String>,
        #[serde(default)]
        pub subject: Option<String>,
        #[serde(default)]
        pub status: Option<String>,
        #[serde(default)]
        pub action: Option<String>,
    }
}
