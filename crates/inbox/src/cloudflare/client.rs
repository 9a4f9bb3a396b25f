//! Cloudflare API client
//!
//! Every call runs under a [`RetryPolicy`]: key listings and D1 list queries
//! use the `list` budget, single value reads and writes use the `fetch`
//! budget. A 429 becomes [`InboxError::RateLimited`] carrying the server's
//! `Retry-After`, which the policy honours.

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use url::Url;

use super::api::{
    D1Query, D1Result, EmailLogsData, EmailRoutingLog, Envelope, GraphqlRequest, GraphqlResponse,
    KvKey,
};
use super::transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, UreqTransport};
use crate::config::InboxConfig;
use crate::error::{InboxError, Result};
use crate::models::canonical_timestamp;
use crate::retry::{RetryBudgets, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

const JSON: &str = "application/json";
const TEXT: &str = "text/plain";

/// Page size for KV key listings (the API maximum)
const KV_LIST_LIMIT: &str = "1000";

/// Newest 100 Email Routing events of a zone inside a time window
const EMAIL_LOGS_QUERY: &str = r#"query GetEmailLogs($zoneTag: string, $filter: EmailRoutingAdaptiveFilter_InputObject) {
  viewer {
    zones(filter: {zoneTag: $zoneTag}) {
      emailRoutingAdaptive(limit: 100, filter: $filter, orderBy: [datetime_DESC]) {
        datetime
        id: sessionId
        messageId
        from
        to
        subject
        status
        action
      }
    }
  }
}"#;

/// Expiry attached to a KV write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvExpiry {
    /// Seconds from now
    Ttl(u64),
    /// Absolute time, seconds since the epoch
    At(i64),
}

/// Client for the D1 and Workers KV HTTP APIs of one account
pub struct CloudflareClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    account_id: String,
    api_token: String,
    retry: RetryBudgets,
}

impl CloudflareClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        account_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            account_id: account_id.into(),
            api_token: api_token.into(),
            retry: RetryBudgets::default(),
        }
    }

    /// Point the client at another API root (must be an http(s) URL)
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| InboxError::Validation(format!("invalid API base URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(InboxError::Validation(format!(
                "API base URL must be http(s), got {}",
                parsed.scheme()
            )));
        }
        self.base_url = base_url.trim_end_matches('/').to_string();
        Ok(self)
    }

    /// Client for the configured account, if credentials are set
    pub fn from_config(config: &InboxConfig) -> Result<Option<Self>> {
        let cf = &config.cloudflare;
        let Some((account_id, api_token)) = cf.credentials() else {
            return Ok(None);
        };
        let transport = Arc::new(UreqTransport::new(config.http_timeout()));
        let mut client =
            CloudflareClient::new(transport, account_id, api_token).with_retry(config.retry_budgets());
        if let Some(base_url) = &cf.base_url {
            client = client.with_base_url(base_url)?;
        }
        Ok(Some(client))
    }

    pub fn with_retry(mut self, retry: RetryBudgets) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_budgets(&self) -> RetryBudgets {
        self.retry
    }

    /// Run one SQL statement against a D1 database
    pub fn d1_query(
        &self,
        database_id: &str,
        sql: &str,
        params: Vec<serde_json::Value>,
        policy: RetryPolicy,
    ) -> Result<D1Result> {
        let url = format!(
            "{}/accounts/{}/d1/database/{}/query",
            self.base_url, self.account_id, database_id
        );
        let body = serde_json::to_string(&D1Query { sql, params })
            .context("Failed to encode D1 query")?;

        policy.run(|_attempt| {
            let response = self.send(HttpMethod::Post, url.clone(), JSON, Some(body.clone()))?;
            let envelope: Envelope<Vec<D1Result>> = decode_envelope(&response, "D1 query")?;
            envelope
                .result
                .and_then(|results| results.into_iter().next())
                .ok_or_else(|| InboxError::from(anyhow!("D1 query returned no result")))
        })
    }

    /// List every key under `prefix`, following cursors until exhausted
    pub fn kv_list_keys(&self, namespace_id: &str, prefix: &str) -> Result<Vec<KvKey>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = Url::parse(&format!(
                "{}/accounts/{}/storage/kv/namespaces/{}/keys",
                self.base_url, self.account_id, namespace_id
            ))
            .context("Invalid KV keys URL")?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                query.append_pair("limit", KV_LIST_LIMIT);
                if let Some(cursor) = &cursor {
                    query.append_pair("cursor", cursor);
                }
            }
            let url = url.to_string();

            let envelope: Envelope<Vec<KvKey>> = self.retry.list.run(|_attempt| {
                let response = self.send(HttpMethod::Get, url.clone(), JSON, None)?;
                decode_envelope(&response, "KV key listing")
            })?;

            keys.extend(envelope.result.unwrap_or_default());
            cursor = envelope
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
            log::debug!("[CF] KV listing continues, {} keys so far", keys.len());
        }

        Ok(keys)
    }

    /// Read a KV value; `None` when the key does not exist
    pub fn kv_get(&self, namespace_id: &str, key: &str) -> Result<Option<String>> {
        let url = self.kv_value_url(namespace_id, key);

        self.retry.fetch.run(|_attempt| {
            let response = self.send(HttpMethod::Get, url.clone(), TEXT, None)?;
            match response.status {
                404 => Ok(None),
                _ if response.is_success() => Ok(Some(response.body)),
                status => Err(anyhow!("KV read failed with HTTP {}: {}", status, snippet(&response.body)).into()),
            }
        })
    }

    /// Write a KV value with an expiry
    pub fn kv_put(&self, namespace_id: &str, key: &str, value: &str, expiry: KvExpiry) -> Result<()> {
        let mut url = Url::parse(&self.kv_value_url(namespace_id, key)).context("Invalid KV value URL")?;
        let (param, value_str) = match expiry {
            KvExpiry::Ttl(secs) => ("expiration_ttl", secs.to_string()),
            KvExpiry::At(epoch) => ("expiration", epoch.to_string()),
        };
        url.query_pairs_mut().append_pair(param, &value_str);
        let url = url.to_string();

        self.retry.fetch.run(|_attempt| {
            let response = self.send(HttpMethod::Put, url.clone(), TEXT, Some(value.to_string()))?;
            decode_envelope::<serde_json::Value>(&response, "KV write").map(|_| ())
        })
    }

    /// Email Routing events of a zone over the last `window`, newest first
    pub fn email_routing_logs(&self, zone_id: &str, window: chrono::Duration) -> Result<Vec<EmailRoutingLog>> {
        let until = Utc::now();
        self.email_routing_logs_between(zone_id, until - window, until)
    }

    pub fn email_routing_logs_between(
        &self,
        zone_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<EmailRoutingLog>> {
        let request = GraphqlRequest {
            query: EMAIL_LOGS_QUERY,
            variables: json!({
                "zoneTag": zone_id,
                "filter": {
                    "datetime_geq": canonical_timestamp(&since),
                    "datetime_leq": canonical_timestamp(&until),
                },
            }),
        };
        let body = serde_json::to_string(&request).context("Failed to encode GraphQL query")?;
        let url = format!("{}/graphql", self.base_url);

        let response: GraphqlResponse<EmailLogsData> = self.retry.list.run(|_attempt| {
            let response = self.send(HttpMethod::Post, url.clone(), JSON, Some(body.clone()))?;
            if !response.is_success() {
                return Err(anyhow!(
                    "Email routing logs failed with HTTP {}: {}",
                    response.status,
                    snippet(&response.body)
                )
                .into());
            }
            let decoded: GraphqlResponse<EmailLogsData> = serde_json::from_str(&response.body)
                .context("Failed to decode email routing logs")?;
            Ok(decoded)
        })?;

        if let Some(errors) = response.errors.filter(|errors| !errors.is_empty()) {
            let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
            return Err(anyhow!("Email routing logs query failed: {}", messages.join("; ")).into());
        }

        let logs: Vec<EmailRoutingLog> = response
            .data
            .map(|data| {
                data.viewer
                    .zones
                    .into_iter()
                    .flat_map(|zone| zone.email_routing_adaptive)
                    .collect()
            })
            .unwrap_or_default();
        log::debug!("[CF] {} email routing events for zone {}", logs.len(), zone_id);
        Ok(logs)
    }

    fn kv_value_url(&self, namespace_id: &str, key: &str) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values/{}",
            self.base_url,
            self.account_id,
            namespace_id,
            urlencoding::encode(key)
        )
    }

    fn send(
        &self,
        method: HttpMethod,
        url: String,
        content_type: &'static str,
        body: Option<String>,
    ) -> Result<HttpResponse> {
        let request = HttpRequest {
            method,
            url,
            bearer_token: self.api_token.clone(),
            content_type,
            body,
        };
        let response = self.transport.send(&request)?;

        if response.status == 429 {
            log::debug!(
                "[CF] {} rate limited (retry-after {:?})",
                method.as_str(),
                response.retry_after
            );
            return Err(InboxError::RateLimited {
                retry_after: response.retry_after,
            });
        }
        Ok(response)
    }
}

/// Decode a v4 envelope, turning HTTP or API level failures into errors
fn decode_envelope<T: DeserializeOwned>(response: &HttpResponse, what: &str) -> Result<Envelope<T>> {
    if !response.is_success() {
        let detail = serde_json::from_str::<Envelope<serde_json::Value>>(&response.body)
            .map(|e| e.error_summary())
            .unwrap_or_else(|_| snippet(&response.body));
        return Err(anyhow!("{} failed with HTTP {}: {}", what, response.status, detail).into());
    }

    let envelope: Envelope<T> = serde_json::from_str(&response.body)
        .with_context(|| format!("Failed to decode {} response", what))?;
    if !envelope.success {
        return Err(anyhow!("{} failed: {}", what, envelope.error_summary()).into());
    }
    Ok(envelope)
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
