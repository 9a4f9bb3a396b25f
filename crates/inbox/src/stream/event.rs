//! Events pushed to stream subscribers

use serde::{Deserialize, Serialize};

use crate::models::Message;

/// One Server-Sent Event payload, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Inbox contents after a count change (and on the first poll)
    Update {
        emails: Vec<Message>,
        count: usize,
        timestamp: String,
    },
    /// Poll completed with an unchanged count
    Heartbeat { timestamp: String },
    /// Poll failed; the stream stays open
    Error {
        message: String,
        timestamp: String,
        #[serde(
            rename = "retryAfter",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        retry_after: Option<u64>,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Update { .. } => "update",
            StreamEvent::Heartbeat { .. } => "heartbeat",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            StreamEvent::Update { timestamp, .. }
            | StreamEvent::Heartbeat { timestamp }
            | StreamEvent::Error { timestamp, .. } => timestamp,
        }
    }

    /// Frame as `data: <json>\n\n`
    pub fn to_sse(&self) -> serde_json::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}
