//! Inbound mail ingestion: parse, store, announce

use std::sync::Arc;

use crate::error::Result;
use crate::models::{InboxAddress, MessageId};
use crate::notify::{Notification, NotificationPublisher, publish_best_effort};
use crate::parser::MessageParser;
use crate::router::FallbackRouter;
use crate::storage::BackendKind;

/// Result of ingesting one raw message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub message_id: MessageId,
    pub to_address: String,
    pub stored_in: BackendKind,
    pub mirrored_to: Option<BackendKind>,
    /// Whether a notification was delivered to the publish channel
    pub notified: bool,
}

pub struct Ingestor {
    parser: MessageParser,
    router: Arc<FallbackRouter>,
    publisher: Option<Arc<dyn NotificationPublisher>>,
}

impl Ingestor {
    pub fn new(router: Arc<FallbackRouter>) -> Self {
        Self {
            parser: MessageParser::new(),
            router,
            publisher: None,
        }
    }

    pub fn with_parser(mut self, parser: MessageParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn NotificationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Parse `raw`, store it and publish a best-effort notification.
    ///
    /// Parse failures abort before anything is written. Notification
    /// failures are logged and reported through `notified`.
    pub fn ingest(&self, raw: &[u8]) -> Result<IngestOutcome> {
        let message = self.parser.parse(raw).inspect_err(|e| {
            log::warn!("[INGEST] Rejected inbound mail: {}", e);
        })?;

        let outcome = self.router.append(&message)?;
        log::info!(
            "[INGEST] Stored {} for {} in {}",
            message.id,
            message.to_address,
            outcome.stored_in
        );

        let notified = match &self.publisher {
            Some(publisher) => {
                // append already validated the address
                let address = InboxAddress::parse(&message.to_address)?;
                publish_best_effort(publisher.as_ref(), &address, &Notification::new_mail(&message))
            }
            None => false,
        };

        Ok(IngestOutcome {
            message_id: message.id,
            to_address: message.to_address,
            stored_in: outcome.stored_in,
            mirrored_to: outcome.mirrored_to,
            notified,
        })
    }
}
