//! Producing messages.
//!
//! The producer is a thin dispatcher: messages with a delay go to the delay
//! queue and surface later through the promoter; everything else is appended
//! to its partition log immediately.

use crate::error::Result;
use furrow_core::Message;
use furrow_store::BrokerStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sends messages into the broker.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn BrokerStore>,
}

impl Producer {
    pub(crate) fn new(store: Arc<dyn BrokerStore>) -> Self {
        Self { store }
    }

    /// Sends a message and waits for it to be durable. Returns the message
    /// id (assigned if the message did not carry one).
    pub async fn send_sync(&self, msg: Message) -> Result<String> {
        let id = if msg.delay > Duration::ZERO {
            self.store.add_delay_message(msg).await?
        } else {
            self.store.save_message(msg).await?
        };
        Ok(id)
    }

    /// Sends a message on a background task. The call returns immediately;
    /// `callback` is invoked exactly once with the outcome.
    pub fn send_async(
        &self,
        msg: Message,
        callback: impl FnOnce(Result<String>) + Send + 'static,
    ) {
        let producer = self.clone();
        tokio::spawn(async move {
            let result = producer.send_sync(msg).await;
            if let Err(e) = &result {
                debug!(error = %e, "async send failed");
            }
            callback(result);
        });
    }
}
