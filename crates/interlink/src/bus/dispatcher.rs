//! Routing envelopes by message type.
//!
//! A bus subscription delivers everything on a channel. When one channel
//! carries several message types, subscribe a [`TypeDispatcher`] and
//! register per-type handlers on it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::envelope::Envelope;
use crate::error::{require_non_blank, HandlerError, MessagingError};
use crate::handler::{invoke_guarded, same_handler, MessageHandler};

#[derive(Default)]
pub struct TypeDispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
}

impl TypeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `message_type`. Registering the same handler
    /// instance twice for a type has no effect.
    pub fn register(
        &self,
        message_type: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessagingError> {
        require_non_blank(message_type, "message type")?;
        let mut handlers = self.handlers.write();
        let entry = handlers.entry(message_type.to_string()).or_default();
        if !entry.iter().any(|existing| same_handler(existing, &handler)) {
            entry.push(handler);
        }
        Ok(())
    }

    /// Removes every handler for `message_type`.
    pub fn clear(&self, message_type: &str) {
        self.handlers.write().remove(message_type);
    }

    pub fn handler_count(&self, message_type: &str) -> usize {
        self.handlers.read().get(message_type).map_or(0, Vec::len)
    }
}

impl MessageHandler for TypeDispatcher {
    fn on_message(&self, channel: &str, envelope: &Envelope) -> Result<(), HandlerError> {
        let handlers = self
            .handlers
            .read()
            .get(envelope.message_type())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            trace!("No handler for type '{}' on '{}'", envelope.message_type(), channel);
        }
        for handler in handlers {
            invoke_guarded(envelope.message_type(), || handler.on_message(channel, envelope));
        }
        Ok(())
    }
}
