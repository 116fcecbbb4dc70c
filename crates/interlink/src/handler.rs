//! Application-facing handler traits.
//!
//! Handlers are plain synchronous callbacks. Closures with the right
//! signature implement the traits automatically. A handler that returns an
//! error or panics is logged and otherwise ignored; it never affects other
//! handlers or the engine that invoked it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, warn};

use crate::envelope::Envelope;
use crate::error::HandlerError;

/// Receives relay payloads addressed to this node.
pub trait RelayHandler: Send + Sync + 'static {
    fn on_data(&self, source_id: &str, payload: &[u8]) -> Result<(), HandlerError>;
}

impl<F> RelayHandler for F
where
    F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn on_data(&self, source_id: &str, payload: &[u8]) -> Result<(), HandlerError> {
        self(source_id, payload)
    }
}

/// Receives bus envelopes for a subscribed channel.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, channel: &str, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn on_message(&self, channel: &str, envelope: &Envelope) -> Result<(), HandlerError> {
        self(channel, envelope)
    }
}

/// Identity comparison for handler instances, ignoring vtable pointers.
pub(crate) fn same_handler<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Runs a handler invocation, containing errors and panics.
pub(crate) fn invoke_guarded<F>(context: &str, call: F)
where
    F: FnOnce() -> Result<(), HandlerError>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Handler for {} failed: {}", context, e),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("💥 Handler for {} panicked: {}", context, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler = move |_: &str, payload: &[u8]| -> Result<(), HandlerError> {
            counter.fetch_add(payload.len(), Ordering::SeqCst);
            Ok(())
        };
        handler.on_data("velocity", b"abc").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_invoke_guarded_contains_panics() {
        invoke_guarded("test", || panic!("boom"));
        invoke_guarded("test", || Err("bad".into()));
    }

    #[test]
    fn test_same_handler() {
        let a: Arc<dyn RelayHandler> =
            Arc::new(|_: &str, _: &[u8]| -> Result<(), HandlerError> { Ok(()) });
        let b: Arc<dyn RelayHandler> =
            Arc::new(|_: &str, _: &[u8]| -> Result<(), HandlerError> { Ok(()) });
        assert!(same_handler(&a, &a.clone()));
        assert!(!same_handler(&a, &b));
    }
}
