//! One-shot shutdown signal observed by background tasks.
//!
//! Unlike a broadcast channel, a listener created after the signal fired
//! still sees it.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered. Cancel-safe.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_late_listener_sees_signal() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut listener = shutdown.listener();
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .unwrap();
        assert!(listener.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_triggered() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();
        assert!(tokio::time::timeout(Duration::from_millis(20), listener.wait())
            .await
            .is_err());
        shutdown.trigger();
        listener.wait().await;
    }
}
