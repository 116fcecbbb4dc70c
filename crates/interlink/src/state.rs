//! Connection state shared by the relay channel and the bus.
//!
//! Both engines follow the same lifecycle:
//!
//! ```text
//! STOPPED ──start()──> CONNECTING ──ok──> RUNNING
//!                          │  ^              │
//!                 failures │  └──lost link───┘
//!                          v
//!                       DEGRADED
//! ```
//!
//! A relay spoke only reaches `DEGRADED` once its reconnect attempts are used up
//! and stays there. The bus parks in `DEGRADED` while it keeps retrying and
//! goes straight back to `RUNNING` when a reconnect succeeds. `stop()` moves
//! any state to `STOPPED` for good.
//!
//! [`StateMachine`] owns the current value, refuses restarts once stopped,
//! and logs every transition. Observers watch it through a
//! [`tokio::sync::watch`] receiver.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::error::MessagingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Stopped,
    Connecting,
    Running,
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Stopped => "STOPPED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Running => "RUNNING",
            ConnectionState::Degraded => "DEGRADED",
        };
        f.write_str(name)
    }
}

/// Called with `(from, to)` after every effective transition.
pub type TransitionHook = Box<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Outcome of [`StateMachine::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// This call started the instance.
    Started,
    /// The instance was already running; nothing to do.
    AlreadyStarted,
}

pub struct StateMachine {
    component: &'static str,
    label: String,
    tx: watch::Sender<ConnectionState>,
    started: AtomicBool,
    stopped: AtomicBool,
    hook: Option<TransitionHook>,
}

impl StateMachine {
    /// Creates a machine in `STOPPED`. `component` names the kind of engine
    /// in errors, `label` identifies this instance in logs.
    pub fn new(component: &'static str, label: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Stopped);
        Self {
            component,
            label: label.into(),
            tx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            hook: None,
        }
    }

    /// Adds a hook invoked after each transition.
    pub fn with_hook(mut self, hook: TransitionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Marks the instance started.
    ///
    /// # Errors
    ///
    /// [`MessagingError::Stopped`] if `shutdown` was ever called.
    pub fn begin(&self) -> Result<StartOutcome, MessagingError> {
        if self.is_stopped() {
            return Err(MessagingError::Stopped(self.component));
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(StartOutcome::AlreadyStarted);
        }
        // stop() may have raced between the two checks
        if self.is_stopped() {
            return Err(MessagingError::Stopped(self.component));
        }
        Ok(StartOutcome::Started)
    }

    /// Fails with [`MessagingError::Stopped`] once the instance is stopped.
    pub fn ensure_usable(&self) -> Result<(), MessagingError> {
        if self.is_stopped() {
            Err(MessagingError::Stopped(self.component))
        } else {
            Ok(())
        }
    }

    /// Moves to `to`. Returns `false` if already there or if the machine
    /// has been shut down (only `Stopped` is accepted then).
    pub fn transition(&self, to: ConnectionState) -> bool {
        let stopped = self.is_stopped();
        let mut from = to;
        let changed = self.tx.send_if_modified(|current| {
            if *current == to || (stopped && to != ConnectionState::Stopped) {
                return false;
            }
            from = *current;
            *current = to;
            true
        });
        if changed {
            info!("🔁 {} {}: {} -> {}", self.component, self.label, from, to);
            if let Some(hook) = &self.hook {
                hook(from, to);
            }
        }
        changed
    }

    /// Permanently stops the machine. Returns `true` on the first call only.
    pub fn shutdown(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.transition(ConnectionState::Stopped);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Waits until the state equals `target` or `timeout` elapses.
    /// Returns whether the target was reached.
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("component", &self.component)
            .field("label", &self.label)
            .field("state", &self.state())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn test_start_once_per_instance() {
        let machine = StateMachine::new("relay", "test");
        assert_eq!(machine.begin().unwrap(), StartOutcome::Started);
        assert_eq!(machine.begin().unwrap(), StartOutcome::AlreadyStarted);
        assert!(machine.shutdown());
        assert!(!machine.shutdown());
        assert!(matches!(machine.begin(), Err(MessagingError::Stopped("relay"))));
    }

    #[test]
    fn test_no_transitions_after_shutdown() {
        let machine = StateMachine::new("bus", "test");
        machine.begin().unwrap();
        assert!(machine.transition(ConnectionState::Running));
        machine.shutdown();
        assert!(!machine.transition(ConnectionState::Connecting));
        assert_eq!(machine.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_hook_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let machine = StateMachine::new("bus", "test")
            .with_hook(Box::new(move |from, to| sink.lock().push((from, to))));

        machine.transition(ConnectionState::Connecting);
        machine.transition(ConnectionState::Connecting);
        machine.transition(ConnectionState::Degraded);

        assert_eq!(
            *seen.lock(),
            vec![
                (ConnectionState::Stopped, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Degraded),
            ]
        );
    }

    #[tokio::test]
    async fn test_wait_for_reaches_target() {
        let machine = Arc::new(StateMachine::new("relay", "test"));
        let driver = machine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            driver.transition(ConnectionState::Running);
        });
        assert!(machine.wait_for(ConnectionState::Running, Duration::from_secs(2)).await);
        assert!(!machine.wait_for(ConnectionState::Degraded, Duration::from_millis(20)).await);
    }
}
