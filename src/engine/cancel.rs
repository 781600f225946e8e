//! Cancellation primitives for run execution.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Cooperative cancellation token shared by a run and its background tasks.
/// Carries a watch channel so in-flight futures can race against it.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    signal: Arc<watch::Sender<bool>>,
    reason: Arc<Mutex<Option<String>>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        // Reason first, so a waiter woken by the signal always sees it.
        let mut guard = self.reason.lock().unwrap();
        *guard = Some(reason.into());
        drop(guard);
        self.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once the token is cancelled; immediately when it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    pub fn abort_reason(&self) -> String {
        self.reason().unwrap_or_else(|| "cancelled".to_string())
    }
}
