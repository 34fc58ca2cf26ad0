//! Process-wide "stop producing" signal
//!
//! The reconnect episode raises the flag when it gives up; the publisher loop
//! observes it. Backed by a `watch` channel so the write on the connection
//! task happens-before the read on the publisher task, and so the publisher
//! can await the raise instead of polling.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared exit flag. Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct ExitFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl ExitFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the flag. Returns `true` only for the call that flipped it.
    pub fn raise(&self) -> bool {
        self.tx.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    /// Check whether the flag has been raised
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is raised (immediately if it already is)
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl Default for ExitFlag {
    fn default() -> Self {
        Self::new()
    }
}
