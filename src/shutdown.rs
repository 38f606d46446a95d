// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shutdown Signalling
//!
//! A handle/signal pair used to ask running dispatchers to drain and stop.

use tokio::sync::watch;

/// Held by whoever decides when the worker stops.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Observed by dispatch loops. Clones observe the same signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn new_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // stored even with no live signal, later subscribers see it
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// Resolves once shutdown was triggered, immediately if it already was.
    ///
    /// A dropped handle counts as a trigger.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|&v| v).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_after_trigger() {
        let (handle, mut signal) = new_pair();
        let mut other = handle.signal();

        assert!(!signal.is_triggered());
        handle.trigger();

        signal.wait().await;
        other.wait().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn dropped_handle_releases_waiters() {
        let (handle, mut signal) = new_pair();
        drop(handle);
        signal.wait().await;
    }
}
