//! Cooperative cancellation.
//!
//! A [`KillSwitch`] is a cloneable one-way flag.  Every agent owns one and
//! shares it with its socket and worker tasks; flipping it wakes every
//! pending [`KillSwitch::killed`] future, which is how blocking receives are
//! interrupted.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct KillSwitch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Flip the switch.  Idempotent.
    pub fn kill(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_killed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`kill`](Self::kill) has been called (immediately if it
    /// already was).
    pub async fn killed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed
        // channel here.
        let _ = rx.wait_for(|killed| *killed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn killed_resolves_after_kill() {
        let switch = KillSwitch::new();
        let waiter = {
            let switch = switch.clone();
            tokio::spawn(async move { switch.killed().await })
        };
        assert!(!switch.is_killed());
        switch.kill();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
        assert!(switch.is_killed());
    }

    #[tokio::test]
    async fn killed_is_immediate_when_already_flipped() {
        let switch = KillSwitch::new();
        switch.kill();
        switch.kill();
        tokio::time::timeout(Duration::from_millis(100), switch.killed())
            .await
            .expect("should resolve immediately");
    }
}
