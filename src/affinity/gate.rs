//! Reclosable gate used to park the key generator.

use std::time::Duration;

use tokio::sync::watch;

/// A gate that can be opened and closed any number of times.
///
/// Waiters park until the gate is open or their timeout elapses.
#[derive(Debug)]
pub struct ReclosableGate {
    state: watch::Sender<bool>,
}

impl ReclosableGate {
    pub fn new(open: bool) -> Self {
        let (state, _) = watch::channel(open);
        Self { state }
    }

    pub fn open(&self) {
        self.state.send_replace(true);
    }

    pub fn close(&self) {
        self.state.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until the gate is open. Returns false if `timeout` elapsed first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let opened = match tokio::time::timeout(timeout, rx.wait_for(|open| *open)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) | Err(_) => false,
        };
        opened
    }
}

impl Default for ReclosableGate {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_open_gate_passes_immediately() {
        let gate = ReclosableGate::new(true);
        assert!(gate.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_closed_gate_times_out() {
        let gate = ReclosableGate::new(false);
        assert!(!gate.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_reopen_wakes_waiter() {
        let gate = Arc::new(ReclosableGate::new(true));
        gate.close();
        assert!(!gate.is_open());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.open();

        assert!(waiter.await.unwrap());
    }
}
