//! Cooperative stop signal.
//!
//! Tasks never get aborted. They check [`StopRx::is_stopped`] at loop boundaries and race
//! their waits against [`StopRx::stopped`], so they always exit between two records.

use tokio::sync::watch;

/// Sending side of a stop signal. Stopping is permanent.
#[derive(Debug, Clone)]
pub struct StopTx(watch::Sender<bool>);

/// Receiving side of a stop signal.
#[derive(Debug, Clone)]
pub struct StopRx(watch::Receiver<bool>);

/// Creates a stop signal in the running state.
pub fn create_stop_signal() -> (StopTx, StopRx) {
    let (tx, rx) = watch::channel(false);
    (StopTx(tx), StopRx(rx))
}

impl StopTx {
    /// Requests every receiver to stop. Returns `false` if stop was already requested.
    pub fn stop(&self) -> bool {
        self.0.send_if_modified(|stopped| !std::mem::replace(stopped, true))
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> StopRx {
        StopRx(self.0.subscribe())
    }
}

impl StopRx {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once stop has been requested. Also resolves when every sender is gone.
    pub async fn stopped(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}
