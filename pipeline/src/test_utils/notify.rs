use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// How long a test waits for a shard item to reach an awaited state.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Notification awaited by a test, failing the test instead of hanging it when the awaited
/// state never comes.
#[derive(Debug, Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    awaited: String,
    timeout: Duration,
}

impl TimedNotify {
    /// `awaited` names the state in the panic message, e.g. `"progress of j1/0"`.
    pub fn new(notify: Arc<Notify>, awaited: impl Into<String>) -> Self {
        Self {
            notify,
            awaited: awaited.into(),
            timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// # Panics
    ///
    /// Panics when no notification arrives within the timeout.
    pub async fn notified(&self) {
        if tokio::time::timeout(self.timeout, self.notify.notified())
            .await
            .is_err()
        {
            panic!("{} not reached within {:?}", self.awaited, self.timeout);
        }
    }
}
