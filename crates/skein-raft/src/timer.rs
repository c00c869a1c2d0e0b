//! Election timer.
//!
//! Fires when the randomized election timeout elapses without a reset.
//! Followers reset it whenever they hear from a leader or grant a vote.

use crate::config::RaftConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};

pub struct ElectionTimer {
    config: RaftConfig,

    reset_notify: Notify,

    shutdown_notify: Notify,

    timeout_tx: mpsc::Sender<()>,

    /// Handed to the election loop once.
    timeout_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig) -> Self {
        let (timeout_tx, timeout_rx) = mpsc::channel(1);

        Self {
            config,
            reset_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            timeout_tx,
            timeout_rx: Mutex::new(Some(timeout_rx)),
        }
    }

    /// Take the timeout receiver. Returns `None` after the first call.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.timeout_rx.lock().take()
    }

    /// Restart the countdown with a fresh random timeout.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Run the timer loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        loop {
            let deadline = Instant::now() + self.config.random_election_timeout();

            tokio::select! {
                _ = sleep_until(deadline) => {
                    // A pending timeout is already queued if the channel is full
                    if let Err(mpsc::error::TrySendError::Closed(_)) = self.timeout_tx.try_send(()) {
                        break;
                    }
                }
                _ = self.reset_notify.notified() => continue,
                _ = self.shutdown_notify.notified() => {
                    tracing::debug!("Election timer shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(10),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(80),
            ..RaftConfig::default()
        }
    }

    #[tokio::test]
    async fn test_timer_fires() {
        let timer = Arc::new(ElectionTimer::new(fast_config()));
        let mut rx = timer.take_receiver().unwrap();
        tokio::spawn(timer.clone().run());

        let fired = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(fired.is_ok());
        timer.shutdown();
    }

    #[tokio::test]
    async fn test_reset_postpones_timeout() {
        let timer = Arc::new(ElectionTimer::new(fast_config()));
        let mut rx = timer.take_receiver().unwrap();
        tokio::spawn(timer.clone().run());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            timer.reset();
        }
        assert!(rx.try_recv().is_err());
        timer.shutdown();
    }

    #[tokio::test]
    async fn test_receiver_taken_once() {
        let timer = ElectionTimer::new(fast_config());
        assert!(timer.take_receiver().is_some());
        assert!(timer.take_receiver().is_none());
    }
}
