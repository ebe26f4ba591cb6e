//! Outbound notifications for consequential agent events.
//!
//! Delivery is a side-effecting collaborator, not part of the trading
//! core's correctness contract: a failed send is logged and forgotten.

use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, message: &str);
}

/// Default delivery channel: the structured log.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, message: &str) {
        info!(alert = true, "{message}");
    }
}

#[cfg(test)]
pub mod testkit {
    use super::*;
    use std::sync::Mutex;

    /// Captures every alert for assertions.
    #[derive(Default)]
    pub struct RecordingAlerter {
        pub messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Alerter for RecordingAlerter {
        async fn send(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }
}
