//! Outbound notification seam (SMS to applicants).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifier not configured")]
    NotConfigured,
    #[error("provider rejected message: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierReceipt {
    /// Provider-side message id, when the provider returns one.
    pub message_id: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, phone: &str, message: &str) -> Result<NotifierReceipt, NotifyError>;
}

/// Notifier used when no provider is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send(&self, _phone: &str, _message: &str) -> Result<NotifierReceipt, NotifyError> {
        Err(NotifyError::NotConfigured)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod recording {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every attempt; optionally fails all of them.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        fail: bool,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                sent: Arc::default(),
                fail: true,
            }
        }

        pub fn attempts(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, phone: &str, message: &str) -> Result<NotifierReceipt, NotifyError> {
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((phone.to_string(), message.to_string()));
            if self.fail {
                return Err(NotifyError::Transport("connection refused".to_string()));
            }
            Ok(NotifierReceipt {
                message_id: Some(format!("msg-{}", self.attempts().len())),
            })
        }
    }
}
