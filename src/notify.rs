use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::model::{TimeWindow, WindowStatus};

/// A new claim awaiting a manager decision, with one-click action tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewClaimNotice {
    pub window: TimeWindow,
    pub resource_name: String,
    pub managers: Vec<String>,
    pub approve_token: String,
    pub reject_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChangeNotice {
    pub window: TimeWindow,
    pub resource_name: String,
    pub status: WindowStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestVerificationNotice {
    pub name: String,
    pub email: String,
    pub confirm_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    NewClaim(NewClaimNotice),
    StatusChanged(StatusChangeNotice),
    GuestVerification(GuestVerificationNotice),
}

impl Notification {
    pub fn label(&self) -> &'static str {
        match self {
            Notification::NewClaim(_) => "new_claim",
            Notification::StatusChanged(_) => "status_changed",
            Notification::GuestVerification(_) => "guest_verification",
        }
    }
}

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound channel to managers, claimants and guests (mail, chat, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_managers_of_new_claim(&self, notice: &NewClaimNotice)
        -> Result<(), NotifyError>;

    async fn notify_claimant_of_status_change(
        &self,
        notice: &StatusChangeNotice,
    ) -> Result<(), NotifyError>;

    async fn notify_guest_verification(
        &self,
        notice: &GuestVerificationNotice,
    ) -> Result<(), NotifyError>;
}

/// Fire-and-forget delivery. Failures are logged and counted, never returned.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        let label = notification.label();
        let result = match &notification {
            Notification::NewClaim(n) => notifier.notify_managers_of_new_claim(n).await,
            Notification::StatusChanged(n) => notifier.notify_claimant_of_status_change(n).await,
            Notification::GuestVerification(n) => notifier.notify_guest_verification(n).await,
        };
        match result {
            Ok(()) => {
                debug!(kind = label, "notification delivered");
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "kind" => label, "status" => "ok")
                    .increment(1);
            }
            Err(e) => {
                warn!(kind = label, "{e}");
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "kind" => label, "status" => "error")
                    .increment(1);
            }
        }
    });
}

/// Appends every notification as one JSON line to a file drained by an external mailer.
pub struct OutboxNotifier {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl OutboxNotifier {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    async fn append(&self, notification: Notification) -> Result<(), NotifyError> {
        let mut line =
            serde_json::to_vec(&notification).map_err(|e| NotifyError(e.to_string()))?;
        line.push(b'\n');
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| NotifyError(e.to_string()))?;
        file.write_all(&line)
            .await
            .map_err(|e| NotifyError(e.to_string()))?;
        file.flush().await.map_err(|e| NotifyError(e.to_string()))
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify_managers_of_new_claim(
        &self,
        notice: &NewClaimNotice,
    ) -> Result<(), NotifyError> {
        self.append(Notification::NewClaim(notice.clone())).await
    }

    async fn notify_claimant_of_status_change(
        &self,
        notice: &StatusChangeNotice,
    ) -> Result<(), NotifyError> {
        self.append(Notification::StatusChanged(notice.clone())).await
    }

    async fn notify_guest_verification(
        &self,
        notice: &GuestVerificationNotice,
    ) -> Result<(), NotifyError> {
        self.append(Notification::GuestVerification(notice.clone())).await
    }
}

/// Forwards notifications to an in-process receiver.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx
            .send(notification)
            .map_err(|_| NotifyError("receiver dropped".into()))
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify_managers_of_new_claim(
        &self,
        notice: &NewClaimNotice,
    ) -> Result<(), NotifyError> {
        self.forward(Notification::NewClaim(notice.clone()))
    }

    async fn notify_claimant_of_status_change(
        &self,
        notice: &StatusChangeNotice,
    ) -> Result<(), NotifyError> {
        self.forward(Notification::StatusChanged(notice.clone()))
    }

    async fn notify_guest_verification(
        &self,
        notice: &GuestVerificationNotice,
    ) -> Result<(), NotifyError> {
        self.forward(Notification::GuestVerification(notice.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn verification() -> GuestVerificationNotice {
        GuestVerificationNotice {
            name: "Ana".into(),
            email: "ana@example.com".into(),
            confirm_url: "https://book.example.com/guest/confirm?token=abc".into(),
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_channel() {
        let (notifier, mut rx) = ChannelNotifier::new();
        dispatch(Arc::new(notifier), Notification::GuestVerification(verification()));
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Notification::GuestVerification(verification()));
    }

    #[tokio::test]
    async fn dispatch_swallows_failures() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        // Must not panic or propagate.
        dispatch(Arc::new(notifier), Notification::GuestVerification(verification()));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn outbox_writes_json_lines() {
        let dir = std::env::temp_dir().join("slotbook_test_notify");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.jsonl", ulid::Ulid::new()));

        let outbox = OutboxNotifier::new(path.clone());
        outbox.notify_guest_verification(&verification()).await.unwrap();
        outbox.notify_guest_verification(&verification()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["type"], "guest_verification");
        assert_eq!(value["email"], "ana@example.com");

        let _ = std::fs::remove_file(&path);
    }
}
