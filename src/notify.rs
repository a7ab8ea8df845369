//! Outbound member notifications.
//!
//! Delivery is best-effort: the engine hands messages to a
//! [`NotifyDispatcher`] after a unit of work commits and never waits for
//! them. Failures are logged and counted, never propagated.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::model::{Facility, Penalty, Reservation, User};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// A delivery transport. Must be safe to call concurrently.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &Notification) -> Result<(), NotifyError>;
}

/// Writes each message to the log. The default when no relay is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &Notification) -> Result<(), NotifyError> {
        info!(to = %message.to, subject = %message.subject, "notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct OutboxRecord<'a> {
    from: &'a str,
    #[serde(flatten)]
    message: &'a Notification,
}

/// Appends each message as one JSON line to a spool file that an external
/// mail relay drains.
pub struct OutboxNotifier {
    path: PathBuf,
    from: String,
    lock: Mutex<()>,
}

impl OutboxNotifier {
    pub fn new(path: PathBuf, from: String) -> Self {
        Self {
            path,
            from,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, message: &Notification) -> Result<(), NotifyError> {
        let mut line = serde_json::to_vec(&OutboxRecord { from: &self.from, message })?;
        line.push(b'\n');
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

enum NotifyCommand {
    Send(Notification),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front end to a [`Notifier`]. Cheap to clone.
#[derive(Clone)]
pub struct NotifyDispatcher {
    tx: mpsc::Sender<NotifyCommand>,
}

impl NotifyDispatcher {
    /// Start the delivery task. `queue` bounds how many undelivered
    /// messages may wait; beyond that new messages are dropped.
    pub fn spawn(notifier: Arc<dyn Notifier>, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        tokio::spawn(delivery_loop(notifier, rx));
        Self { tx }
    }

    /// Queue a message. Never blocks and never fails the caller.
    pub fn dispatch(&self, message: Notification) {
        if let Err(e) = self.tx.try_send(NotifyCommand::Send(message)) {
            let (reason, to) = match &e {
                mpsc::error::TrySendError::Full(NotifyCommand::Send(m)) => ("queue full", m.to.clone()),
                mpsc::error::TrySendError::Closed(NotifyCommand::Send(m)) => ("dispatcher closed", m.to.clone()),
                _ => ("unexpected", String::new()),
            };
            warn!(%to, "notification dropped: {reason}");
            metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
        }
    }

    /// Wait until every message queued before this call has been attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(NotifyCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn delivery_loop(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<NotifyCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            NotifyCommand::Send(message) => match notifier.send(&message).await {
                Ok(()) => {
                    debug!(to = %message.to, "notification delivered");
                    metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL).increment(1);
                }
                Err(e) => {
                    warn!(to = %message.to, subject = %message.subject, "notification failed: {e}");
                    metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
                }
            },
            NotifyCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

// ── Message templates ────────────────────────────────────────────

pub fn booking_confirmed(user: &User, facility: &Facility, reservation: &Reservation) -> Notification {
    Notification {
        to: user.email.clone(),
        subject: format!("Booking Confirmed: {}", facility.name),
        body: format!(
            "Dear {},\n\nYour reservation for {} on {} from {} to {} is confirmed.\n\
             Participants: {}\n\nPlease cancel at least 24 hours in advance to avoid a penalty.",
            user.name,
            facility.name,
            reservation.date,
            reservation.range.start.format("%H:%M"),
            reservation.range.end.format("%H:%M"),
            reservation.participants,
        ),
    }
}

pub fn maintenance_cancellation(
    user: &User,
    facility: &Facility,
    reservation: &Reservation,
    reason: &str,
) -> Notification {
    Notification {
        to: user.email.clone(),
        subject: format!("Booking Cancelled: {}", facility.name),
        body: format!(
            "Dear {},\n\nWe regret to inform you that your reservation for {} on {} at {} \
             has been CANCELLED.\n\nReason: {}",
            user.name,
            facility.name,
            reservation.date,
            reservation.range.start.format("%H:%M"),
            reason,
        ),
    }
}

pub fn penalty_issued(user: &User, penalty: &Penalty) -> Notification {
    Notification {
        to: user.email.clone(),
        subject: "Penalty Recorded".to_string(),
        body: format!(
            "Dear {},\n\nA penalty was recorded on your account on {}.\n\nCause: {}\n\n\
             Penalties expire automatically after three months.",
            user.name,
            penalty.issued_at.format("%Y-%m-%d %H:%M"),
            penalty.description,
        ),
    }
}
