// Best-effort notification dispatch.
//
// Callers hand notifications to an unbounded channel and move on. A
// background worker drains it into the notifications outbox, from which the
// bot gateway delivers them. Failures are logged and counted, never returned.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::db::{to_ms, Database};
use crate::metrics;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    LevelUp {
        level: i64,
    },
    #[serde(rename_all = "camelCase")]
    EnergyRestored {
        quiz_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    LeaderboardOvertaken {
        quiz_id: i64,
        by_user_id: i64,
        by_username: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::LevelUp { .. } => "level_up",
            Notification::EnergyRestored { .. } => "energy_restored",
            Notification::LeaderboardOvertaken { .. } => "leaderboard_overtaken",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub user_id: i64,
    pub notification: Notification,
}

/// Handle for queueing notifications. Cloning shares the same worker.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Dispatch>>,
}

impl Notifier {
    /// Drops everything.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// A notifier whose dispatches land on the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Spawn the outbox worker and return a notifier feeding it.
    pub fn spawn(db: Arc<Database>) -> Self {
        let (notifier, mut rx) = Self::channel();
        tokio::spawn(async move {
            while let Some(dispatch) = rx.recv().await {
                if let Err(e) = deliver(&db, &dispatch).await {
                    metrics::best_effort_failure("notify", &e);
                }
            }
            tracing::debug!("Notification worker stopped");
        });
        notifier
    }

    pub fn send(&self, user_id: i64, notification: Notification) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(Dispatch { user_id, notification }).is_err() {
            metrics::best_effort_failure("notify", &"notification worker is gone");
        }
    }

    /// Send after `delay`. The timer lives in its own task so the caller
    /// never waits on it.
    pub fn schedule(&self, user_id: i64, notification: Notification, delay: Duration) {
        if self.tx.is_none() {
            return;
        }
        let notifier = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            notifier.send(user_id, notification);
        });
    }
}

/// Write one notification to the outbox.
pub async fn deliver(db: &Database, dispatch: &Dispatch) -> Result<i64, sqlx::Error> {
    let payload = serde_json::to_string(&dispatch.notification)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let kind = dispatch.notification.kind();
    let id = db
        .insert_notification(dispatch.user_id, kind, &payload, to_ms(chrono::Utc::now()))
        .await?;
    metrics::NOTIFICATIONS_SENT_TOTAL.with_label_values(&[kind]).inc();
    tracing::debug!(user_id = dispatch.user_id, kind, "Notification queued");
    Ok(id)
}
