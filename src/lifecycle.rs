// Tournament lifecycle: a periodic tick that opens due tournaments and closes
// expired ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::db::{to_ms, Database};
use crate::metrics;
use crate::tournament::TournamentStatus;

pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecycleReport {
    pub activated: Vec<i64>,
    pub finished: Vec<i64>,
}

/// UPCOMING -> ACTIVE once `starts_at` passed; ACTIVE -> FINISHED once
/// `ends_at` passed, with a final rank resweep.
pub async fn run_lifecycle_tick(db: &Database, now_ms: i64) -> Result<LifecycleReport, sqlx::Error> {
    let activated = db.activate_due_tournaments(now_ms).await?;
    let finished = db.finish_due_tournaments(now_ms).await?;

    for id in &activated {
        tracing::info!(tournament_id = id, "Tournament activated");
    }
    for id in &finished {
        tracing::info!(tournament_id = id, "Tournament finished");
    }

    let active = db
        .list_tournaments()
        .await?
        .iter()
        .filter(|t| TournamentStatus::from_str_name(&t.status) == Some(TournamentStatus::Active))
        .count();
    metrics::ACTIVE_TOURNAMENTS.set(active as i64);

    Ok(LifecycleReport { activated, finished })
}

/// Spawn the background lifecycle loop.
pub fn spawn_lifecycle_worker(db: Arc<Database>, period: Duration) {
    tokio::spawn(async move {
        loop {
            match run_lifecycle_tick(&db, to_ms(Utc::now())).await {
                Ok(report) if !report.activated.is_empty() || !report.finished.is_empty() => {
                    tracing::debug!(?report, "Lifecycle tick");
                }
                Ok(_) => {}
                Err(e) => metrics::best_effort_failure("lifecycle", &e),
            }
            tokio::time::sleep(period).await;
        }
    });
}
