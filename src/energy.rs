// Energy/attempt gate for starting a new quiz session.
//
// Free attempts regenerate one by one: each non-tournament session holds an
// attempt for the cooldown after it started. Past the free allowance a start
// spends one bonus energy. Tournament quizzes never touch either pool.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::GameRules;
use crate::db::{from_ms, to_ms, Database};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::tournament::{self, TournamentQuizInfo};

/// Energy block of the new-session payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnergyInfo {
    pub used: i64,
    pub max: i64,
    pub bonus_energy: i64,
    pub used_bonus_energy: bool,
    pub is_tournament_quiz: bool,
}

/// What let a start through.
#[derive(Debug, Clone, PartialEq)]
pub enum GatePass {
    /// Tournament play; nothing was counted or spent.
    Tournament(TournamentQuizInfo),
    /// Energy checks are switched off for this deployment.
    Bypass,
    /// A free attempt; `used` includes the new session.
    Free { used: i64 },
    /// One bonus energy was spent.
    Bonus { used: i64 },
}

impl GatePass {
    pub fn is_tournament(&self) -> bool {
        matches!(self, GatePass::Tournament(_))
    }

    pub fn used_bonus_energy(&self) -> bool {
        matches!(self, GatePass::Bonus { .. })
    }

    /// Whether the new session holds a free attempt until its cooldown ends.
    pub fn consumes_attempt(&self) -> bool {
        matches!(self, GatePass::Free { .. } | GatePass::Bonus { .. })
    }
}

/// Time until the oldest counted session leaves the cooldown window.
pub fn attempt_wait_ms(oldest_started_at: i64, cooldown_ms: i64, now_ms: i64) -> i64 {
    (oldest_started_at + cooldown_ms - now_ms).max(0)
}

/// Remaining wait before the same quiz may be started again, if any.
pub fn interval_wait_ms(last_finished_at: Option<i64>, min_interval_ms: i64, now_ms: i64) -> Option<i64> {
    let wait = last_finished_at? + min_interval_ms - now_ms;
    (wait > 0).then_some(wait)
}

/// Decide whether `user_id` may open a new session on `quiz_id`.
///
/// The spacing between attempts at one quiz is checked first so a rejected
/// start never spends bonus energy.
pub async fn check_gate(
    db: &Database,
    rules: &GameRules,
    user_id: i64,
    quiz_id: i64,
    now_ms: i64,
) -> ApiResult<GatePass> {
    let last_finished = db.last_finished_at(user_id, quiz_id).await?;
    if let Some(wait_ms) = interval_wait_ms(last_finished, rules.min_attempt_interval_ms(), now_ms) {
        metrics::START_REJECTIONS_TOTAL
            .with_label_values(&["rate_limited"])
            .inc();
        return Err(ApiError::RateLimited { wait_ms });
    }

    if let Some(info) = tournament::tournament_quiz_for_start(db, user_id, quiz_id, now_ms).await? {
        return Ok(GatePass::Tournament(info));
    }

    if rules.energy_bypass {
        return Ok(GatePass::Bypass);
    }

    let since = now_ms - rules.attempt_cooldown_ms();
    let (used, oldest, _) = db.energy_sessions_since(user_id, since).await?;
    if used < rules.max_attempts as i64 {
        return Ok(GatePass::Free { used: used + 1 });
    }

    if db.consume_bonus_energy(user_id).await? {
        metrics::BONUS_ENERGY_SPENT_TOTAL.inc();
        tracing::info!(user_id, quiz_id, "Spent bonus energy");
        return Ok(GatePass::Bonus { used: used + 1 });
    }

    let wait_ms = oldest
        .map(|t| attempt_wait_ms(t, rules.attempt_cooldown_ms(), now_ms))
        .unwrap_or(0);
    metrics::START_REJECTIONS_TOTAL
        .with_label_values(&["energy_depleted"])
        .inc();
    Err(ApiError::EnergyDepleted { wait_ms })
}

/// Energy block for a session that just passed the gate.
pub async fn energy_info(
    db: &Database,
    rules: &GameRules,
    user_id: i64,
    pass: &GatePass,
    now_ms: i64,
) -> Result<EnergyInfo, sqlx::Error> {
    let used = match pass {
        GatePass::Free { used } | GatePass::Bonus { used } => *used,
        _ => {
            db.energy_sessions_since(user_id, now_ms - rules.attempt_cooldown_ms())
                .await?
                .0
        }
    };
    let bonus_energy = db.get_user(user_id).await?.map(|u| u.bonus_energy).unwrap_or(0);
    Ok(EnergyInfo {
        used,
        max: rules.max_attempts as i64,
        bonus_energy,
        used_bonus_energy: pass.used_bonus_energy(),
        is_tournament_quiz: pass.is_tournament(),
    })
}

/// `GET /api/energy` payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnergyStatus {
    pub used: i64,
    pub max: i64,
    pub available: i64,
    pub bonus_energy: i64,
    /// When the next free attempt comes back; None while none is spent.
    pub next_restore_at: Option<DateTime<Utc>>,
}

pub async fn energy_status(
    db: &Database,
    rules: &GameRules,
    user_id: i64,
    now: DateTime<Utc>,
) -> ApiResult<EnergyStatus> {
    let user = db.get_user(user_id).await?.ok_or(ApiError::NotFound("User"))?;
    let now_ms = to_ms(now);
    let (used, oldest, _) = db
        .energy_sessions_since(user_id, now_ms - rules.attempt_cooldown_ms())
        .await?;
    let max = rules.max_attempts as i64;
    Ok(EnergyStatus {
        used,
        max,
        available: (max - used).max(0),
        bonus_energy: user.bonus_energy,
        next_restore_at: oldest.map(|t| from_ms(t + rules.attempt_cooldown_ms())),
    })
}
