// Session finalization plus the all-time and weekly boards it feeds.

use super::{Database, LeaderboardEntry, PERIOD_ALL_TIME};
use crate::scoring::ActivityBonus;

/// Everything the required part of a finish writes.
#[derive(Debug, Clone)]
pub struct FinalizeInput {
    pub session_id: i64,
    pub user_id: i64,
    pub quiz_id: i64,
    pub game_score: i64,
    pub max_streak: i64,
    pub xp_earned: i64,
    /// Monday 00:00 UTC of the current week, or None when weekly play is off.
    pub week_start: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct BoardScore {
    pub best_score: i64,
    pub attempts: i64,
}

/// State read back inside the finalize transaction. A copy is stored on the
/// session row in the same transaction.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CoreScoring {
    /// Best score before this game; None if the user had no entry yet.
    pub previous: Option<BoardScore>,
    pub board: BoardScore,
    pub weekly: Option<BoardScore>,
    pub xp_before: i64,
    pub xp_after: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OvertakenUser {
    pub user_id: i64,
    pub best_score: i64,
    pub attempts: i64,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BoardRow {
    pub user_id: i64,
    pub username: String,
    pub best_score: i64,
    pub attempts: i64,
}

impl Database {
    /// Close the session and apply its score, all in one transaction.
    ///
    /// Returns None when the session was already finished; nothing is
    /// written in that case. Otherwise the returned state is also saved as
    /// the session's `core_json`.
    pub async fn finalize_and_score(
        &self,
        input: &FinalizeInput,
        now_ms: i64,
    ) -> Result<Option<CoreScoring>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let closed = sqlx::query(
            "UPDATE quiz_sessions SET finished_at = ?, max_streak = ?, current_question_started_at = NULL \
             WHERE id = ? AND finished_at IS NULL",
        )
        .bind(now_ms)
        .bind(input.max_streak)
        .bind(input.session_id)
        .execute(&mut *tx)
        .await?;
        if closed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let previous = sqlx::query_as::<_, BoardScore>(
            "SELECT best_score, attempts FROM leaderboard_entries WHERE user_id = ? AND quiz_id = ? AND period_type = ?",
        )
        .bind(input.user_id)
        .bind(input.quiz_id)
        .bind(PERIOD_ALL_TIME)
        .fetch_optional(&mut *tx)
        .await?;

        let board = sqlx::query_as::<_, BoardScore>(
            "INSERT INTO leaderboard_entries (user_id, quiz_id, period_type, best_score, attempts, updated_at) \
             VALUES (?, ?, ?, ?, 1, ?) \
             ON CONFLICT(user_id, quiz_id, period_type) DO UPDATE SET \
             best_score = MAX(best_score, excluded.best_score), attempts = attempts + 1, updated_at = excluded.updated_at \
             RETURNING best_score, attempts",
        )
        .bind(input.user_id)
        .bind(input.quiz_id)
        .bind(PERIOD_ALL_TIME)
        .bind(input.game_score)
        .bind(now_ms)
        .fetch_one(&mut *tx)
        .await?;

        let weekly = match input.week_start {
            Some(week_start) => Some(
                sqlx::query_as::<_, BoardScore>(
                    "INSERT INTO weekly_scores (user_id, week_start, best_score, quizzes, updated_at) \
                     VALUES (?, ?, ?, 1, ?) \
                     ON CONFLICT(user_id, week_start) DO UPDATE SET \
                     best_score = MAX(best_score, excluded.best_score), quizzes = quizzes + 1, updated_at = excluded.updated_at \
                     RETURNING best_score, quizzes AS attempts",
                )
                .bind(input.user_id)
                .bind(week_start)
                .bind(input.game_score)
                .bind(now_ms)
                .fetch_one(&mut *tx)
                .await?,
            ),
            None => None,
        };

        let xp_after: i64 = sqlx::query_scalar("UPDATE users SET xp = xp + ? WHERE id = ? RETURNING xp")
            .bind(input.xp_earned)
            .bind(input.user_id)
            .fetch_one(&mut *tx)
            .await?;

        let core = CoreScoring {
            previous,
            board,
            weekly,
            xp_before: xp_after - input.xp_earned,
            xp_after,
        };
        let snapshot = serde_json::to_string(&core).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query("UPDATE quiz_sessions SET core_json = ? WHERE id = ?")
            .bind(snapshot)
            .bind(input.session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(core))
    }

    pub async fn get_leaderboard_entry(
        &self,
        user_id: i64,
        quiz_id: i64,
    ) -> Result<Option<LeaderboardEntry>, sqlx::Error> {
        sqlx::query_as::<_, LeaderboardEntry>(
            "SELECT user_id, quiz_id, period_type, best_score, attempts, updated_at FROM leaderboard_entries \
             WHERE user_id = ? AND quiz_id = ? AND period_type = ?",
        )
        .bind(user_id)
        .bind(quiz_id)
        .bind(PERIOD_ALL_TIME)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_weekly_score(
        &self,
        user_id: i64,
        week_start: i64,
    ) -> Result<Option<BoardScore>, sqlx::Error> {
        sqlx::query_as::<_, BoardScore>(
            "SELECT best_score, quizzes AS attempts FROM weekly_scores WHERE user_id = ? AND week_start = ?",
        )
        .bind(user_id)
        .bind(week_start)
        .fetch_optional(&self.pool)
        .await
    }

    /// Top all-time entries for a quiz, ordered by best+activity total.
    pub async fn top_leaderboard(
        &self,
        quiz_id: i64,
        bonus: ActivityBonus,
        limit: i64,
    ) -> Result<Vec<BoardRow>, sqlx::Error> {
        sqlx::query_as::<_, BoardRow>(
            "SELECT e.user_id, u.username, e.best_score, e.attempts FROM leaderboard_entries e \
             JOIN users u ON u.id = e.user_id \
             WHERE e.quiz_id = ? AND e.period_type = ? \
             ORDER BY e.best_score + MIN(e.attempts * ?, ?) DESC, e.updated_at ASC LIMIT ?",
        )
        .bind(quiz_id)
        .bind(PERIOD_ALL_TIME)
        .bind(bonus.per_game)
        .bind(bonus.max)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn top_weekly(
        &self,
        week_start: i64,
        bonus: ActivityBonus,
        limit: i64,
    ) -> Result<Vec<BoardRow>, sqlx::Error> {
        sqlx::query_as::<_, BoardRow>(
            "SELECT w.user_id, u.username, w.best_score, w.quizzes AS attempts FROM weekly_scores w \
             JOIN users u ON u.id = w.user_id \
             WHERE w.week_start = ? \
             ORDER BY w.best_score + MIN(w.quizzes * ?, ?) DESC, w.updated_at ASC LIMIT ?",
        )
        .bind(week_start)
        .bind(bonus.per_game)
        .bind(bonus.max)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Other players on a quiz board whose total lies strictly between
    /// `old_total` and `new_total`.
    pub async fn overtaken_users(
        &self,
        quiz_id: i64,
        user_id: i64,
        bonus: ActivityBonus,
        old_total: i64,
        new_total: i64,
    ) -> Result<Vec<OvertakenUser>, sqlx::Error> {
        sqlx::query_as::<_, OvertakenUser>(
            "SELECT user_id, best_score, attempts FROM leaderboard_entries \
             WHERE quiz_id = ? AND period_type = ? AND user_id != ? \
             AND best_score + MIN(attempts * ?, ?) > ? AND best_score + MIN(attempts * ?, ?) < ?",
        )
        .bind(quiz_id)
        .bind(PERIOD_ALL_TIME)
        .bind(user_id)
        .bind(bonus.per_game)
        .bind(bonus.max)
        .bind(old_total)
        .bind(bonus.per_game)
        .bind(bonus.max)
        .bind(new_total)
        .fetch_all(&self.pool)
        .await
    }
}
