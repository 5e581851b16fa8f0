// Quiz sessions and their answers.

use super::{Answer, Database, QuizSession};

const SESSION_COLUMNS: &str = "id, user_id, quiz_id, attempt_number, current_question_index, current_question_started_at, current_streak, total_score, max_streak, started_at, finished_at, is_tournament, used_bonus_energy, abandoned, result_json, core_json";

#[derive(Debug, Clone, Copy)]
pub struct NewSession {
    pub user_id: i64,
    pub quiz_id: i64,
    pub is_tournament: bool,
    pub used_bonus_energy: bool,
}

/// A batch of synthetic timeout answers plus the index they advance to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeoutBackfill {
    /// Index the session must still be on for the batch to apply.
    pub from_index: i64,
    pub to_index: i64,
    /// (question_id, question_index, time_limit_ms) of each unanswered question.
    pub timeouts: Vec<(i64, i64, i64)>,
}

/// One answer to insert, with the session state it leaves behind.
#[derive(Debug, Clone)]
pub struct AnswerInsert {
    pub question_id: i64,
    pub question_index: i64,
    pub option_id: Option<i64>,
    pub is_correct: bool,
    pub time_spent_ms: i64,
    pub score_delta: i64,
    pub streak_after: i64,
}

impl Database {
    pub async fn get_session(&self, id: i64) -> Result<Option<QuizSession>, sqlx::Error> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM quiz_sessions WHERE id = ?");
        sqlx::query_as::<_, QuizSession>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_live_session(
        &self,
        user_id: i64,
        quiz_id: i64,
    ) -> Result<Option<QuizSession>, sqlx::Error> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM quiz_sessions WHERE user_id = ? AND quiz_id = ? AND finished_at IS NULL"
        );
        sqlx::query_as::<_, QuizSession>(&sql)
            .bind(user_id)
            .bind(quiz_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Insert a live session with the next attempt number for (user, quiz).
    ///
    /// Fails with a unique violation if another live session already exists.
    pub async fn create_session(
        &self,
        new: NewSession,
        now_ms: i64,
    ) -> Result<QuizSession, sqlx::Error> {
        let sql = format!(
            "INSERT INTO quiz_sessions (user_id, quiz_id, attempt_number, started_at, is_tournament, used_bonus_energy) \
             VALUES (?, ?, (SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM quiz_sessions WHERE user_id = ? AND quiz_id = ?), ?, ?, ?) \
             RETURNING {SESSION_COLUMNS}"
        );
        sqlx::query_as::<_, QuizSession>(&sql)
            .bind(new.user_id)
            .bind(new.quiz_id)
            .bind(new.user_id)
            .bind(new.quiz_id)
            .bind(now_ms)
            .bind(new.is_tournament)
            .bind(new.used_bonus_energy)
            .fetch_one(&self.pool)
            .await
    }

    /// Close a live session without scoring it.
    pub async fn abandon_session(&self, id: i64, now_ms: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE quiz_sessions SET finished_at = ?, abandoned = 1 WHERE id = ? AND finished_at IS NULL",
        )
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_answers(&self, session_id: i64) -> Result<Vec<Answer>, sqlx::Error> {
        sqlx::query_as::<_, Answer>(
            "SELECT id, session_id, question_id, question_index, option_id, is_correct, time_spent_ms, score_delta, created_at \
             FROM answers WHERE session_id = ? ORDER BY question_index",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Advance a session past timed-out questions, inserting a timeout answer
    /// for each one that has none. Returns None if the session moved on
    /// concurrently, otherwise the number of answers actually inserted.
    pub async fn apply_timeouts(
        &self,
        session_id: i64,
        backfill: &TimeoutBackfill,
        now_ms: i64,
    ) -> Result<Option<u64>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let moved = sqlx::query(
            "UPDATE quiz_sessions SET current_question_index = ?, current_streak = 0, current_question_started_at = NULL \
             WHERE id = ? AND current_question_index = ? AND finished_at IS NULL",
        )
        .bind(backfill.to_index)
        .bind(session_id)
        .bind(backfill.from_index)
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let mut inserted = 0;
        for (question_id, question_index, limit_ms) in &backfill.timeouts {
            let result = sqlx::query(
                "INSERT INTO answers (session_id, question_id, question_index, option_id, is_correct, time_spent_ms, score_delta, created_at) \
                 VALUES (?, ?, ?, NULL, 0, ?, 0, ?) ON CONFLICT(session_id, question_id) DO NOTHING",
            )
            .bind(session_id)
            .bind(question_id)
            .bind(question_index)
            .bind(limit_ms)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(Some(inserted))
    }

    /// Start the timer for `question_index` if it is still waiting for the view signal.
    pub async fn start_question_timer(
        &self,
        session_id: i64,
        question_index: i64,
        now_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE quiz_sessions SET current_question_started_at = ? \
             WHERE id = ? AND current_question_index = ? AND current_question_started_at IS NULL AND finished_at IS NULL",
        )
        .bind(now_ms)
        .bind(session_id)
        .bind(question_index)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the answer to the current question and move to the next one.
    /// Returns false if the question was already answered or the session moved on.
    pub async fn record_answer(
        &self,
        session_id: i64,
        answer: &AnswerInsert,
        now_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let moved = sqlx::query(
            "UPDATE quiz_sessions SET current_question_index = current_question_index + 1, current_streak = ?, \
             total_score = total_score + ?, current_question_started_at = NULL \
             WHERE id = ? AND current_question_index = ? AND finished_at IS NULL",
        )
        .bind(answer.streak_after)
        .bind(answer.score_delta)
        .bind(session_id)
        .bind(answer.question_index)
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let inserted = sqlx::query(
            "INSERT INTO answers (session_id, question_id, question_index, option_id, is_correct, time_spent_ms, score_delta, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(session_id, question_id) DO NOTHING",
        )
        .bind(session_id)
        .bind(answer.question_id)
        .bind(answer.question_index)
        .bind(answer.option_id)
        .bind(answer.is_correct)
        .bind(answer.time_spent_ms)
        .bind(answer.score_delta)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Free-energy sessions started after `since_ms`: (count, oldest, newest start).
    pub async fn energy_sessions_since(
        &self,
        user_id: i64,
        since_ms: i64,
    ) -> Result<(i64, Option<i64>, Option<i64>), sqlx::Error> {
        sqlx::query_as::<_, (i64, Option<i64>, Option<i64>)>(
            "SELECT COUNT(*), MIN(started_at), MAX(started_at) FROM quiz_sessions \
             WHERE user_id = ? AND is_tournament = 0 AND started_at > ?",
        )
        .bind(user_id)
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await
    }

    /// Finish time of the most recent completed (not abandoned) session for (user, quiz).
    pub async fn last_finished_at(
        &self,
        user_id: i64,
        quiz_id: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT MAX(finished_at) FROM quiz_sessions \
             WHERE user_id = ? AND quiz_id = ? AND abandoned = 0 AND finished_at IS NOT NULL",
        )
        .bind(user_id)
        .bind(quiz_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Cache the finish response so repeated finish calls return it verbatim.
    pub async fn store_session_result(
        &self,
        session_id: i64,
        result_json: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE quiz_sessions SET result_json = ? WHERE id = ?")
            .bind(result_json)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cache a rebuilt response unless a finish already stored one.
    /// Returns false when the existing body was kept.
    pub async fn store_session_result_if_missing(
        &self,
        session_id: i64,
        result_json: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE quiz_sessions SET result_json = ? WHERE id = ? AND result_json IS NULL")
            .bind(result_json)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of completed sessions across all quizzes.
    pub async fn count_finished_sessions(&self, user_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM quiz_sessions WHERE user_id = ? AND finished_at IS NOT NULL AND abandoned = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
    }
}
