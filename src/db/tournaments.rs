// Tournaments, stages, participants and stage results.

use super::{Database, Tournament, TournamentParticipant, TournamentStage, TournamentStageResult};

const TOURNAMENT_COLUMNS: &str = "id, title, status, starts_at, ends_at, created_at";
const STAGE_COLUMNS: &str =
    "id, tournament_id, quiz_id, stage_order, title, score_multiplier, min_score, top_n, starts_at";

/// A stage joined with the lifecycle fields of its tournament.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StageBinding {
    #[sqlx(flatten)]
    pub stage: TournamentStage,
    pub tournament_status: String,
    pub tournament_ends_at: i64,
}

/// Inputs of the stage-result transaction. `min_score_ok` is decided before
/// the transaction; the top-N check needs the rank computed inside it.
#[derive(Debug, Clone)]
pub struct StageCommitInput {
    pub tournament_id: i64,
    pub stage_id: i64,
    pub stage_order: i64,
    pub user_id: i64,
    pub score: i64,
    pub min_score_ok: bool,
    pub top_n: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCommit {
    pub total_score: i64,
    pub rank: i64,
    pub passed: bool,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StandingRow {
    pub user_id: i64,
    pub username: String,
    pub status: String,
    pub total_score: i64,
    pub rank: Option<i64>,
    pub current_stage: i64,
}

impl Database {
    // ── Tournaments ───────────────────────────────────────────────────

    pub async fn create_tournament(
        &self,
        title: &str,
        starts_at: i64,
        ends_at: i64,
        now_ms: i64,
    ) -> Result<Tournament, sqlx::Error> {
        let sql = format!(
            "INSERT INTO tournaments (title, starts_at, ends_at, created_at) VALUES (?, ?, ?, ?) RETURNING {TOURNAMENT_COLUMNS}"
        );
        sqlx::query_as::<_, Tournament>(&sql)
            .bind(title)
            .bind(starts_at)
            .bind(ends_at)
            .bind(now_ms)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_tournament(&self, id: i64) -> Result<Option<Tournament>, sqlx::Error> {
        let sql = format!("SELECT {TOURNAMENT_COLUMNS} FROM tournaments WHERE id = ?");
        sqlx::query_as::<_, Tournament>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_tournaments(&self) -> Result<Vec<Tournament>, sqlx::Error> {
        let sql = format!("SELECT {TOURNAMENT_COLUMNS} FROM tournaments ORDER BY starts_at DESC, id DESC");
        sqlx::query_as::<_, Tournament>(&sql).fetch_all(&self.pool).await
    }

    pub async fn update_tournament_status(&self, id: i64, status: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE tournaments SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move every UPCOMING tournament whose start has passed to ACTIVE.
    pub async fn activate_due_tournaments(&self, now_ms: i64) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "UPDATE tournaments SET status = 'ACTIVE' WHERE status = 'UPCOMING' AND starts_at <= ? RETURNING id",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
    }

    /// Close an ACTIVE tournament whose end has passed: final ranks for
    /// everyone, participants FINISHED. Returns the ids that were closed.
    pub async fn finish_due_tournaments(&self, now_ms: i64) -> Result<Vec<i64>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            "UPDATE tournaments SET status = 'FINISHED' WHERE status = 'ACTIVE' AND ends_at < ? RETURNING id",
        )
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await?;

        for id in &ids {
            sqlx::query(RESWEEP_SQL).bind(id).execute(&mut *tx).await?;
            sqlx::query("UPDATE tournament_participants SET status = 'FINISHED' WHERE tournament_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(ids)
    }

    // ── Stages ────────────────────────────────────────────────────────

    /// Append a stage; orders start at 1.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_stage(
        &self,
        tournament_id: i64,
        quiz_id: i64,
        title: &str,
        score_multiplier: f64,
        min_score: Option<i64>,
        top_n: Option<i64>,
        starts_at: Option<i64>,
    ) -> Result<TournamentStage, sqlx::Error> {
        let sql = format!(
            "INSERT INTO tournament_stages (tournament_id, quiz_id, stage_order, title, score_multiplier, min_score, top_n, starts_at) \
             VALUES (?, ?, (SELECT COALESCE(MAX(stage_order), 0) + 1 FROM tournament_stages WHERE tournament_id = ?), ?, ?, ?, ?, ?) \
             RETURNING {STAGE_COLUMNS}"
        );
        sqlx::query_as::<_, TournamentStage>(&sql)
            .bind(tournament_id)
            .bind(quiz_id)
            .bind(tournament_id)
            .bind(title)
            .bind(score_multiplier)
            .bind(min_score)
            .bind(top_n)
            .bind(starts_at)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_stages(&self, tournament_id: i64) -> Result<Vec<TournamentStage>, sqlx::Error> {
        let sql = format!(
            "SELECT {STAGE_COLUMNS} FROM tournament_stages WHERE tournament_id = ? ORDER BY stage_order"
        );
        sqlx::query_as::<_, TournamentStage>(&sql)
            .bind(tournament_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Every stage played on `quiz_id`, with its tournament's status and end.
    pub async fn stages_for_quiz(&self, quiz_id: i64) -> Result<Vec<StageBinding>, sqlx::Error> {
        sqlx::query_as::<_, StageBinding>(
            "SELECT s.id, s.tournament_id, s.quiz_id, s.stage_order, s.title, s.score_multiplier, s.min_score, s.top_n, s.starts_at, \
             t.status AS tournament_status, t.ends_at AS tournament_ends_at \
             FROM tournament_stages s JOIN tournaments t ON t.id = s.tournament_id \
             WHERE s.quiz_id = ? ORDER BY t.starts_at, s.stage_order",
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await
    }

    /// The stage a finished game on `quiz_id` may score into: tournament
    /// ACTIVE, user REGISTERED or ACTIVE in it, stage already open.
    ///
    /// A quiz may back several stages. Stages the user has not completed
    /// come first, so a completed one is only returned once every binding
    /// is done.
    pub async fn find_scoring_stage(
        &self,
        quiz_id: i64,
        user_id: i64,
        now_ms: i64,
    ) -> Result<Option<TournamentStage>, sqlx::Error> {
        sqlx::query_as::<_, TournamentStage>(
            "SELECT s.id, s.tournament_id, s.quiz_id, s.stage_order, s.title, s.score_multiplier, s.min_score, s.top_n, s.starts_at \
             FROM tournament_stages s \
             JOIN tournaments t ON t.id = s.tournament_id \
             JOIN tournament_participants p ON p.tournament_id = t.id AND p.user_id = ? \
             LEFT JOIN tournament_stage_results r ON r.stage_id = s.id AND r.user_id = ? \
             WHERE s.quiz_id = ? AND t.status = 'ACTIVE' AND p.status IN ('REGISTERED', 'ACTIVE') \
             AND (s.starts_at IS NULL OR s.starts_at <= ?) \
             ORDER BY (r.completed_at IS NOT NULL), t.starts_at, s.stage_order LIMIT 1",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(quiz_id)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
    }

    /// Earlier stages (order below `stage_order`) the user has not cleared.
    /// With `require_pass` a completed but failed stage also counts as missing.
    pub async fn count_uncleared_earlier_stages(
        &self,
        tournament_id: i64,
        stage_order: i64,
        user_id: i64,
        require_pass: bool,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM tournament_stages s \
             LEFT JOIN tournament_stage_results r ON r.stage_id = s.id AND r.user_id = ? \
             WHERE s.tournament_id = ? AND s.stage_order < ? \
             AND (r.completed_at IS NULL OR (? AND r.passed = 0))",
        )
        .bind(user_id)
        .bind(tournament_id)
        .bind(stage_order)
        .bind(require_pass)
        .fetch_one(&self.pool)
        .await
    }

    // ── Participants and results ──────────────────────────────────────

    /// Returns false if the user was already registered.
    pub async fn register_participant(
        &self,
        tournament_id: i64,
        user_id: i64,
        now_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO tournament_participants (tournament_id, user_id, registered_at) VALUES (?, ?, ?) \
             ON CONFLICT(tournament_id, user_id) DO NOTHING",
        )
        .bind(tournament_id)
        .bind(user_id)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_participant(
        &self,
        tournament_id: i64,
        user_id: i64,
    ) -> Result<Option<TournamentParticipant>, sqlx::Error> {
        sqlx::query_as::<_, TournamentParticipant>(
            "SELECT tournament_id, user_id, status, total_score, rank, current_stage, registered_at \
             FROM tournament_participants WHERE tournament_id = ? AND user_id = ?",
        )
        .bind(tournament_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_stage_result(
        &self,
        stage_id: i64,
        user_id: i64,
    ) -> Result<Option<TournamentStageResult>, sqlx::Error> {
        sqlx::query_as::<_, TournamentStageResult>(
            "SELECT stage_id, user_id, score, rank, passed, completed_at FROM tournament_stage_results \
             WHERE stage_id = ? AND user_id = ?",
        )
        .bind(stage_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Score one stage for one user atomically.
    ///
    /// Adds the score to the participant total, ranks the participant by a
    /// count of higher totals, writes the stage result and moves
    /// `current_stage` on if the stage was passed. Returns None, with nothing
    /// written, when the result was already completed or the participant row
    /// is gone.
    pub async fn commit_stage_result(
        &self,
        input: &StageCommitInput,
        now_ms: i64,
    ) -> Result<Option<StageCommit>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let total_score: Option<i64> = sqlx::query_scalar(
            "UPDATE tournament_participants SET total_score = total_score + ?, status = 'ACTIVE' \
             WHERE tournament_id = ? AND user_id = ? RETURNING total_score",
        )
        .bind(input.score)
        .bind(input.tournament_id)
        .bind(input.user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(total_score) = total_score else {
            tx.rollback().await?;
            return Ok(None);
        };

        let higher: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tournament_participants WHERE tournament_id = ? AND total_score > ?",
        )
        .bind(input.tournament_id)
        .bind(total_score)
        .fetch_one(&mut *tx)
        .await?;
        let rank = higher + 1;
        let passed = input.min_score_ok && crate::tournament::passes_top_n(rank, input.top_n);

        let written = sqlx::query(
            "INSERT INTO tournament_stage_results (stage_id, user_id, score, rank, passed, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(stage_id, user_id) DO UPDATE SET \
             score = excluded.score, rank = excluded.rank, passed = excluded.passed, completed_at = excluded.completed_at \
             WHERE tournament_stage_results.completed_at IS NULL",
        )
        .bind(input.stage_id)
        .bind(input.user_id)
        .bind(input.score)
        .bind(rank)
        .bind(passed)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
        if written.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            "UPDATE tournament_participants SET rank = ?, \
             current_stage = CASE WHEN ? THEN ? ELSE current_stage END \
             WHERE tournament_id = ? AND user_id = ?",
        )
        .bind(rank)
        .bind(passed)
        .bind(input.stage_order + 1)
        .bind(input.tournament_id)
        .bind(input.user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(StageCommit {
            total_score,
            rank,
            passed,
        }))
    }

    /// Participants by total score. Stored ranks can lag behind the order
    /// until the owner's next stage or a resweep.
    pub async fn standings(&self, tournament_id: i64) -> Result<Vec<StandingRow>, sqlx::Error> {
        sqlx::query_as::<_, StandingRow>(
            "SELECT p.user_id, u.username, p.status, p.total_score, p.rank, p.current_stage \
             FROM tournament_participants p JOIN users u ON u.id = p.user_id \
             WHERE p.tournament_id = ? ORDER BY p.total_score DESC, p.registered_at ASC",
        )
        .bind(tournament_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Recompute every participant's rank from the current totals.
    pub async fn resweep_ranks(&self, tournament_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(RESWEEP_SQL)
            .bind(tournament_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

const RESWEEP_SQL: &str = "UPDATE tournament_participants SET rank = 1 + ( \
     SELECT COUNT(*) FROM tournament_participants other \
     WHERE other.tournament_id = tournament_participants.tournament_id \
     AND other.total_score > tournament_participants.total_score) \
     WHERE tournament_id = ?";
