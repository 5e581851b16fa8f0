// Database access layer (SQLite via sqlx).
//
// Timestamps are INTEGER unix milliseconds. Multi-statement mutations run in
// a transaction whose first statement is a write so SQLite takes the write
// lock up front instead of failing a later lock upgrade.

mod content;
mod leaderboard;
mod sessions;
mod tournaments;
mod users;

pub use content::NewQuestion;
pub use leaderboard::{BoardRow, BoardScore, CoreScoring, FinalizeInput, OvertakenUser};
pub use sessions::{AnswerInsert, NewSession, TimeoutBackfill};
pub use tournaments::{StageBinding, StageCommit, StageCommitInput, StandingRow};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

pub const PERIOD_ALL_TIME: &str = "ALL_TIME";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub username: String,
    pub xp: i64,
    pub bonus_energy: i64,
    pub bonus_energy_used: i64,
    pub bonus_energy_earned: i64,
    pub current_quiz_id: Option<i64>,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Quiz {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Question {
    pub id: i64,
    pub quiz_id: i64,
    pub position: i64,
    pub text: String,
    pub difficulty: i64,
    pub time_limit_secs: i64,
}

impl Question {
    pub fn time_limit_ms(&self) -> i64 {
        self.time_limit_secs * 1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnswerOption {
    pub id: i64,
    pub question_id: i64,
    pub text: String,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuizSession {
    pub id: i64,
    pub user_id: i64,
    pub quiz_id: i64,
    pub attempt_number: i64,
    pub current_question_index: i64,
    /// None while waiting for the client to confirm it rendered the question.
    pub current_question_started_at: Option<i64>,
    pub current_streak: i64,
    pub total_score: i64,
    pub max_streak: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub is_tournament: bool,
    pub used_bonus_energy: bool,
    pub abandoned: bool,
    pub result_json: Option<String>,
    /// Scoring state captured by the finalize transaction.
    pub core_json: Option<String>,
}

impl QuizSession {
    pub fn is_live(&self) -> bool {
        self.finished_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Answer {
    pub id: i64,
    pub session_id: i64,
    pub question_id: i64,
    pub question_index: i64,
    /// None encodes a timeout.
    pub option_id: Option<i64>,
    pub is_correct: bool,
    pub time_spent_ms: i64,
    pub score_delta: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub quiz_id: i64,
    pub period_type: String,
    pub best_score: i64,
    pub attempts: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WeeklyScore {
    pub user_id: i64,
    pub week_start: i64,
    pub best_score: i64,
    pub quizzes: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tournament {
    pub id: i64,
    pub title: String,
    pub status: String,
    pub starts_at: i64,
    pub ends_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentStage {
    pub id: i64,
    pub tournament_id: i64,
    pub quiz_id: i64,
    pub stage_order: i64,
    pub title: String,
    pub score_multiplier: f64,
    pub min_score: Option<i64>,
    pub top_n: Option<i64>,
    pub starts_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentParticipant {
    pub tournament_id: i64,
    pub user_id: i64,
    pub status: String,
    pub total_score: i64,
    pub rank: Option<i64>,
    pub current_stage: i64,
    pub registered_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentStageResult {
    pub stage_id: i64,
    pub user_id: i64,
    pub score: i64,
    pub rank: Option<i64>,
    pub passed: bool,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub payload: String,
    pub created_at: i64,
}

pub fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        // Every connection to `sqlite::memory:` is its own database, so keep
        // exactly one alive for the lifetime of the pool.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(database_url).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL UNIQUE,
                username TEXT NOT NULL DEFAULT '',
                xp INTEGER NOT NULL DEFAULT 0,
                bonus_energy INTEGER NOT NULL DEFAULT 0,
                bonus_energy_used INTEGER NOT NULL DEFAULT 0,
                bonus_energy_earned INTEGER NOT NULL DEFAULT 0,
                current_quiz_id INTEGER,
                status TEXT NOT NULL DEFAULT 'idle',
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quizzes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS questions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                quiz_id INTEGER NOT NULL REFERENCES quizzes(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                text TEXT NOT NULL,
                difficulty INTEGER NOT NULL DEFAULT 1 CHECK (difficulty > 0),
                time_limit_secs INTEGER NOT NULL DEFAULT 15 CHECK (time_limit_secs > 0),
                UNIQUE(quiz_id, position)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS answer_options (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question_id INTEGER NOT NULL REFERENCES questions(id) ON DELETE CASCADE,
                text TEXT NOT NULL,
                is_correct INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quiz_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                quiz_id INTEGER NOT NULL REFERENCES quizzes(id),
                attempt_number INTEGER NOT NULL,
                current_question_index INTEGER NOT NULL DEFAULT 0,
                current_question_started_at INTEGER,
                current_streak INTEGER NOT NULL DEFAULT 0,
                total_score INTEGER NOT NULL DEFAULT 0,
                max_streak INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                is_tournament INTEGER NOT NULL DEFAULT 0,
                used_bonus_energy INTEGER NOT NULL DEFAULT 0,
                abandoned INTEGER NOT NULL DEFAULT 0,
                result_json TEXT,
                core_json TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one live session per (user, quiz).
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live ON quiz_sessions(user_id, quiz_id) WHERE finished_at IS NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_started ON quiz_sessions(user_id, started_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS answers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES quiz_sessions(id) ON DELETE CASCADE,
                question_id INTEGER NOT NULL REFERENCES questions(id),
                question_index INTEGER NOT NULL,
                option_id INTEGER REFERENCES answer_options(id),
                is_correct INTEGER NOT NULL DEFAULT 0,
                time_spent_ms INTEGER NOT NULL DEFAULT 0,
                score_delta INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(session_id, question_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leaderboard_entries (
                user_id INTEGER NOT NULL REFERENCES users(id),
                quiz_id INTEGER NOT NULL REFERENCES quizzes(id),
                period_type TEXT NOT NULL DEFAULT 'ALL_TIME',
                best_score INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, quiz_id, period_type)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS weekly_scores (
                user_id INTEGER NOT NULL REFERENCES users(id),
                week_start INTEGER NOT NULL,
                best_score INTEGER NOT NULL DEFAULT 0,
                quizzes INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, week_start)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournaments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'UPCOMING',
                starts_at INTEGER NOT NULL,
                ends_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournament_stages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tournament_id INTEGER NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                quiz_id INTEGER NOT NULL REFERENCES quizzes(id),
                stage_order INTEGER NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                score_multiplier REAL NOT NULL DEFAULT 1.0,
                min_score INTEGER,
                top_n INTEGER,
                starts_at INTEGER,
                UNIQUE(tournament_id, stage_order)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournament_participants (
                tournament_id INTEGER NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id),
                status TEXT NOT NULL DEFAULT 'REGISTERED',
                total_score INTEGER NOT NULL DEFAULT 0,
                rank INTEGER,
                current_stage INTEGER NOT NULL DEFAULT 1,
                registered_at INTEGER NOT NULL,
                PRIMARY KEY (tournament_id, user_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_participants_score ON tournament_participants(tournament_id, total_score)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournament_stage_results (
                stage_id INTEGER NOT NULL REFERENCES tournament_stages(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id),
                score INTEGER NOT NULL DEFAULT 0,
                rank INTEGER,
                passed INTEGER NOT NULL DEFAULT 0,
                completed_at INTEGER,
                PRIMARY KEY (stage_id, user_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_achievements (
                user_id INTEGER NOT NULL REFERENCES users(id),
                key TEXT NOT NULL,
                unlocked_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, key)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[test]
    fn test_ms_round_trip() {
        let t = from_ms(1_700_000_000_123);
        assert_eq!(to_ms(t), 1_700_000_000_123);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = test_db().await;
        db.run_migrations().await.unwrap();
        let user = db.upsert_user(42, "alice", 0).await.unwrap();
        assert_eq!(user.telegram_id, 42);
        assert_eq!(user.status, "idle");
    }
}
