// Achievement evaluation after a finished game.

use crate::db::Database;

pub const FIRST_GAME: &str = "first_game";
pub const PERFECT_GAME: &str = "perfect_game";
pub const STREAK_5: &str = "streak_5";
pub const STREAK_10: &str = "streak_10";
pub const SCORE_1000: &str = "score_1000";
pub const TOURNAMENT_STAGE_PASSED: &str = "tournament_stage_passed";
pub const LEVEL_5: &str = "level_5";

/// Facts about the finished game that achievements are judged on.
#[derive(Debug, Clone, Copy, Default)]
pub struct GameFacts {
    pub correct: i64,
    pub total_questions: i64,
    pub max_streak: i64,
    pub game_score: i64,
    pub level: i64,
    pub stage_passed: bool,
}

/// Keys whose conditions this game meets, unlocked before or not.
pub fn candidates(facts: &GameFacts) -> Vec<&'static str> {
    let mut keys = vec![FIRST_GAME];
    if facts.total_questions > 0 && facts.correct == facts.total_questions {
        keys.push(PERFECT_GAME);
    }
    if facts.max_streak >= 5 {
        keys.push(STREAK_5);
    }
    if facts.max_streak >= 10 {
        keys.push(STREAK_10);
    }
    if facts.game_score >= 1000 {
        keys.push(SCORE_1000);
    }
    if facts.stage_passed {
        keys.push(TOURNAMENT_STAGE_PASSED);
    }
    if facts.level >= 5 {
        keys.push(LEVEL_5);
    }
    keys
}

/// Store the met achievements and return the ones unlocked just now.
pub async fn award(
    db: &Database,
    user_id: i64,
    facts: &GameFacts,
    now_ms: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let unlocked = db.unlock_achievements(user_id, &candidates(facts), now_ms).await?;
    if !unlocked.is_empty() {
        tracing::info!(user_id, ?unlocked, "Achievements unlocked");
    }
    Ok(unlocked)
}
