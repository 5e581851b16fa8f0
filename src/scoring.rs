// Best+activity leaderboard scoring and per-answer scoring.
//
// The dominant term is the best single game, so replays cannot inflate it;
// regular play earns a capped activity bonus on top.

use serde::Serialize;

/// Base points for a correct answer at difficulty 1.
pub const BASE_ANSWER_POINTS: i64 = 100;
/// Extra points for answering instantly, scaled down to 0 at the time limit.
pub const MAX_SPEED_BONUS: i64 = 50;
/// Points per consecutive correct answer before this one.
pub const STREAK_STEP_BONUS: i64 = 10;
/// Streak length after which the streak bonus stops growing.
pub const STREAK_BONUS_CAP: i64 = 5;

/// Activity bonus parameters shared by the all-time and weekly boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityBonus {
    pub per_game: i64,
    pub max: i64,
}

impl ActivityBonus {
    pub fn new(per_game: i64, max: i64) -> Self {
        Self { per_game, max }
    }

    /// Bonus earned for `attempts` finished games.
    pub fn bonus(&self, attempts: i64) -> i64 {
        (attempts.max(0) * self.per_game).min(self.max)
    }

    /// Games that still add to the bonus before the cap is reached.
    pub fn games_until_max(&self, attempts: i64) -> i64 {
        if self.per_game <= 0 {
            return 0;
        }
        (self.max / self.per_game - attempts).max(0)
    }

    /// Total leaderboard score: best game plus capped activity bonus.
    pub fn total(&self, best_score: i64, attempts: i64) -> i64 {
        best_score + self.bonus(attempts)
    }

    /// Break a board entry down for display.
    pub fn breakdown(&self, best_score: i64, attempts: i64) -> ScoreBreakdown {
        ScoreBreakdown {
            best_score,
            attempts,
            activity_bonus: self.bonus(attempts),
            total_score: self.total(best_score, attempts),
            games_until_max_bonus: self.games_until_max(attempts),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub best_score: i64,
    pub attempts: i64,
    pub activity_bonus: i64,
    pub total_score: i64,
    pub games_until_max_bonus: i64,
}

/// Score for a single answer.
///
/// Incorrect answers and timeouts score 0. `streak_before` is the number of
/// consecutive correct answers preceding this one.
pub fn answer_score(
    is_correct: bool,
    difficulty: i64,
    time_spent_ms: i64,
    time_limit_ms: i64,
    streak_before: i64,
) -> i64 {
    if !is_correct {
        return 0;
    }
    let base = BASE_ANSWER_POINTS * difficulty.max(1);
    let speed = if time_limit_ms > 0 {
        let remaining = (time_limit_ms - time_spent_ms.clamp(0, time_limit_ms)) as f64;
        (MAX_SPEED_BONUS as f64 * remaining / time_limit_ms as f64).round() as i64
    } else {
        0
    };
    let streak = STREAK_STEP_BONUS * streak_before.clamp(0, STREAK_BONUS_CAP);
    base + speed + streak
}

/// Longest run of consecutive correct answers, in question order.
pub fn max_streak<I>(answers_in_order: I) -> i64
where
    I: IntoIterator<Item = bool>,
{
    let mut best = 0;
    let mut run = 0;
    for correct in answers_in_order {
        if correct {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}
