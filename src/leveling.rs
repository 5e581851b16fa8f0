// XP awards and level calculation.
//
// Level N+1 needs 100 * N more XP than level N: L2 at 100, L3 at 300, L4 at 600.

use serde::Serialize;

pub const XP_PER_CORRECT: i64 = 10;
pub const XP_PER_STREAK_STEP: i64 = 2;
pub const XP_PERFECT_BONUS: i64 = 50;
const XP_LEVEL_STEP: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelInfo {
    pub level: i64,
    /// XP earned since reaching `level`.
    pub xp_in_level: i64,
    /// XP between `level` and the next one.
    pub xp_for_next_level: i64,
}

/// XP granted for one finished game.
pub fn xp_for_game(correct: i64, total_questions: i64, max_streak: i64) -> i64 {
    let perfect = total_questions > 0 && correct == total_questions;
    correct.max(0) * XP_PER_CORRECT
        + max_streak.max(0) * XP_PER_STREAK_STEP
        + if perfect { XP_PERFECT_BONUS } else { 0 }
}

/// Cumulative XP needed to reach `level`.
pub fn xp_for_level(level: i64) -> i64 {
    let n = (level - 1).max(0);
    XP_LEVEL_STEP * n * (n + 1) / 2
}

pub fn level_for_xp(xp: i64) -> LevelInfo {
    let xp = xp.max(0);
    let mut level = 1;
    while xp_for_level(level + 1) <= xp {
        level += 1;
    }
    let floor = xp_for_level(level);
    LevelInfo {
        level,
        xp_in_level: xp - floor,
        xp_for_next_level: xp_for_level(level + 1) - floor,
    }
}

/// New level if going from `before` to `after` XP crossed a threshold.
pub fn level_up(before: i64, after: i64) -> Option<i64> {
    let old = level_for_xp(before).level;
    let new = level_for_xp(after).level;
    (new > old).then_some(new)
}
