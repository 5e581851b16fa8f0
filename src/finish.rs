// Finishing a session: the required scoring transaction, then the
// best-effort fan-out (tournament stage, achievements, notifications).
//
// The finished response is stored on the session row, so finishing again
// returns the same bytes without touching any score.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::achievements::{self, GameFacts};
use crate::api::AppState;
use crate::db::{from_ms, to_ms, BoardScore, CoreScoring, FinalizeInput, QuizSession};
use crate::error::{ApiError, ApiResult};
use crate::leveling;
use crate::metrics;
use crate::notify::Notification;
use crate::scoring::{self, ActivityBonus};
use crate::tournament::{self, StageReport};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardResult {
    pub best_score: i64,
    pub attempts: i64,
    pub activity_bonus: i64,
    pub total_score: i64,
    pub games_until_max_bonus: i64,
    pub is_new_best: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyResult {
    pub week_start: DateTime<Utc>,
    pub best_score: i64,
    pub quizzes: i64,
    pub activity_bonus: i64,
    pub total_score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct XpResult {
    pub earned: i64,
    pub total: i64,
    pub level: i64,
    pub level_up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_level: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TournamentResult {
    pub stage: tournament::StageInfo,
    pub score: i64,
    pub total_score: i64,
    pub rank: i64,
    pub passed: bool,
    pub is_last_stage: bool,
    pub next_stage_title: Option<String>,
}

impl From<StageReport> for TournamentResult {
    fn from(r: StageReport) -> Self {
        Self {
            stage: r.stage,
            score: r.score,
            total_score: r.total_score,
            rank: r.rank,
            passed: r.passed,
            is_last_stage: r.is_last_stage,
            next_stage_title: r.next_stage_title,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinishResponse {
    pub session_id: i64,
    pub game_score: i64,
    pub correct_answers: i64,
    pub total_questions: i64,
    pub max_streak: i64,
    pub leaderboard: LeaderboardResult,
    pub weekly: Option<WeeklyResult>,
    pub xp: XpResult,
    pub achievements: Vec<String>,
    pub tournament: Option<TournamentResult>,
}

/// A finish response plus its serialized form as stored on the session.
#[derive(Debug, Clone)]
pub struct FinishOutcome {
    pub response: FinishResponse,
    pub body: String,
    pub already_finished: bool,
}

/// Monday 00:00 UTC of the week containing `now`.
pub fn week_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let days = now.weekday().num_days_from_monday() as i64;
    let monday = now.date_naive() - chrono::Duration::days(days);
    monday
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}

/// Finish `session_id` for its owner.
pub async fn finish_session(
    state: &AppState,
    user_id: i64,
    quiz_id: i64,
    session_id: i64,
    now: DateTime<Utc>,
) -> ApiResult<FinishOutcome> {
    let session = owned_session(state, user_id, quiz_id, session_id).await?;
    if !session.is_live() {
        return finished_outcome(state, &session).await;
    }
    finalize(state, session, now).await
}

pub(crate) async fn owned_session(
    state: &AppState,
    user_id: i64,
    quiz_id: i64,
    session_id: i64,
) -> ApiResult<QuizSession> {
    state
        .db
        .get_session(session_id)
        .await?
        .filter(|s| s.user_id == user_id && s.quiz_id == quiz_id)
        .ok_or(ApiError::NotFound("Session"))
}

/// Per-game counts that do not depend on any board.
#[derive(Debug, Clone, Copy)]
struct GameTally {
    game_score: i64,
    correct: i64,
    total_questions: i64,
    max_streak: i64,
}

impl GameTally {
    fn xp_earned(&self) -> i64 {
        leveling::xp_for_game(self.correct, self.total_questions, self.max_streak)
    }
}

/// Score a live session. Also used when a resume runs past the last question.
pub(crate) async fn finalize(
    state: &AppState,
    session: QuizSession,
    now: DateTime<Utc>,
) -> ApiResult<FinishOutcome> {
    let db = &state.db;
    let now_ms = to_ms(now);
    let content = state.content.load(db, session.quiz_id).await?;
    let answers = db.list_answers(session.id).await?;
    let tally = GameTally {
        game_score: session.total_score,
        correct: answers.iter().filter(|a| a.is_correct).count() as i64,
        total_questions: content.len(),
        max_streak: scoring::max_streak(answers.iter().map(|a| a.is_correct)),
    };

    let input = FinalizeInput {
        session_id: session.id,
        user_id: session.user_id,
        quiz_id: session.quiz_id,
        game_score: tally.game_score,
        max_streak: tally.max_streak,
        xp_earned: tally.xp_earned(),
        week_start: state.rules.weekly_enabled.then(|| to_ms(week_start(now))),
    };
    let Some(core) = db.finalize_and_score(&input, now_ms).await? else {
        // Lost a race with another finish of the same session.
        let session = db
            .get_session(session.id)
            .await?
            .ok_or(ApiError::NotFound("Session"))?;
        return finished_outcome(state, &session).await;
    };

    metrics::SESSIONS_CLOSED_TOTAL.with_label_values(&["finished"]).inc();
    metrics::GAME_SCORE
        .with_label_values(&[if session.is_tournament { "tournament" } else { "regular" }])
        .observe(tally.game_score as f64);

    let bonus = ActivityBonus::new(state.rules.per_game_bonus, state.rules.max_activity_bonus);
    let mut response = core_response(&bonus, session.id, &tally, now, &core);

    // Everything below is best effort: failures are logged and counted.
    let tournament = match tournament::process_stage(
        db,
        session.user_id,
        session.quiz_id,
        tally.game_score,
        now_ms,
    )
    .await
    {
        Ok(outcome) => outcome.into_report(),
        Err(e) => {
            metrics::best_effort_failure("tournament", &e);
            None
        }
    };

    let facts = GameFacts {
        correct: tally.correct,
        total_questions: tally.total_questions,
        max_streak: tally.max_streak,
        game_score: tally.game_score,
        level: response.xp.level,
        stage_passed: tournament.as_ref().is_some_and(|t| t.passed),
    };
    response.achievements = achievements::award(db, session.user_id, &facts, now_ms)
        .await
        .unwrap_or_else(|e| {
            metrics::best_effort_failure("achievements", &e);
            Vec::new()
        });
    response.tournament = tournament.map(TournamentResult::from);

    if let Some(level) = response.xp.new_level {
        state.notifier.send(session.user_id, Notification::LevelUp { level });
    }
    notify_overtaken(state, &session, &bonus, &core).await;

    if let Err(e) = db.set_presence(session.user_id, None, "idle").await {
        metrics::best_effort_failure("presence", &e);
    }

    tracing::info!(
        user_id = session.user_id,
        session_id = session.id,
        game_score = tally.game_score,
        "Session finished"
    );
    let body = serialize(&response)?;
    db.store_session_result(session.id, &body).await?;
    Ok(FinishOutcome {
        response,
        body,
        already_finished: false,
    })
}

/// The part of a finish response fixed by the scoring transaction.
/// Achievements and the tournament block are filled in afterwards.
fn core_response(
    bonus: &ActivityBonus,
    session_id: i64,
    tally: &GameTally,
    finished_at: DateTime<Utc>,
    core: &CoreScoring,
) -> FinishResponse {
    let weekly = core.weekly.map(|board| WeeklyResult {
        week_start: week_start(finished_at),
        best_score: board.best_score,
        quizzes: board.attempts,
        activity_bonus: bonus.bonus(board.attempts),
        total_score: bonus.total(board.best_score, board.attempts),
    });
    let new_level = leveling::level_up(core.xp_before, core.xp_after);
    FinishResponse {
        session_id,
        game_score: tally.game_score,
        correct_answers: tally.correct,
        total_questions: tally.total_questions,
        max_streak: tally.max_streak,
        leaderboard: leaderboard_result(bonus, core, tally.game_score),
        weekly,
        xp: XpResult {
            earned: tally.xp_earned(),
            total: core.xp_after,
            level: leveling::level_for_xp(core.xp_after).level,
            level_up: new_level.is_some(),
            new_level,
        },
        achievements: Vec::new(),
        tournament: None,
    }
}

fn leaderboard_result(bonus: &ActivityBonus, core: &CoreScoring, game_score: i64) -> LeaderboardResult {
    let breakdown = bonus.breakdown(core.board.best_score, core.board.attempts);
    let previous_best = core.previous.map(|p| p.best_score).unwrap_or(0);
    LeaderboardResult {
        best_score: breakdown.best_score,
        attempts: breakdown.attempts,
        activity_bonus: breakdown.activity_bonus,
        total_score: breakdown.total_score,
        games_until_max_bonus: breakdown.games_until_max_bonus,
        is_new_best: game_score > previous_best,
    }
}

/// Tell players this game pushed past on the quiz board. First entries
/// don't notify anyone.
async fn notify_overtaken(state: &AppState, session: &QuizSession, bonus: &ActivityBonus, core: &CoreScoring) {
    let Some(previous) = core.previous else {
        return;
    };
    let old_total = bonus.total(previous.best_score, previous.attempts);
    let new_total = bonus.total(core.board.best_score, core.board.attempts);
    if new_total <= old_total {
        return;
    }
    let overtaken = match state
        .db
        .overtaken_users(session.quiz_id, session.user_id, *bonus, old_total, new_total)
        .await
    {
        Ok(users) => users,
        Err(e) => {
            metrics::best_effort_failure("notify", &e);
            return;
        }
    };
    if overtaken.is_empty() {
        return;
    }
    let by_username = match state.db.get_user(session.user_id).await {
        Ok(user) => user.map(|u| u.username).unwrap_or_default(),
        Err(e) => {
            metrics::best_effort_failure("notify", &e);
            return;
        }
    };
    for user in overtaken {
        state.notifier.send(
            user.user_id,
            Notification::LeaderboardOvertaken {
                quiz_id: session.quiz_id,
                by_user_id: session.user_id,
                by_username: by_username.clone(),
            },
        );
    }
}

fn serialize(response: &FinishResponse) -> ApiResult<String> {
    serde_json::to_string(response).map_err(|e| ApiError::Internal(e.to_string()))
}

/// Result for a session that is already closed.
async fn finished_outcome(state: &AppState, session: &QuizSession) -> ApiResult<FinishOutcome> {
    if session.abandoned {
        return Err(ApiError::Conflict("session was abandoned".into()));
    }
    if let Some(outcome) = cached_outcome(session) {
        return Ok(outcome);
    }
    rebuilt_outcome(state, session).await
}

fn cached_outcome(session: &QuizSession) -> Option<FinishOutcome> {
    let body = session.result_json.as_ref()?;
    match serde_json::from_str::<FinishResponse>(body) {
        Ok(response) => Some(FinishOutcome {
            response,
            body: body.clone(),
            already_finished: true,
        }),
        Err(e) => {
            tracing::warn!(session_id = session.id, "Cached result unreadable: {e}");
            None
        }
    }
}

/// Rebuild a response when the cached copy is missing, from the scoring
/// snapshot the finalize transaction saved. Side-effect results
/// (achievements, tournament) cannot be recovered.
async fn rebuilt_outcome(state: &AppState, session: &QuizSession) -> ApiResult<FinishOutcome> {
    let db = &state.db;
    let content = state.content.load(db, session.quiz_id).await?;
    let answers = db.list_answers(session.id).await?;
    let tally = GameTally {
        game_score: session.total_score,
        correct: answers.iter().filter(|a| a.is_correct).count() as i64,
        total_questions: content.len(),
        max_streak: session.max_streak,
    };
    let finished_at = from_ms(session.finished_at.unwrap_or(session.started_at));

    let snapshot = session.core_json.as_deref().and_then(|json| {
        serde_json::from_str::<CoreScoring>(json)
            .map_err(|e| tracing::warn!(session_id = session.id, "Scoring snapshot unreadable: {e}"))
            .ok()
    });
    let core = match snapshot {
        Some(core) => core,
        None => current_scoring(state, session, finished_at).await?,
    };

    let bonus = ActivityBonus::new(state.rules.per_game_bonus, state.rules.max_activity_bonus);
    let response = core_response(&bonus, session.id, &tally, finished_at, &core);
    let body = serialize(&response)?;
    if !db.store_session_result_if_missing(session.id, &body).await? {
        // A finish stored its own body in the meantime.
        let stored = db.get_session(session.id).await?;
        if let Some(outcome) = stored.as_ref().and_then(cached_outcome) {
            return Ok(outcome);
        }
    }
    Ok(FinishOutcome {
        response,
        body,
        already_finished: true,
    })
}

/// Board state as it stands now, for sessions closed without a snapshot.
async fn current_scoring(
    state: &AppState,
    session: &QuizSession,
    finished_at: DateTime<Utc>,
) -> ApiResult<CoreScoring> {
    let db = &state.db;
    let board = db
        .get_leaderboard_entry(session.user_id, session.quiz_id)
        .await?
        .map(|e| BoardScore {
            best_score: e.best_score,
            attempts: e.attempts,
        })
        .unwrap_or(BoardScore {
            best_score: session.total_score,
            attempts: 1,
        });
    let weekly = if state.rules.weekly_enabled {
        db.get_weekly_score(session.user_id, to_ms(week_start(finished_at)))
            .await?
    } else {
        None
    };
    let xp = db.get_user(session.user_id).await?.map(|u| u.xp).unwrap_or(0);
    Ok(CoreScoring {
        previous: Some(board),
        board,
        weekly,
        xp_before: xp,
        xp_after: xp,
    })
}
