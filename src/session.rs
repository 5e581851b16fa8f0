// Session ledger: start or resume a session, the view signal that starts a
// question timer, and answer submission.
//
// A live session waits for the client's view signal before timing a
// question. Time that passes while nobody calls in is settled lazily on the
// next start: questions whose whole budget elapsed become timeout answers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::AppState;
use crate::content::{QuestionView, QuizContent};
use crate::db::{from_ms, to_ms, AnswerInsert, NewSession, QuizSession, TimeoutBackfill};
use crate::energy::{self, EnergyInfo, GatePass};
use crate::error::{ApiError, ApiResult};
use crate::finish::{self, FinishResponse};
use crate::metrics;
use crate::notify::Notification;
use crate::scoring;
use crate::tournament::TournamentQuizInfo;

/// Extra time allowed on top of a question's limit for network latency.
pub const ANSWER_GRACE_MS: i64 = 1_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumedSession {
    pub session_id: i64,
    pub current_question_index: i64,
    pub questions: Vec<QuestionView>,
    pub question_started_at: Option<DateTime<Utc>>,
    pub needs_view_signal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_questions: Option<i64>,
    pub total_score: i64,
    pub current_streak: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionPayload {
    pub session_id: i64,
    pub attempt_number: i64,
    pub remaining_attempts: i64,
    pub questions: Vec<QuestionView>,
    pub energy_info: EnergyInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tournament_info: Option<TournamentQuizInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSession {
    pub session_id: i64,
    pub skipped_questions: i64,
    pub result: FinishResponse,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartResponse {
    Resumed(ResumedSession),
    New(NewSessionPayload),
    /// Timeouts ran the resumed session past its last question.
    Completed(CompletedSession),
}

/// Number of questions, from `from_index` on, whose full time budget fits
/// into `elapsed_ms`.
pub fn timed_out_questions(limits_ms: &[i64], from_index: i64, elapsed_ms: i64) -> i64 {
    let mut remaining = elapsed_ms;
    let mut count = 0;
    for &limit in limits_ms.iter().skip(from_index.max(0) as usize) {
        if remaining < limit {
            break;
        }
        remaining -= limit;
        count += 1;
    }
    count
}

/// `start`: resume the live session for this quiz or open a new one.
pub async fn start(
    state: &AppState,
    user_id: i64,
    quiz_id: i64,
    now: DateTime<Utc>,
) -> ApiResult<StartResponse> {
    let db = &state.db;
    if db.get_user(user_id).await?.is_none() {
        return Err(ApiError::NotFound("User"));
    }
    let content = state.content.load(db, quiz_id).await?;

    if let Some(live) = db.find_live_session(user_id, quiz_id).await? {
        if let Some(resumed) = resume(state, &content, live, now).await? {
            metrics::SESSIONS_STARTED_TOTAL
                .with_label_values(&["resumed"])
                .inc();
            return Ok(resumed);
        }
    }

    open_session(state, &content, user_id, quiz_id, now).await
}

async fn open_session(
    state: &AppState,
    content: &QuizContent,
    user_id: i64,
    quiz_id: i64,
    now: DateTime<Utc>,
) -> ApiResult<StartResponse> {
    let db = &state.db;
    let now_ms = to_ms(now);
    let pass = energy::check_gate(db, &state.rules, user_id, quiz_id, now_ms).await?;

    let new = NewSession {
        user_id,
        quiz_id,
        is_tournament: pass.is_tournament(),
        used_bonus_energy: pass.used_bonus_energy(),
    };
    let session = match db.create_session(new, now_ms).await {
        Ok(session) => session,
        Err(e) => {
            if pass.used_bonus_energy() {
                if let Err(refund) = db.refund_bonus_energy(user_id).await {
                    tracing::error!(user_id, "Bonus energy refund failed: {refund}");
                }
            }
            return Err(match e {
                sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                    ApiError::Conflict("a session for this quiz is already in progress".into())
                }
                other => ApiError::Database(other),
            });
        }
    };

    if let Err(e) = db.set_presence(user_id, Some(quiz_id), "playing").await {
        metrics::best_effort_failure("presence", &e);
    }
    if pass.consumes_attempt() && !state.rules.energy_bypass {
        // The new session is the newest one holding an attempt.
        state.notifier.schedule(
            user_id,
            Notification::EnergyRestored { quiz_id },
            restore_delay(session.started_at, state.rules.attempt_cooldown, now_ms),
        );
    }

    let energy_info = energy::energy_info(db, &state.rules, user_id, &pass, now_ms).await?;
    let remaining_attempts = (energy_info.max - energy_info.used).max(0);
    let tournament_info = match pass {
        GatePass::Tournament(info) => Some(info),
        _ => None,
    };

    metrics::SESSIONS_STARTED_TOTAL.with_label_values(&["new"]).inc();
    tracing::info!(
        user_id,
        quiz_id,
        session_id = session.id,
        attempt = session.attempt_number,
        tournament = session.is_tournament,
        "Session started"
    );

    Ok(StartResponse::New(NewSessionPayload {
        session_id: session.id,
        attempt_number: session.attempt_number,
        remaining_attempts,
        questions: content.client_view(&mut rand::thread_rng()),
        energy_info,
        tournament_info,
    }))
}

/// Settle a live session found at start. Returns None when the session was
/// abandoned and a new one should be opened instead.
async fn resume(
    state: &AppState,
    content: &QuizContent,
    session: QuizSession,
    now: DateTime<Utc>,
) -> ApiResult<Option<StartResponse>> {
    let db = &state.db;
    let now_ms = to_ms(now);

    // A session still waiting for its view signal counts as maximally stale.
    let age_ms = session
        .current_question_started_at
        .map(|t| now_ms - t)
        .unwrap_or(i64::MAX);
    if age_ms > state.rules.abandon_after_ms() {
        if db.abandon_session(session.id, now_ms).await? {
            metrics::SESSIONS_CLOSED_TOTAL
                .with_label_values(&["abandoned"])
                .inc();
            tracing::info!(session_id = session.id, "Abandoned stale session");
        }
        return Ok(None);
    }

    let limits = content.time_limits_ms();
    let from_index = session.current_question_index;
    let skipped = timed_out_questions(&limits, from_index, age_ms);

    let session = if skipped > 0 {
        let backfill = TimeoutBackfill {
            from_index,
            to_index: from_index + skipped,
            timeouts: (from_index..from_index + skipped)
                .filter_map(|index| {
                    content
                        .get(index)
                        .map(|q| (q.question.id, index, q.question.time_limit_ms()))
                })
                .collect(),
        };
        match db.apply_timeouts(session.id, &backfill, now_ms).await? {
            Some(inserted) => {
                metrics::TIMEOUT_ANSWERS_TOTAL.inc_by(inserted);
                tracing::debug!(session_id = session.id, skipped, inserted, "Backfilled timeouts");
            }
            None => tracing::debug!(session_id = session.id, "Session moved on during resume"),
        }
        db.get_session(session.id)
            .await?
            .ok_or(ApiError::NotFound("Session"))?
    } else {
        session
    };

    if !session.is_live() {
        // Finished concurrently; a new start will be gated normally.
        return Ok(None);
    }

    if session.current_question_index >= content.len() {
        let outcome = finish::finalize(state, session.clone(), now).await?;
        return Ok(Some(StartResponse::Completed(CompletedSession {
            session_id: session.id,
            skipped_questions: skipped,
            result: outcome.response,
        })));
    }

    Ok(Some(StartResponse::Resumed(ResumedSession {
        session_id: session.id,
        current_question_index: session.current_question_index,
        questions: content.client_view(&mut rand::thread_rng()),
        question_started_at: session.current_question_started_at.map(from_ms),
        needs_view_signal: session.current_question_started_at.is_none(),
        skipped_questions: (skipped > 0).then_some(skipped),
        total_score: session.total_score,
        current_streak: session.current_streak,
    })))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewResponse {
    pub session_id: i64,
    pub question_index: i64,
    pub question_started_at: DateTime<Utc>,
    pub time_limit_secs: i64,
}

/// View signal: start the timer of the current question. Repeating the
/// signal keeps the original start time.
pub async fn mark_viewed(
    state: &AppState,
    user_id: i64,
    quiz_id: i64,
    session_id: i64,
    question_index: i64,
    now: DateTime<Utc>,
) -> ApiResult<ViewResponse> {
    let db = &state.db;
    let session = live_session(state, user_id, quiz_id, session_id).await?;
    if question_index != session.current_question_index {
        return Err(ApiError::Conflict("question is not current".into()));
    }
    let content = state.content.load(db, quiz_id).await?;
    let question = content
        .get(question_index)
        .ok_or_else(|| ApiError::Conflict("no question pending".into()))?;

    db.start_question_timer(session_id, question_index, to_ms(now)).await?;
    let started_at = db
        .get_session(session_id)
        .await?
        .and_then(|s| s.current_question_started_at)
        .ok_or_else(|| ApiError::Conflict("question is not current".into()))?;

    Ok(ViewResponse {
        session_id,
        question_index,
        question_started_at: from_ms(started_at),
        time_limit_secs: question.question.time_limit_secs,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResponse {
    pub is_correct: bool,
    pub timed_out: bool,
    pub correct_option_id: Option<i64>,
    pub score_delta: i64,
    pub total_score: i64,
    pub current_streak: i64,
    pub next_question_index: i64,
    pub is_last_question: bool,
}

/// Record the answer to the current question.
pub async fn submit_answer(
    state: &AppState,
    user_id: i64,
    quiz_id: i64,
    session_id: i64,
    question_id: i64,
    option_id: Option<i64>,
    now: DateTime<Utc>,
) -> ApiResult<AnswerResponse> {
    let db = &state.db;
    let session = live_session(state, user_id, quiz_id, session_id).await?;
    let content = state.content.load(db, quiz_id).await?;
    let index = session.current_question_index;
    let current = content
        .get(index)
        .ok_or_else(|| ApiError::Conflict("no question pending".into()))?;
    if current.question.id != question_id {
        return Err(ApiError::Conflict("question is not current".into()));
    }
    let Some(started_at) = session.current_question_started_at else {
        return Err(ApiError::Conflict("question timer has not started".into()));
    };

    let chosen = match option_id {
        Some(id) => Some(
            current
                .options
                .iter()
                .find(|o| o.id == id)
                .ok_or_else(|| ApiError::BadRequest("option does not belong to question".into()))?,
        ),
        None => None,
    };

    let limit_ms = current.question.time_limit_ms();
    let spent_ms = (to_ms(now) - started_at).max(0);
    let timed_out = spent_ms > limit_ms + ANSWER_GRACE_MS;
    let is_correct = !timed_out && chosen.is_some_and(|o| o.is_correct);
    let score_delta = scoring::answer_score(
        is_correct,
        current.question.difficulty,
        spent_ms.min(limit_ms),
        limit_ms,
        session.current_streak,
    );
    let streak_after = if is_correct { session.current_streak + 1 } else { 0 };

    let answer = AnswerInsert {
        question_id,
        question_index: index,
        option_id: if timed_out { None } else { option_id },
        is_correct,
        time_spent_ms: spent_ms.min(limit_ms),
        score_delta,
        streak_after,
    };
    if !db.record_answer(session_id, &answer, to_ms(now)).await? {
        return Err(ApiError::Conflict("question already answered".into()));
    }

    Ok(AnswerResponse {
        is_correct,
        timed_out,
        correct_option_id: current.options.iter().find(|o| o.is_correct).map(|o| o.id),
        score_delta,
        total_score: session.total_score + score_delta,
        current_streak: streak_after,
        next_question_index: index + 1,
        is_last_question: index + 1 >= content.len(),
    })
}

async fn live_session(
    state: &AppState,
    user_id: i64,
    quiz_id: i64,
    session_id: i64,
) -> ApiResult<QuizSession> {
    let session = finish::owned_session(state, user_id, quiz_id, session_id).await?;
    if !session.is_live() {
        return Err(ApiError::Conflict("session already finished".into()));
    }
    Ok(session)
}

/// Delay until the attempt spent at `started_at_ms` regenerates.
pub fn restore_delay(started_at_ms: i64, cooldown: Duration, now_ms: i64) -> Duration {
    let due = started_at_ms + cooldown.as_millis() as i64;
    Duration::from_millis((due - now_ms).max(0) as u64)
}
