// Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

use trivia_backend::api::AppState;
use trivia_backend::config::GameRules;
use trivia_backend::db::Database;
use trivia_backend::notify::{Dispatch, Notifier};
use trivia_backend::session::{self, StartResponse};

/// Monday 2026-03-02 12:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

pub fn at(offset_ms: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::milliseconds(offset_ms)
}

pub fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub async fn state_with(rules: GameRules) -> (AppState, UnboundedReceiver<Dispatch>) {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let (notifier, rx) = Notifier::channel();
    (AppState::new(Arc::new(db), rules, notifier, false), rx)
}

/// A quiz of `n` questions with two options each; option "right" is correct.
pub async fn seed_quiz(db: &Database, title: &str, n: usize, time_limit_secs: i64) -> i64 {
    let quiz = db.create_quiz(title, "", 0).await.unwrap();
    for i in 0..n {
        db.add_question(quiz.id, &format!("Q{i}"), 1, time_limit_secs, &["wrong", "right"], 1)
            .await
            .unwrap();
    }
    quiz.id
}

pub async fn seed_user(db: &Database, telegram_id: i64, name: &str) -> i64 {
    db.upsert_user(telegram_id, name, 0).await.unwrap().id
}

pub fn new_session_id(response: &StartResponse) -> i64 {
    match response {
        StartResponse::New(s) => s.session_id,
        other => panic!("expected a new session, got {other:?}"),
    }
}

/// Answer every remaining question, one every 3 seconds from `start_ms`.
/// `correct[i]` picks the right or wrong option. Returns the time after the
/// last answer.
pub async fn play(
    state: &AppState,
    user_id: i64,
    quiz_id: i64,
    session_id: i64,
    correct: &[bool],
    start_ms: i64,
) -> i64 {
    let content = state.content.load(&state.db, quiz_id).await.unwrap();
    let mut now = start_ms;
    for (index, right) in correct.iter().enumerate() {
        let question = content.get(index as i64).unwrap();
        let option = question
            .options
            .iter()
            .find(|o| o.is_correct == *right)
            .unwrap();
        session::mark_viewed(state, user_id, quiz_id, session_id, index as i64, at(now))
            .await
            .unwrap();
        now += 2_000;
        session::submit_answer(
            state,
            user_id,
            quiz_id,
            session_id,
            question.question.id,
            Some(option.id),
            at(now),
        )
        .await
        .unwrap();
        now += 1_000;
    }
    now
}
