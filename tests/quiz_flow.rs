// Integration tests for the session ledger, energy gate and finish scoring,
// driven through the service functions and the HTTP router.

mod common;

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use common::*;
use trivia_backend::api;
use trivia_backend::config::GameRules;
use trivia_backend::db::FinalizeInput;
use trivia_backend::error::ApiError;
use trivia_backend::finish;
use trivia_backend::notify::Notification;
use trivia_backend::session::{self, StartResponse};

#[tokio::test]
async fn test_best_plus_activity_across_two_games() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Capitals", 3, 15).await;
    let user = seed_user(&state.db, 100, "alice").await;

    let started = session::start(&state, user, quiz, at(0)).await.unwrap();
    let sid = new_session_id(&started);
    let end = play(&state, user, quiz, sid, &[true, true, true], 1_000).await;
    let first = finish::finish_session(&state, user, quiz, sid, at(end)).await.unwrap();

    // 3 correct after 2s of 15s: 143 + 153 + 163
    assert_eq!(first.response.game_score, 459);
    assert_eq!(first.response.correct_answers, 3);
    assert_eq!(first.response.max_streak, 3);
    assert_eq!(first.response.leaderboard.best_score, 459);
    assert_eq!(first.response.leaderboard.attempts, 1);
    assert_eq!(first.response.leaderboard.total_score, 509);
    assert_eq!(first.response.leaderboard.games_until_max_bonus, 9);
    assert!(first.response.leaderboard.is_new_best);
    assert_eq!(first.response.xp.earned, 10 * 3 + 2 * 3 + 50);
    assert!(first.response.achievements.contains(&"first_game".to_string()));
    assert!(first.response.achievements.contains(&"perfect_game".to_string()));
    assert!(first.response.tournament.is_none());

    // Past the 30s spacing between attempts
    let restart = end + 60_000;
    let started = session::start(&state, user, quiz, at(restart)).await.unwrap();
    let sid = new_session_id(&started);
    let end = play(&state, user, quiz, sid, &[false, false, true], restart + 1_000).await;
    let second = finish::finish_session(&state, user, quiz, sid, at(end)).await.unwrap();

    assert_eq!(second.response.game_score, 143);
    assert_eq!(second.response.leaderboard.best_score, 459);
    assert_eq!(second.response.leaderboard.attempts, 2);
    assert_eq!(second.response.leaderboard.total_score, 559);
    assert!(!second.response.leaderboard.is_new_best);
    assert!(second.response.achievements.is_empty());

    let weekly = second.response.weekly.unwrap();
    assert_eq!(weekly.best_score, 459);
    assert_eq!(weekly.quizzes, 2);
    assert_eq!(weekly.week_start, at(-12 * 3_600_000));
}

#[tokio::test]
async fn test_finish_is_idempotent() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Rivers", 2, 15).await;
    let user = seed_user(&state.db, 1, "bob").await;

    let sid = new_session_id(&session::start(&state, user, quiz, at(0)).await.unwrap());
    let end = play(&state, user, quiz, sid, &[true, false], 1_000).await;
    let first = finish::finish_session(&state, user, quiz, sid, at(end)).await.unwrap();
    assert!(!first.already_finished);

    let again = finish::finish_session(&state, user, quiz, sid, at(end + 5_000)).await.unwrap();
    assert!(again.already_finished);
    assert_eq!(again.body, first.body);

    let entry = state.db.get_leaderboard_entry(user, quiz).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 1);
    let xp = state.db.get_user(user).await.unwrap().unwrap().xp;
    assert_eq!(xp, first.response.xp.total);
    assert_eq!(state.db.count_finished_sessions(user).await.unwrap(), 1);
}

#[tokio::test]
async fn test_finish_after_scoring_commit_reports_committed_result() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Lakes", 2, 15).await;
    let user = seed_user(&state.db, 1, "carol").await;

    let sid = new_session_id(&session::start(&state, user, quiz, at(0)).await.unwrap());
    let end = play(&state, user, quiz, sid, &[true, true], 1_000).await;
    let played = state.db.get_session(sid).await.unwrap().unwrap();

    // Scoring committed, full result not cached yet
    let input = FinalizeInput {
        session_id: sid,
        user_id: user,
        quiz_id: quiz,
        game_score: played.total_score,
        max_streak: 2,
        xp_earned: 74,
        week_start: Some(ms(finish::week_start(at(end)))),
    };
    state.db.finalize_and_score(&input, ms(at(end))).await.unwrap().unwrap();

    let first = finish::finish_session(&state, user, quiz, sid, at(end + 100)).await.unwrap();
    assert!(first.already_finished);
    assert!(first.response.leaderboard.is_new_best);
    assert_eq!(first.response.leaderboard.best_score, played.total_score);
    assert_eq!(first.response.leaderboard.attempts, 1);
    assert_eq!(first.response.xp.earned, 74);
    assert_eq!(first.response.xp.total, 74);
    assert_eq!(first.response.weekly.as_ref().unwrap().quizzes, 1);

    let again = finish::finish_session(&state, user, quiz, sid, at(end + 200)).await.unwrap();
    assert_eq!(again.body, first.body);
    let cached = state.db.get_session(sid).await.unwrap().unwrap().result_json;
    assert_eq!(cached.as_deref(), Some(first.body.as_str()));
}

#[tokio::test]
async fn test_finish_checks_ownership() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Rivers", 2, 15).await;
    let owner = seed_user(&state.db, 1, "owner").await;
    let other = seed_user(&state.db, 2, "other").await;

    let sid = new_session_id(&session::start(&state, owner, quiz, at(0)).await.unwrap());
    let err = finish::finish_session(&state, other, quiz, sid, at(1_000)).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound("Session")));
}

#[tokio::test]
async fn test_energy_depletes_then_bonus_energy_is_spent() {
    let rules = GameRules {
        max_attempts: 2,
        min_attempt_interval: Duration::ZERO,
        ..GameRules::default()
    };
    let cooldown_ms = rules.attempt_cooldown_ms();
    let (state, _rx) = state_with(rules).await;
    let quiz = seed_quiz(&state.db, "Flags", 1, 15).await;
    let user = seed_user(&state.db, 7, "carol").await;

    for (i, offset) in [0, 10_000].into_iter().enumerate() {
        let started = session::start(&state, user, quiz, at(offset)).await.unwrap();
        let StartResponse::New(payload) = &started else {
            panic!("expected a new session");
        };
        assert_eq!(payload.energy_info.used, i as i64 + 1);
        assert_eq!(payload.remaining_attempts, 1 - i as i64);
        finish::finish_session(&state, user, quiz, payload.session_id, at(offset + 1_000))
            .await
            .unwrap();
    }

    let err = session::start(&state, user, quiz, at(20_000)).await.unwrap_err();
    match err {
        ApiError::EnergyDepleted { wait_ms } => assert_eq!(wait_ms, cooldown_ms - 20_000),
        other => panic!("expected energy_depleted, got {other:?}"),
    }

    assert!(state.db.grant_bonus_energy(user, 1).await.unwrap());
    let started = session::start(&state, user, quiz, at(21_000)).await.unwrap();
    let StartResponse::New(payload) = started else {
        panic!("expected a new session");
    };
    assert!(payload.energy_info.used_bonus_energy);
    assert_eq!(payload.energy_info.bonus_energy, 0);
    assert_eq!(payload.remaining_attempts, 0);
    let session = state.db.get_session(payload.session_id).await.unwrap().unwrap();
    assert!(session.used_bonus_energy);
}

#[tokio::test]
async fn test_attempt_spacing_is_checked_before_bonus_energy() {
    let rules = GameRules {
        max_attempts: 1,
        ..GameRules::default()
    };
    let (state, _rx) = state_with(rules).await;
    let quiz = seed_quiz(&state.db, "Flags", 1, 15).await;
    let user = seed_user(&state.db, 8, "dave").await;
    state.db.grant_bonus_energy(user, 1).await.unwrap();

    let sid = new_session_id(&session::start(&state, user, quiz, at(0)).await.unwrap());
    finish::finish_session(&state, user, quiz, sid, at(10_000)).await.unwrap();

    let err = session::start(&state, user, quiz, at(20_000)).await.unwrap_err();
    assert!(matches!(err, ApiError::RateLimited { wait_ms: 20_000 }));
    assert_eq!(state.db.get_user(user).await.unwrap().unwrap().bonus_energy, 1);

    let started = session::start(&state, user, quiz, at(41_000)).await.unwrap();
    let StartResponse::New(payload) = started else {
        panic!("expected a new session");
    };
    assert!(payload.energy_info.used_bonus_energy);
    assert_eq!(state.db.get_user(user).await.unwrap().unwrap().bonus_energy, 0);
}

#[tokio::test]
async fn test_resume_backfills_timed_out_questions() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Timed", 4, 10).await;
    let user = seed_user(&state.db, 9, "erin").await;

    let sid = new_session_id(&session::start(&state, user, quiz, at(0)).await.unwrap());
    session::mark_viewed(&state, user, quiz, sid, 0, at(1_000)).await.unwrap();

    // 25s after the first timer: two 10s budgets are gone
    let resumed = session::start(&state, user, quiz, at(26_000)).await.unwrap();
    let StartResponse::Resumed(resumed) = resumed else {
        panic!("expected a resumed session");
    };
    assert_eq!(resumed.session_id, sid);
    assert_eq!(resumed.current_question_index, 2);
    assert_eq!(resumed.skipped_questions, Some(2));
    assert!(resumed.needs_view_signal);
    assert_eq!(resumed.current_streak, 0);

    let answers = state.db.list_answers(sid).await.unwrap();
    assert_eq!(answers.len(), 2);
    assert!(answers.iter().all(|a| a.option_id.is_none() && !a.is_correct));
    assert!(answers.iter().all(|a| a.time_spent_ms == 10_000));
}

#[tokio::test]
async fn test_resume_runs_past_last_question_and_completes() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Short", 2, 10).await;
    let user = seed_user(&state.db, 10, "fay").await;

    let sid = new_session_id(&session::start(&state, user, quiz, at(0)).await.unwrap());
    session::mark_viewed(&state, user, quiz, sid, 0, at(500)).await.unwrap();

    let completed = session::start(&state, user, quiz, at(60_000)).await.unwrap();
    let StartResponse::Completed(completed) = completed else {
        panic!("expected a completed session");
    };
    assert_eq!(completed.session_id, sid);
    assert_eq!(completed.skipped_questions, 2);
    assert_eq!(completed.result.game_score, 0);
    assert_eq!(completed.result.leaderboard.attempts, 1);

    let session = state.db.get_session(sid).await.unwrap().unwrap();
    assert!(!session.is_live());
    assert!(!session.abandoned);
}

#[tokio::test]
async fn test_stale_sessions_are_abandoned() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Stale", 3, 10).await;
    let user = seed_user(&state.db, 11, "gus").await;

    // Never signalled a view: treated as maximally stale
    let first = new_session_id(&session::start(&state, user, quiz, at(0)).await.unwrap());
    let second = new_session_id(&session::start(&state, user, quiz, at(5_000)).await.unwrap());
    assert_ne!(first, second);
    let old = state.db.get_session(first).await.unwrap().unwrap();
    assert!(old.abandoned);

    // Timer older than the abandonment threshold
    session::mark_viewed(&state, user, quiz, second, 0, at(6_000)).await.unwrap();
    let third = new_session_id(&session::start(&state, user, quiz, at(6_000 + 31 * 60_000)).await.unwrap());
    assert_ne!(second, third);

    let err = finish::finish_session(&state, user, quiz, first, at(7_000)).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));
}

#[tokio::test]
async fn test_answer_rules() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Rules", 2, 10).await;
    let user = seed_user(&state.db, 12, "hal").await;
    let content = state.content.load(&state.db, quiz).await.unwrap();
    let q0 = content.get(0).unwrap();
    let right = q0.options.iter().find(|o| o.is_correct).unwrap().id;

    let sid = new_session_id(&session::start(&state, user, quiz, at(0)).await.unwrap());

    // No view signal yet
    let err = session::submit_answer(&state, user, quiz, sid, q0.question.id, Some(right), at(1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));

    session::mark_viewed(&state, user, quiz, sid, 0, at(1_000)).await.unwrap();
    // A repeated signal keeps the first start time
    let again = session::mark_viewed(&state, user, quiz, sid, 0, at(3_000)).await.unwrap();
    assert_eq!(again.question_started_at, at(1_000));

    // Past limit plus grace: counted as a timeout even though the option is right
    let late = session::submit_answer(&state, user, quiz, sid, q0.question.id, Some(right), at(12_500))
        .await
        .unwrap();
    assert!(late.timed_out);
    assert!(!late.is_correct);
    assert_eq!(late.score_delta, 0);
    assert_eq!(late.correct_option_id, Some(right));
    assert_eq!(late.next_question_index, 1);
    assert!(!late.is_last_question);

    let dup = session::submit_answer(&state, user, quiz, sid, q0.question.id, Some(right), at(13_000))
        .await
        .unwrap_err();
    assert!(matches!(dup, ApiError::Conflict(_)));

    let q1 = content.get(1).unwrap();
    let right1 = q1.options.iter().find(|o| o.is_correct).unwrap().id;
    session::mark_viewed(&state, user, quiz, sid, 1, at(14_000)).await.unwrap();
    let ok = session::submit_answer(&state, user, quiz, sid, q1.question.id, Some(right1), at(14_000))
        .await
        .unwrap();
    assert!(ok.is_correct);
    assert_eq!(ok.score_delta, 150);
    assert!(ok.is_last_question);
}

#[tokio::test]
async fn test_energy_restored_is_scheduled_after_cooldown() {
    let rules = GameRules {
        attempt_cooldown: Duration::from_millis(50),
        ..GameRules::default()
    };
    let (state, mut rx) = state_with(rules).await;
    let quiz = seed_quiz(&state.db, "Quick", 1, 10).await;
    let user = seed_user(&state.db, 13, "ivy").await;

    session::start(&state, user, quiz, chrono::Utc::now()).await.unwrap();
    let dispatch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dispatch.user_id, user);
    assert_eq!(dispatch.notification, Notification::EnergyRestored { quiz_id: quiz });
}

#[tokio::test]
async fn test_overtaking_notifies_passed_players() {
    let (state, mut rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Race", 3, 15).await;
    let alice = seed_user(&state.db, 20, "alice").await;
    let bob = seed_user(&state.db, 21, "bob").await;

    let sid = new_session_id(&session::start(&state, alice, quiz, at(0)).await.unwrap());
    let end = play(&state, alice, quiz, sid, &[true, true, true], 1_000).await;
    finish::finish_session(&state, alice, quiz, sid, at(end)).await.unwrap();

    // Bob's first entry notifies nobody
    let sid = new_session_id(&session::start(&state, bob, quiz, at(0)).await.unwrap());
    let end = play(&state, bob, quiz, sid, &[false, false, false], 1_000).await;
    finish::finish_session(&state, bob, quiz, sid, at(end)).await.unwrap();
    assert!(rx.try_recv().is_err());

    let restart = end + 60_000;
    let sid = new_session_id(&session::start(&state, bob, quiz, at(restart)).await.unwrap());
    let end = play(&state, bob, quiz, sid, &[true, true, true], restart + 1_000).await;
    finish::finish_session(&state, bob, quiz, sid, at(end)).await.unwrap();

    let dispatch = rx.try_recv().unwrap();
    assert_eq!(dispatch.user_id, alice);
    assert_eq!(
        dispatch.notification,
        Notification::LeaderboardOvertaken {
            quiz_id: quiz,
            by_user_id: bob,
            by_username: "bob".into(),
        }
    );
}

// ── HTTP ─────────────────────────────────────────────────────────────

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_http_start_and_finish() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let quiz = seed_quiz(&state.db, "Http", 2, 15).await;
    let state = api::AppState {
        local_mode: true,
        ..state
    };
    let app = api::router(state);

    let response = app
        .clone()
        .oneshot(post(
            "/api/auth/local",
            None,
            serde_json::json!({ "telegramId": 555, "username": "web" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let token = json_body(response).await["token"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post(&format!("/api/quiz/{quiz}/start"), None, serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(post(&format!("/api/quiz/{quiz}/start"), Some(&token), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let started = json_body(response).await;
    assert_eq!(started["status"], "new");
    assert_eq!(started["questions"].as_array().unwrap().len(), 2);
    assert!(started["questions"][0]["options"][0].get("isCorrect").is_none());
    let session_id = started["sessionId"].as_i64().unwrap();

    let finish_req = || {
        post(
            &format!("/api/quiz/{quiz}/finish"),
            Some(&token),
            serde_json::json!({ "sessionId": session_id }),
        )
    };
    let first = app.clone().oneshot(finish_req()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first = to_bytes(first.into_body(), usize::MAX).await.unwrap();
    let second = app.clone().oneshot(finish_req()).await.unwrap();
    let second = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert_eq!(first, second);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/leaderboard/{quiz}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let board = json_body(response).await;
    assert_eq!(board[0]["username"], "web");
    assert_eq!(board[0]["attempts"], 1);
}

#[tokio::test]
async fn test_http_rejections_carry_wait_time() {
    let rules = GameRules {
        max_attempts: 0,
        ..GameRules::default()
    };
    let (state, _rx) = state_with(rules).await;
    let quiz = seed_quiz(&state.db, "Closed", 1, 15).await;
    let user = seed_user(&state.db, 77, "zero").await;
    let token = trivia_backend::auth::create_token(user, "zero", "player").unwrap();
    let app = api::router(state);

    let response = app
        .oneshot(post(&format!("/api/quiz/{quiz}/start"), Some(&token), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["error"], "energy_depleted");
    assert!(body["waitMs"].is_number());
    assert!(body["waitSeconds"].is_number());
}
