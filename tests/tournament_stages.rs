// Integration tests for the tournament stage engine: scoring, replay and
// sequence guards, ranks, and the energy exemption at start.

mod common;

use std::time::Duration;

use common::*;
use trivia_backend::api::AppState;
use trivia_backend::config::GameRules;
use trivia_backend::error::ApiError;
use trivia_backend::finish;
use trivia_backend::lifecycle;
use trivia_backend::session::{self, StartResponse};
use trivia_backend::tournament::{self, StageOutcome};

struct Cup {
    tournament_id: i64,
    stage1_quiz: i64,
    stage2_quiz: i64,
}

/// Active two-stage tournament: stage 1 needs 100 points, stage 2 scores
/// x1.5 and needs 100 points and a top-3 rank.
async fn cup(state: &AppState) -> Cup {
    let db = &state.db;
    let stage1_quiz = seed_quiz(db, "Round one", 2, 15).await;
    let stage2_quiz = seed_quiz(db, "Round two", 2, 15).await;
    let t = db
        .create_tournament("Spring Cup", ms(t0()) - 1_000, ms(t0()) + 86_400_000, 0)
        .await
        .unwrap();
    db.add_stage(t.id, stage1_quiz, "Qualifier", 1.0, Some(100), None, None)
        .await
        .unwrap();
    db.add_stage(t.id, stage2_quiz, "Final", 1.5, Some(100), Some(3), None)
        .await
        .unwrap();
    let report = lifecycle::run_lifecycle_tick(db, ms(t0())).await.unwrap();
    assert_eq!(report.activated, vec![t.id]);
    Cup {
        tournament_id: t.id,
        stage1_quiz,
        stage2_quiz,
    }
}

async fn entrant(state: &AppState, cup: &Cup, telegram_id: i64, name: &str) -> i64 {
    let user = seed_user(&state.db, telegram_id, name).await;
    assert!(tournament::register(&state.db, cup.tournament_id, user, 0).await.unwrap());
    user
}

async fn scored(state: &AppState, user: i64, quiz: i64, raw: i64) -> tournament::StageReport {
    match tournament::process_stage(&state.db, user, quiz, raw, ms(t0())).await.unwrap() {
        StageOutcome::Scored(report) => report,
        other => panic!("expected a scored stage, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stage_passes_on_min_score_and_rank() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let cup = cup(&state).await;
    let leader = entrant(&state, &cup, 1, "leader").await;
    let player = entrant(&state, &cup, 2, "player").await;

    scored(&state, leader, cup.stage1_quiz, 500).await;
    let qualifier = scored(&state, player, cup.stage1_quiz, 200).await;
    assert!(qualifier.passed);
    assert_eq!(qualifier.next_stage_title.as_deref(), Some("Final"));

    let report = scored(&state, player, cup.stage2_quiz, 80).await;
    assert_eq!(report.score, 120);
    assert_eq!(report.total_score, 320);
    assert_eq!(report.rank, 2);
    assert!(report.passed);
    assert!(report.is_last_stage);
    assert_eq!(report.stage.order, 2);
    assert_eq!(report.stage.total_stages, 2);

    let participant = state
        .db
        .get_participant(cup.tournament_id, player)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(participant.current_stage, 3);
    assert_eq!(participant.status, "ACTIVE");
}

#[tokio::test]
async fn test_stage_fails_below_min_score_regardless_of_rank() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let cup = cup(&state).await;
    let player = entrant(&state, &cup, 3, "solo").await;

    scored(&state, player, cup.stage1_quiz, 150).await;
    let report = scored(&state, player, cup.stage2_quiz, 50).await;
    assert_eq!(report.score, 75);
    assert_eq!(report.rank, 1);
    assert!(!report.passed);

    let participant = state
        .db
        .get_participant(cup.tournament_id, player)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(participant.current_stage, 2);
}

#[tokio::test]
async fn test_completed_stage_is_never_rescored() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let cup = cup(&state).await;
    let player = entrant(&state, &cup, 4, "replayer").await;

    scored(&state, player, cup.stage1_quiz, 300).await;
    for raw in [900, 10] {
        let outcome = tournament::process_stage(&state.db, player, cup.stage1_quiz, raw, ms(t0()))
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::AlreadyCompleted);
    }

    let participant = state
        .db
        .get_participant(cup.tournament_id, player)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(participant.total_score, 300);
    let stage_id = state.db.list_stages(cup.tournament_id).await.unwrap()[0].id;
    let result = state.db.get_stage_result(stage_id, player).await.unwrap().unwrap();
    assert_eq!(result.score, 300);
}

#[tokio::test]
async fn test_failed_stage_blocks_later_scoring() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let cup = cup(&state).await;
    let player = entrant(&state, &cup, 5, "skipper").await;

    let qualifier = scored(&state, player, cup.stage1_quiz, 50).await;
    assert!(!qualifier.passed);

    for _ in 0..3 {
        let outcome = tournament::process_stage(&state.db, player, cup.stage2_quiz, 1_000, ms(t0()))
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::SequenceViolation);
    }
    let final_stage = state.db.list_stages(cup.tournament_id).await.unwrap()[1].id;
    assert!(state.db.get_stage_result(final_stage, player).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_participants_and_other_quizzes_are_ignored() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let cup = cup(&state).await;
    let outsider = seed_user(&state.db, 6, "outsider").await;
    let other_quiz = seed_quiz(&state.db, "Unrelated", 1, 15).await;
    let player = entrant(&state, &cup, 7, "player").await;

    for (user, quiz) in [(outsider, cup.stage1_quiz), (player, other_quiz)] {
        let outcome = tournament::process_stage(&state.db, user, quiz, 500, ms(t0()))
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::NotATournamentQuiz);
        assert!(outcome.into_report().is_none());
    }
}

#[tokio::test]
async fn test_quiz_shared_by_two_tournaments_scores_into_both() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let db = &state.db;
    let quiz = seed_quiz(db, "Shared round", 2, 15).await;
    let mut tournaments = Vec::new();
    for (title, head_start) in [("Cup A", 2_000), ("Cup B", 1_000)] {
        let t = db
            .create_tournament(title, ms(t0()) - head_start, ms(t0()) + 86_400_000, 0)
            .await
            .unwrap();
        db.add_stage(t.id, quiz, "Only round", 1.0, None, None, None)
            .await
            .unwrap();
        tournaments.push(t.id);
    }
    lifecycle::run_lifecycle_tick(db, ms(t0())).await.unwrap();
    let player = seed_user(db, 20, "double").await;
    for &id in &tournaments {
        assert!(tournament::register(db, id, player, 0).await.unwrap());
    }

    let first = scored(&state, player, quiz, 300).await;
    let second = scored(&state, player, quiz, 200).await;
    assert_eq!(first.tournament_id, tournaments[0]);
    assert_eq!(second.tournament_id, tournaments[1]);
    assert_eq!((first.total_score, second.total_score), (300, 200));

    let outcome = tournament::process_stage(db, player, quiz, 900, ms(t0())).await.unwrap();
    assert_eq!(outcome, StageOutcome::AlreadyCompleted);
    for (id, total) in [(tournaments[0], 300), (tournaments[1], 200)] {
        let participant = db.get_participant(id, player).await.unwrap().unwrap();
        assert_eq!(participant.total_score, total);
        assert_eq!(participant.rank, Some(1));
    }
}

#[tokio::test]
async fn test_lifecycle_resweeps_stale_ranks() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let cup = cup(&state).await;
    let first = entrant(&state, &cup, 8, "early").await;
    let second = entrant(&state, &cup, 9, "late").await;

    assert_eq!(scored(&state, first, cup.stage1_quiz, 200).await.rank, 1);
    assert_eq!(scored(&state, second, cup.stage1_quiz, 400).await.rank, 1);

    // The earlier finisher's stored rank lags until a resweep
    let stale = state.db.get_participant(cup.tournament_id, first).await.unwrap().unwrap();
    assert_eq!(stale.rank, Some(1));

    let end = ms(t0()) + 86_400_000 + 1;
    let report = lifecycle::run_lifecycle_tick(&state.db, end).await.unwrap();
    assert_eq!(report.finished, vec![cup.tournament_id]);

    let standings = state.db.standings(cup.tournament_id).await.unwrap();
    assert_eq!(standings.len(), 2);
    assert_eq!((standings[0].user_id, standings[0].rank), (second, Some(1)));
    assert_eq!((standings[1].user_id, standings[1].rank), (first, Some(2)));
    assert!(standings.iter().all(|s| s.status == "FINISHED"));
}

#[tokio::test]
async fn test_tournament_quiz_start_skips_energy() {
    let rules = GameRules {
        max_attempts: 0,
        ..GameRules::default()
    };
    let (state, _rx) = state_with(rules).await;
    let cup = cup(&state).await;
    let player = entrant(&state, &cup, 10, "player").await;

    // Stage 2 is not free before stage 1 was attempted
    let err = session::start(&state, player, cup.stage2_quiz, t0()).await.unwrap_err();
    assert!(matches!(err, ApiError::EnergyDepleted { .. }));

    assert!(state.db.grant_bonus_energy(player, 2).await.unwrap());
    let started = session::start(&state, player, cup.stage1_quiz, t0()).await.unwrap();
    let StartResponse::New(payload) = started else {
        panic!("expected a new session");
    };
    assert!(payload.energy_info.is_tournament_quiz);
    let info = payload.tournament_info.unwrap();
    assert_eq!(info.tournament_id, cup.tournament_id);
    assert_eq!(info.stage_order, 1);
    let opened = state.db.get_session(payload.session_id).await.unwrap().unwrap();
    assert!(opened.is_tournament);
    assert!(!opened.used_bonus_energy);
    assert_eq!(state.db.get_user(player).await.unwrap().unwrap().bonus_energy, 2);

    // A completed, even failed, stage 1 unlocks free play of stage 2
    let end = play(&state, player, cup.stage1_quiz, payload.session_id, &[false, false], 1_000).await;
    let finished = finish::finish_session(&state, player, cup.stage1_quiz, payload.session_id, at(end))
        .await
        .unwrap();
    let stage = finished.response.tournament.unwrap();
    assert!(!stage.passed);

    let started = session::start(&state, player, cup.stage2_quiz, at(end + 1_000)).await.unwrap();
    let StartResponse::New(payload) = started else {
        panic!("expected a new session");
    };
    assert!(payload.energy_info.is_tournament_quiz);
    assert_eq!(state.db.get_user(player).await.unwrap().unwrap().bonus_energy, 2);
}

#[tokio::test]
async fn test_finished_tournament_keeps_grace_until_end_time() {
    let rules = GameRules {
        max_attempts: 0,
        min_attempt_interval: Duration::ZERO,
        ..GameRules::default()
    };
    let (state, _rx) = state_with(rules).await;
    let cup = cup(&state).await;
    let player = entrant(&state, &cup, 11, "player").await;
    assert!(state
        .db
        .update_tournament_status(cup.tournament_id, "FINISHED")
        .await
        .unwrap());

    // Closed early: starts stay free until ends_at
    let started = session::start(&state, player, cup.stage1_quiz, t0()).await.unwrap();
    let sid = new_session_id(&started);
    let finished = finish::finish_session(&state, player, cup.stage1_quiz, sid, at(1_000))
        .await
        .unwrap();
    // Finish-time scoring has no grace window
    assert!(finished.response.tournament.is_none());

    let after_end = at(86_400_000 + 1);
    let err = session::start(&state, player, cup.stage1_quiz, after_end).await.unwrap_err();
    assert!(matches!(err, ApiError::EnergyDepleted { .. }));
}

#[tokio::test]
async fn test_registration_closes_with_the_tournament() {
    let (state, _rx) = state_with(GameRules::default()).await;
    let cup = cup(&state).await;
    let user = seed_user(&state.db, 12, "late").await;

    lifecycle::run_lifecycle_tick(&state.db, ms(t0()) + 86_400_001).await.unwrap();
    let err = tournament::register(&state.db, cup.tournament_id, user, 0).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));
}
