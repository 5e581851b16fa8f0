// Tournament stage engine: which finished games score into a stage, the
// energy exemption for tournament quizzes, and tournament administration.
//
// Stage results are written once per (stage, user). A user may only bank a
// stage after passing every earlier one, although merely completing the
// earlier stages is enough to play later ones without spending energy.

use serde::{Deserialize, Serialize};

use crate::db::{Database, StageCommitInput, Tournament, TournamentStage};
use crate::error::{ApiError, ApiResult};
use crate::metrics;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TournamentStatus {
    Upcoming,
    Active,
    Finished,
}

impl TournamentStatus {
    /// Parse a status string (from DB).
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "UPCOMING" => Some(Self::Upcoming),
            "ACTIVE" => Some(Self::Active),
            "FINISHED" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn to_str_name(&self) -> &'static str {
        match self {
            Self::Upcoming => "UPCOMING",
            Self::Active => "ACTIVE",
            Self::Finished => "FINISHED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Registered,
    Active,
    Finished,
}

impl ParticipantStatus {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "REGISTERED" => Some(Self::Registered),
            "ACTIVE" => Some(Self::Active),
            "FINISHED" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn to_str_name(&self) -> &'static str {
        match self {
            Self::Registered => "REGISTERED",
            Self::Active => "ACTIVE",
            Self::Finished => "FINISHED",
        }
    }
}

// ── Scoring rules ────────────────────────────────────────────────────

/// Multiplier-adjusted stage score, rounded half away from zero.
pub fn stage_score(raw_score: i64, multiplier: f64) -> i64 {
    (raw_score as f64 * multiplier).round() as i64
}

pub fn passes_min_score(score: i64, min_score: Option<i64>) -> bool {
    min_score.map_or(true, |min| score >= min)
}

pub fn passes_top_n(rank: i64, top_n: Option<i64>) -> bool {
    top_n.map_or(true, |n| rank <= n)
}

// ── Start-time exemption ─────────────────────────────────────────────

/// Why a quiz start does or does not count as tournament play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageEligibility {
    pub is_participant: bool,
    pub is_within_window: bool,
    pub prev_stages_ok: bool,
}

impl StageEligibility {
    pub fn allows(&self) -> bool {
        self.is_participant && self.is_within_window && self.prev_stages_ok
    }
}

/// Active tournaments, plus finished ones until their end time passes.
/// The grace part covers games started just before the status flipped.
pub fn within_window(status: Option<TournamentStatus>, ends_at: i64, now_ms: i64) -> bool {
    match status {
        Some(TournamentStatus::Active) => true,
        Some(TournamentStatus::Finished) => now_ms <= ends_at,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TournamentQuizInfo {
    pub tournament_id: i64,
    pub stage_id: i64,
    pub stage_order: i64,
    pub stage_title: String,
}

/// The first tournament stage that makes a start of `quiz_id` free of energy.
pub async fn tournament_quiz_for_start(
    db: &Database,
    user_id: i64,
    quiz_id: i64,
    now_ms: i64,
) -> Result<Option<TournamentQuizInfo>, sqlx::Error> {
    for binding in db.stages_for_quiz(quiz_id).await? {
        let stage = &binding.stage;
        let participant = db.get_participant(stage.tournament_id, user_id).await?;
        let prev_stages_ok = stage.stage_order <= 1
            || db
                .count_uncleared_earlier_stages(stage.tournament_id, stage.stage_order, user_id, false)
                .await?
                == 0;
        let eligibility = StageEligibility {
            is_participant: participant
                .and_then(|p| ParticipantStatus::from_str_name(&p.status))
                .is_some(),
            is_within_window: within_window(
                TournamentStatus::from_str_name(&binding.tournament_status),
                binding.tournament_ends_at,
                now_ms,
            ),
            prev_stages_ok,
        };
        tracing::debug!(quiz_id, user_id, stage_id = stage.id, ?eligibility, "Tournament start check");
        if eligibility.allows() {
            return Ok(Some(TournamentQuizInfo {
                tournament_id: stage.tournament_id,
                stage_id: stage.id,
                stage_order: stage.stage_order,
                stage_title: stage.title.clone(),
            }));
        }
    }
    Ok(None)
}

// ── Finish-time stage processing ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageInfo {
    pub order: i64,
    pub total_stages: i64,
    pub score_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub tournament_id: i64,
    pub stage_id: i64,
    pub stage: StageInfo,
    pub score: i64,
    pub total_score: i64,
    pub rank: i64,
    pub passed: bool,
    pub is_last_stage: bool,
    pub next_stage_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Scored(StageReport),
    NotATournamentQuiz,
    AlreadyCompleted,
    SequenceViolation,
}

impl StageOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            StageOutcome::Scored(_) => "scored",
            StageOutcome::NotATournamentQuiz => "not_a_tournament_quiz",
            StageOutcome::AlreadyCompleted => "already_completed",
            StageOutcome::SequenceViolation => "sequence_violation",
        }
    }

    /// The part a client sees; every no-op collapses to None.
    pub fn into_report(self) -> Option<StageReport> {
        match self {
            StageOutcome::Scored(report) => Some(report),
            _ => None,
        }
    }
}

/// Score a finished game into its tournament stage, if it belongs to one.
pub async fn process_stage(
    db: &Database,
    user_id: i64,
    quiz_id: i64,
    raw_score: i64,
    now_ms: i64,
) -> Result<StageOutcome, sqlx::Error> {
    let outcome = evaluate_stage(db, user_id, quiz_id, raw_score, now_ms).await?;
    metrics::STAGE_OUTCOMES_TOTAL
        .with_label_values(&[outcome.tag()])
        .inc();
    Ok(outcome)
}

async fn evaluate_stage(
    db: &Database,
    user_id: i64,
    quiz_id: i64,
    raw_score: i64,
    now_ms: i64,
) -> Result<StageOutcome, sqlx::Error> {
    let Some(stage) = db.find_scoring_stage(quiz_id, user_id, now_ms).await? else {
        return Ok(StageOutcome::NotATournamentQuiz);
    };

    let existing = db.get_stage_result(stage.id, user_id).await?;
    if existing.is_some_and(|r| r.completed_at.is_some()) {
        return Ok(StageOutcome::AlreadyCompleted);
    }

    if stage.stage_order > 1
        && db
            .count_uncleared_earlier_stages(stage.tournament_id, stage.stage_order, user_id, true)
            .await?
            > 0
    {
        tracing::info!(user_id, stage_id = stage.id, "Stage played out of sequence, not scored");
        return Ok(StageOutcome::SequenceViolation);
    }

    let score = stage_score(raw_score, stage.score_multiplier);
    let input = StageCommitInput {
        tournament_id: stage.tournament_id,
        stage_id: stage.id,
        stage_order: stage.stage_order,
        user_id,
        score,
        min_score_ok: passes_min_score(score, stage.min_score),
        top_n: stage.top_n,
    };
    let Some(commit) = db.commit_stage_result(&input, now_ms).await? else {
        return Ok(StageOutcome::AlreadyCompleted);
    };

    let stages = db.list_stages(stage.tournament_id).await?;
    let next_stage = stages.iter().find(|s| s.stage_order > stage.stage_order);
    tracing::info!(
        user_id,
        stage_id = stage.id,
        score,
        rank = commit.rank,
        passed = commit.passed,
        "Tournament stage scored"
    );

    Ok(StageOutcome::Scored(StageReport {
        tournament_id: stage.tournament_id,
        stage_id: stage.id,
        stage: StageInfo {
            order: stage.stage_order,
            total_stages: stages.len() as i64,
            score_multiplier: stage.score_multiplier,
        },
        score,
        total_score: commit.total_score,
        rank: commit.rank,
        passed: commit.passed,
        is_last_stage: next_stage.is_none(),
        next_stage_title: next_stage.map(|s| s.title.clone()),
    }))
}

// ── Administration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentDetail {
    #[serde(flatten)]
    pub tournament: Tournament,
    pub stages: Vec<TournamentStage>,
}

pub async fn detail(db: &Database, tournament_id: i64) -> ApiResult<TournamentDetail> {
    let tournament = db
        .get_tournament(tournament_id)
        .await?
        .ok_or(ApiError::NotFound("Tournament"))?;
    let stages = db.list_stages(tournament_id).await?;
    Ok(TournamentDetail { tournament, stages })
}

/// Register a user; only UPCOMING and ACTIVE tournaments accept entrants.
/// Returns false if the user was already registered.
pub async fn register(db: &Database, tournament_id: i64, user_id: i64, now_ms: i64) -> ApiResult<bool> {
    let tournament = db
        .get_tournament(tournament_id)
        .await?
        .ok_or(ApiError::NotFound("Tournament"))?;
    match TournamentStatus::from_str_name(&tournament.status) {
        Some(TournamentStatus::Upcoming | TournamentStatus::Active) => {}
        _ => return Err(ApiError::Conflict("tournament is closed for registration".into())),
    }
    Ok(db.register_participant(tournament_id, user_id, now_ms).await?)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStage {
    pub quiz_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_multiplier")]
    pub score_multiplier: f64,
    pub min_score: Option<i64>,
    pub top_n: Option<i64>,
    pub starts_at: Option<i64>,
}

fn default_multiplier() -> f64 {
    1.0
}

pub async fn add_stage(db: &Database, tournament_id: i64, new: &NewStage) -> ApiResult<TournamentStage> {
    if !(new.score_multiplier.is_finite() && new.score_multiplier > 0.0) {
        return Err(ApiError::BadRequest("scoreMultiplier must be positive".into()));
    }
    if new.top_n.is_some_and(|n| n < 1) {
        return Err(ApiError::BadRequest("topN must be at least 1".into()));
    }
    if db.get_tournament(tournament_id).await?.is_none() {
        return Err(ApiError::NotFound("Tournament"));
    }
    if db.get_quiz(new.quiz_id).await?.is_none() {
        return Err(ApiError::NotFound("Quiz"));
    }
    Ok(db
        .add_stage(
            tournament_id,
            new.quiz_id,
            &new.title,
            new.score_multiplier,
            new.min_score,
            new.top_n,
            new.starts_at,
        )
        .await?)
}
