// HTTP API routes (quiz play, leaderboards, energy, tournaments).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::services::{ServeDir, ServeFile};

use crate::auth::{self, AuthUser};
use crate::config::{Config, GameRules};
use crate::content::ContentCache;
use crate::db::{to_ms, BoardRow, Database, NewQuestion, Quiz, StandingRow, Tournament};
use crate::energy::{self, EnergyStatus};
use crate::error::{ApiError, ApiResult};
use crate::finish;
use crate::leveling::{self, LevelInfo};
use crate::metrics;
use crate::notify::Notifier;
use crate::rate_limit::{RateLimitType, RateLimiter};
use crate::scoring::ActivityBonus;
use crate::session::{self, AnswerResponse, StartResponse, ViewResponse};
use crate::tournament::{self, NewStage, TournamentDetail};

const DEFAULT_BOARD_LIMIT: i64 = 50;
const MAX_BOARD_LIMIT: i64 = 200;

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub content: ContentCache,
    pub rules: Arc<GameRules>,
    pub notifier: Notifier,
    pub rate_limiter: RateLimiter,
    /// Enables local login and lets any player author tournaments.
    pub local_mode: bool,
}

impl AppState {
    pub fn new(db: Arc<Database>, rules: GameRules, notifier: Notifier, local_mode: bool) -> Self {
        Self {
            db,
            content: ContentCache::new(),
            rules: Arc::new(rules),
            notifier,
            rate_limiter: if local_mode {
                RateLimiter::disabled()
            } else {
                RateLimiter::new()
            },
            local_mode,
        }
    }

    pub fn activity_bonus(&self) -> ActivityBonus {
        ActivityBonus::new(self.rules.per_game_bonus, self.rules.max_activity_bonus)
    }

    fn require_admin(&self, auth: &AuthUser) -> ApiResult<()> {
        if self.local_mode || auth.0.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRequest {
    pub session_id: i64,
    pub question_index: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub session_id: i64,
    pub question_id: i64,
    /// Missing means the client gave up on the question.
    pub option_id: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRequest {
    pub session_id: i64,
}

#[derive(Deserialize)]
pub struct BoardParams {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTournamentRequest {
    pub title: String,
    pub starts_at: i64,
    pub ends_at: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuizRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub questions: Vec<CreateQuestionRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuestionRequest {
    pub text: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: i64,
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: i64,
    pub options: Vec<String>,
    pub correct_index: usize,
}

fn default_difficulty() -> i64 {
    1
}

fn default_time_limit() -> i64 {
    15
}

#[derive(Deserialize)]
pub struct GrantEnergyRequest {
    pub amount: i64,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Quiz play
        .route("/api/quizzes", get(list_quizzes).post(create_quiz))
        .route("/api/quiz/{quiz_id}/start", post(start_quiz))
        .route("/api/quiz/{quiz_id}/view", post(view_question))
        .route("/api/quiz/{quiz_id}/answer", post(answer_question))
        .route("/api/quiz/{quiz_id}/finish", post(finish_quiz))
        // Leaderboards
        .route("/api/leaderboard/weekly", get(weekly_leaderboard))
        .route("/api/leaderboard/{quiz_id}", get(quiz_leaderboard))
        // Player
        .route("/api/energy", get(get_energy))
        .route("/api/me", get(get_me))
        .route("/api/users/{id}/bonus-energy", post(grant_bonus_energy))
        // Tournaments
        .route(
            "/api/tournaments",
            get(list_tournaments).post(create_tournament),
        )
        .route("/api/tournaments/{id}", get(get_tournament))
        .route("/api/tournaments/{id}/register", post(register_tournament))
        .route("/api/tournaments/{id}/standings", get(tournament_standings))
        .route("/api/tournaments/{id}/stages", post(add_stage))
        .route("/api/tournaments/{id}/resweep", post(resweep_tournament));

    if state.local_mode {
        app = app.route("/api/auth/local", post(auth::local_login));
    }

    app.layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

/// Serve the mini-app bundle for every path no API route claimed.
pub fn with_static_files(app: Router, static_dir: PathBuf) -> Router {
    let index_file = static_dir.join("index.html");
    tracing::info!("Serving static files from {}", static_dir.display());
    app.fallback_service(ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)))
}

/// Build the full application from configuration.
pub fn app(config: &Config, db: Arc<Database>, notifier: Notifier) -> Router {
    let state = AppState::new(db, config.rules.clone(), notifier, config.local_mode);
    let app = router(state);
    match &config.static_dir {
        Some(dir) => with_static_files(app, dir.clone()),
        None => app,
    }
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let started = Instant::now();
    let response = next.run(req).await;
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "trivia-backend" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

fn board_limit(params: &BoardParams) -> i64 {
    params
        .limit
        .unwrap_or(DEFAULT_BOARD_LIMIT)
        .clamp(1, MAX_BOARD_LIMIT)
}

// ── Quiz play handlers ────────────────────────────────────────────────

async fn list_quizzes(State(state): State<AppState>) -> ApiResult<Json<Vec<Quiz>>> {
    Ok(Json(state.db.list_quizzes().await?))
}

async fn create_quiz(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateQuizRequest>,
) -> ApiResult<(StatusCode, Json<Quiz>)> {
    state.require_admin(&auth)?;
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title is required".into()));
    }
    if req.questions.is_empty() {
        return Err(ApiError::BadRequest("a quiz needs at least one question".into()));
    }
    for (i, q) in req.questions.iter().enumerate() {
        if q.options.len() < 2 || q.correct_index >= q.options.len() {
            return Err(ApiError::BadRequest(format!(
                "question {i} needs two or more options and a valid correctIndex"
            )));
        }
        if q.time_limit_secs < 1 || q.difficulty < 1 {
            return Err(ApiError::BadRequest(format!(
                "question {i} has a non-positive timeLimitSecs or difficulty"
            )));
        }
    }

    let questions: Vec<NewQuestion> = req
        .questions
        .iter()
        .map(|q| NewQuestion {
            text: &q.text,
            difficulty: q.difficulty,
            time_limit_secs: q.time_limit_secs,
            options: q.options.iter().map(String::as_str).collect(),
            correct: q.correct_index,
        })
        .collect();
    let quiz = state
        .db
        .create_quiz_with_questions(req.title.trim(), &req.description, &questions, to_ms(Utc::now()))
        .await?;
    state.content.invalidate(quiz.id);
    tracing::info!(quiz_id = quiz.id, questions = req.questions.len(), "Quiz created");
    Ok((StatusCode::CREATED, Json(quiz)))
}

async fn start_quiz(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(quiz_id): Path<i64>,
) -> ApiResult<Json<StartResponse>> {
    state
        .rate_limiter
        .check_limit(auth.0.sub, RateLimitType::QuizStart)?;
    let response = session::start(&state, auth.0.sub, quiz_id, Utc::now()).await?;
    Ok(Json(response))
}

async fn view_question(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(quiz_id): Path<i64>,
    Json(req): Json<ViewRequest>,
) -> ApiResult<Json<ViewResponse>> {
    state
        .rate_limiter
        .check_limit(auth.0.sub, RateLimitType::QuizAnswer)?;
    let response = session::mark_viewed(
        &state,
        auth.0.sub,
        quiz_id,
        req.session_id,
        req.question_index,
        Utc::now(),
    )
    .await?;
    Ok(Json(response))
}

async fn answer_question(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(quiz_id): Path<i64>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<Json<AnswerResponse>> {
    state
        .rate_limiter
        .check_limit(auth.0.sub, RateLimitType::QuizAnswer)?;
    let response = session::submit_answer(
        &state,
        auth.0.sub,
        quiz_id,
        req.session_id,
        req.question_id,
        req.option_id,
        Utc::now(),
    )
    .await?;
    Ok(Json(response))
}

/// Returns the stored result body so a repeated finish is byte-identical.
async fn finish_quiz(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(quiz_id): Path<i64>,
    Json(req): Json<FinishRequest>,
) -> ApiResult<Response> {
    state
        .rate_limiter
        .check_limit(auth.0.sub, RateLimitType::QuizFinish)?;
    let outcome =
        finish::finish_session(&state, auth.0.sub, quiz_id, req.session_id, Utc::now()).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        outcome.body,
    )
        .into_response())
}

// ── Leaderboard handlers ──────────────────────────────────────────────

async fn quiz_leaderboard(
    State(state): State<AppState>,
    Path(quiz_id): Path<i64>,
    Query(params): Query<BoardParams>,
) -> ApiResult<Json<Vec<BoardRow>>> {
    if state.db.get_quiz(quiz_id).await?.is_none() {
        return Err(ApiError::NotFound("Quiz"));
    }
    let rows = state
        .db
        .top_leaderboard(quiz_id, state.activity_bonus(), board_limit(&params))
        .await?;
    Ok(Json(rows))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WeeklyBoard {
    week_start: chrono::DateTime<Utc>,
    entries: Vec<BoardRow>,
}

async fn weekly_leaderboard(
    State(state): State<AppState>,
    Query(params): Query<BoardParams>,
) -> ApiResult<Json<WeeklyBoard>> {
    let week_start = finish::week_start(Utc::now());
    let entries = state
        .db
        .top_weekly(to_ms(week_start), state.activity_bonus(), board_limit(&params))
        .await?;
    Ok(Json(WeeklyBoard { week_start, entries }))
}

// ── Player handlers ───────────────────────────────────────────────────

async fn get_energy(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<EnergyStatus>> {
    let status = energy::energy_status(&state.db, &state.rules, auth.0.sub, Utc::now()).await?;
    Ok(Json(status))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    user_id: i64,
    username: String,
    xp: i64,
    #[serde(flatten)]
    level: LevelInfo,
    bonus_energy: i64,
    games_played: i64,
    achievements: Vec<String>,
    status: String,
    current_quiz_id: Option<i64>,
}

async fn get_me(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<MeResponse>> {
    let user = state
        .db
        .get_user(auth.0.sub)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    let achievements = state.db.list_achievements(user.id).await?;
    let games_played = state.db.count_finished_sessions(user.id).await?;
    Ok(Json(MeResponse {
        user_id: user.id,
        username: user.username,
        xp: user.xp,
        level: leveling::level_for_xp(user.xp),
        bonus_energy: user.bonus_energy,
        games_played,
        achievements,
        status: user.status,
        current_quiz_id: user.current_quiz_id,
    }))
}

async fn grant_bonus_energy(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<i64>,
    Json(req): Json<GrantEnergyRequest>,
) -> ApiResult<Json<Value>> {
    state.require_admin(&auth)?;
    if req.amount < 1 {
        return Err(ApiError::BadRequest("amount must be positive".into()));
    }
    if !state.db.grant_bonus_energy(user_id, req.amount).await? {
        return Err(ApiError::NotFound("User"));
    }
    tracing::info!(user_id, amount = req.amount, "Bonus energy granted");
    Ok(Json(json!({ "granted": req.amount })))
}

// ── Tournament handlers ───────────────────────────────────────────────

async fn list_tournaments(State(state): State<AppState>) -> ApiResult<Json<Vec<Tournament>>> {
    Ok(Json(state.db.list_tournaments().await?))
}

async fn create_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateTournamentRequest>,
) -> ApiResult<(StatusCode, Json<Tournament>)> {
    state.require_admin(&auth)?;
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title is required".into()));
    }
    if req.ends_at <= req.starts_at {
        return Err(ApiError::BadRequest("endsAt must be after startsAt".into()));
    }
    let tournament = state
        .db
        .create_tournament(req.title.trim(), req.starts_at, req.ends_at, to_ms(Utc::now()))
        .await?;
    tracing::info!(tournament_id = tournament.id, "Tournament created");
    Ok((StatusCode::CREATED, Json(tournament)))
}

async fn get_tournament(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<TournamentDetail>> {
    Ok(Json(tournament::detail(&state.db, id).await?))
}

async fn register_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let created = tournament::register(&state.db, id, auth.0.sub, to_ms(Utc::now())).await?;
    Ok(Json(json!({ "registered": true, "alreadyRegistered": !created })))
}

/// Ranks are written when a participant completes a stage, so a player's
/// stored rank can lag until the next resweep.
async fn tournament_standings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<StandingRow>>> {
    if state.db.get_tournament(id).await?.is_none() {
        return Err(ApiError::NotFound("Tournament"));
    }
    Ok(Json(state.db.standings(id).await?))
}

async fn add_stage(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<NewStage>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state.require_admin(&auth)?;
    let stage = tournament::add_stage(&state.db, id, &req).await?;
    Ok((StatusCode::CREATED, Json(json!(stage))))
}

async fn resweep_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<StandingRow>>> {
    state.require_admin(&auth)?;
    if state.db.get_tournament(id).await?.is_none() {
        return Err(ApiError::NotFound("Tournament"));
    }
    state.db.resweep_ranks(id).await?;
    Ok(Json(state.db.standings(id).await?))
}
