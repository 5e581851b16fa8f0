// Question content provider: a process-wide cache of quiz questions, served
// to clients with shuffled options and without the correct flag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::db::{AnswerOption, Database, Question};
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct CachedQuestion {
    pub question: Question,
    pub options: Vec<AnswerOption>,
}

/// Ordered questions of one quiz.
#[derive(Debug, Clone)]
pub struct QuizContent {
    pub quiz_id: i64,
    pub questions: Vec<CachedQuestion>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionView {
    pub id: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionView {
    pub id: i64,
    pub index: i64,
    pub text: String,
    pub difficulty: i64,
    pub time_limit_secs: i64,
    pub options: Vec<OptionView>,
}

impl QuizContent {
    pub fn len(&self) -> i64 {
        self.questions.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn get(&self, index: i64) -> Option<&CachedQuestion> {
        usize::try_from(index).ok().and_then(|i| self.questions.get(i))
    }

    /// Time limits in milliseconds, in question order.
    pub fn time_limits_ms(&self) -> Vec<i64> {
        self.questions.iter().map(|q| q.question.time_limit_ms()).collect()
    }

    /// Client payload with option order shuffled per call.
    pub fn client_view<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<QuestionView> {
        self.questions
            .iter()
            .enumerate()
            .map(|(index, q)| {
                let mut options: Vec<OptionView> = q
                    .options
                    .iter()
                    .map(|o| OptionView {
                        id: o.id,
                        text: o.text.clone(),
                    })
                    .collect();
                options.shuffle(rng);
                QuestionView {
                    id: q.question.id,
                    index: index as i64,
                    text: q.question.text.clone(),
                    difficulty: q.question.difficulty,
                    time_limit_secs: q.question.time_limit_secs,
                    options,
                }
            })
            .collect()
    }
}

/// Quiz content keyed by quiz id. Content is immutable while sessions run,
/// so entries only leave through [`ContentCache::invalidate`].
#[derive(Debug, Clone, Default)]
pub struct ContentCache {
    inner: Arc<Mutex<HashMap<i64, Arc<QuizContent>>>>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, quiz_id: i64) -> Option<Arc<QuizContent>> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.get(&quiz_id).cloned()
    }

    /// Load a quiz from the cache, reading it from the database on a miss.
    pub async fn load(&self, db: &Database, quiz_id: i64) -> ApiResult<Arc<QuizContent>> {
        if let Some(content) = self.cached(quiz_id) {
            return Ok(content);
        }

        if db.get_quiz(quiz_id).await?.is_none() {
            return Err(ApiError::NotFound("Quiz"));
        }
        let questions = db.list_questions(quiz_id).await?;
        if questions.is_empty() {
            return Err(ApiError::BadRequest("quiz has no questions".into()));
        }
        let mut by_question: HashMap<i64, Vec<AnswerOption>> = HashMap::new();
        for option in db.list_options_for_quiz(quiz_id).await? {
            by_question.entry(option.question_id).or_default().push(option);
        }
        let content = Arc::new(QuizContent {
            quiz_id,
            questions: questions
                .into_iter()
                .map(|question| CachedQuestion {
                    options: by_question.remove(&question.id).unwrap_or_default(),
                    question,
                })
                .collect(),
        });

        tracing::debug!(quiz_id, questions = content.len(), "Cached quiz content");
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(quiz_id, content.clone());
        Ok(content)
    }

    pub fn invalidate(&self, quiz_id: i64) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&quiz_id);
    }
}
