// Quiz content: quizzes, ordered questions and their answer options.

use sqlx::SqliteConnection;

use super::{AnswerOption, Database, Question, Quiz};

/// One question of a quiz authored in a single call.
#[derive(Debug, Clone)]
pub struct NewQuestion<'a> {
    pub text: &'a str,
    pub difficulty: i64,
    pub time_limit_secs: i64,
    pub options: Vec<&'a str>,
    /// Index into `options`.
    pub correct: usize,
}

impl Database {
    pub async fn create_quiz(
        &self,
        title: &str,
        description: &str,
        now_ms: i64,
    ) -> Result<Quiz, sqlx::Error> {
        sqlx::query_as::<_, Quiz>(
            "INSERT INTO quizzes (title, description, created_at) VALUES (?, ?, ?) RETURNING id, title, description, created_at",
        )
        .bind(title)
        .bind(description)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_quiz(&self, id: i64) -> Result<Option<Quiz>, sqlx::Error> {
        sqlx::query_as::<_, Quiz>("SELECT id, title, description, created_at FROM quizzes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_quizzes(&self) -> Result<Vec<Quiz>, sqlx::Error> {
        sqlx::query_as::<_, Quiz>("SELECT id, title, description, created_at FROM quizzes ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    /// Create a quiz with all its questions, or nothing if any insert fails.
    pub async fn create_quiz_with_questions(
        &self,
        title: &str,
        description: &str,
        questions: &[NewQuestion<'_>],
        now_ms: i64,
    ) -> Result<Quiz, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let quiz = sqlx::query_as::<_, Quiz>(
            "INSERT INTO quizzes (title, description, created_at) VALUES (?, ?, ?) RETURNING id, title, description, created_at",
        )
        .bind(title)
        .bind(description)
        .bind(now_ms)
        .fetch_one(&mut *tx)
        .await?;
        for q in questions {
            insert_question(&mut *tx, quiz.id, q).await?;
        }
        tx.commit().await?;
        Ok(quiz)
    }

    /// Append a question and its options. `correct` indexes into `options`.
    pub async fn add_question(
        &self,
        quiz_id: i64,
        text: &str,
        difficulty: i64,
        time_limit_secs: i64,
        options: &[&str],
        correct: usize,
    ) -> Result<Question, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let question = NewQuestion {
            text,
            difficulty,
            time_limit_secs,
            options: options.to_vec(),
            correct,
        };
        let question = insert_question(&mut *tx, quiz_id, &question).await?;
        tx.commit().await?;
        Ok(question)
    }

    pub async fn list_questions(&self, quiz_id: i64) -> Result<Vec<Question>, sqlx::Error> {
        sqlx::query_as::<_, Question>(
            "SELECT id, quiz_id, position, text, difficulty, time_limit_secs FROM questions WHERE quiz_id = ? ORDER BY position",
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_options_for_quiz(&self, quiz_id: i64) -> Result<Vec<AnswerOption>, sqlx::Error> {
        sqlx::query_as::<_, AnswerOption>(
            "SELECT o.id, o.question_id, o.text, o.is_correct FROM answer_options o \
             JOIN questions q ON q.id = o.question_id WHERE q.quiz_id = ? ORDER BY q.position, o.id",
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await
    }
}

async fn insert_question(
    conn: &mut SqliteConnection,
    quiz_id: i64,
    q: &NewQuestion<'_>,
) -> Result<Question, sqlx::Error> {
    let question = sqlx::query_as::<_, Question>(
        "INSERT INTO questions (quiz_id, position, text, difficulty, time_limit_secs) \
         VALUES (?, (SELECT COALESCE(MAX(position), -1) + 1 FROM questions WHERE quiz_id = ?), ?, ?, ?) \
         RETURNING id, quiz_id, position, text, difficulty, time_limit_secs",
    )
    .bind(quiz_id)
    .bind(quiz_id)
    .bind(q.text)
    .bind(q.difficulty)
    .bind(q.time_limit_secs)
    .fetch_one(&mut *conn)
    .await?;

    for (i, option) in q.options.iter().enumerate() {
        sqlx::query("INSERT INTO answer_options (question_id, text, is_correct) VALUES (?, ?, ?)")
            .bind(question.id)
            .bind(*option)
            .bind(i == q.correct)
            .execute(&mut *conn)
            .await?;
    }
    Ok(question)
}
