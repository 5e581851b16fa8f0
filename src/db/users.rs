// Users, presence, bonus energy, achievements and the notification outbox.

use super::{Database, NotificationRecord, User};

const USER_COLUMNS: &str = "id, telegram_id, username, xp, bonus_energy, bonus_energy_used, bonus_energy_earned, current_quiz_id, status, created_at";

impl Database {
    // ── Users ─────────────────────────────────────────────────────────

    /// Create the user for a Telegram account, or refresh its username.
    pub async fn upsert_user(
        &self,
        telegram_id: i64,
        username: &str,
        now_ms: i64,
    ) -> Result<User, sqlx::Error> {
        let sql = format!(
            "INSERT INTO users (telegram_id, username, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(telegram_id) DO UPDATE SET username = excluded.username \
             RETURNING {USER_COLUMNS}"
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(telegram_id)
            .bind(username)
            .bind(now_ms)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Spend one bonus energy. Returns false when the balance is already zero.
    pub async fn consume_bonus_energy(&self, user_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET bonus_energy = bonus_energy - 1, bonus_energy_used = bonus_energy_used + 1 \
             WHERE id = ? AND bonus_energy > 0",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give back one bonus energy spent on a session that was never created.
    pub async fn refund_bonus_energy(&self, user_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users SET bonus_energy = bonus_energy + 1, bonus_energy_used = bonus_energy_used - 1 WHERE id = ?",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn grant_bonus_energy(&self, user_id: i64, amount: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET bonus_energy = bonus_energy + ?, bonus_energy_earned = bonus_energy_earned + ? WHERE id = ?",
        )
        .bind(amount)
        .bind(amount)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_presence(
        &self,
        user_id: i64,
        current_quiz_id: Option<i64>,
        status: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET current_quiz_id = ?, status = ? WHERE id = ?")
            .bind(current_quiz_id)
            .bind(status)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Achievements ──────────────────────────────────────────────────

    /// Store each key not yet unlocked; returns only the newly stored ones.
    pub async fn unlock_achievements(
        &self,
        user_id: i64,
        keys: &[&str],
        now_ms: i64,
    ) -> Result<Vec<String>, sqlx::Error> {
        let mut unlocked = Vec::new();
        for key in keys {
            let result = sqlx::query(
                "INSERT INTO user_achievements (user_id, key, unlocked_at) VALUES (?, ?, ?) \
                 ON CONFLICT(user_id, key) DO NOTHING",
            )
            .bind(user_id)
            .bind(*key)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                unlocked.push(key.to_string());
            }
        }
        Ok(unlocked)
    }

    pub async fn list_achievements(&self, user_id: i64) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT key FROM user_achievements WHERE user_id = ? ORDER BY unlocked_at, key",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    // ── Notification outbox ───────────────────────────────────────────

    pub async fn insert_notification(
        &self,
        user_id: i64,
        kind: &str,
        payload: &str,
        now_ms: i64,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO notifications (user_id, kind, payload, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(kind)
        .bind(payload)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list_notifications(
        &self,
        user_id: i64,
    ) -> Result<Vec<NotificationRecord>, sqlx::Error> {
        sqlx::query_as::<_, NotificationRecord>(
            "SELECT id, user_id, kind, payload, created_at FROM notifications WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }
}
