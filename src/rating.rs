use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::now_iso;

pub const K_FACTOR: f64 = 32.0;
pub const INITIAL_RATING: i64 = 1000;

/// Expected score for `rating_a` against `rating_b`.
pub fn expected_score(rating_a: i64, rating_b: i64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) as f64 / 400.0))
}

/// New rating after a result with the given expected and actual score.
pub fn apply_elo(rating: i64, expected: f64, score: f64) -> i64 {
    (rating as f64 + K_FACTOR * (score - expected)).round() as i64
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RatingSummary {
    pub user_id: i64,
    pub username: String,
    pub rating: i64,
    pub wins: i64,
    pub losses: i64,
}

impl RatingSummary {
    pub fn matches(&self) -> i64 {
        self.wins + self.losses
    }
}

#[derive(Debug, Clone)]
pub struct LeaderboardPage {
    pub total: i64,
    pub entries: Vec<RatingSummary>,
}

/// Durable Elo records. The rating update itself runs inside the finalize
/// transaction; this service covers reads and the standalone upsert.
pub struct RatingService {
    pool: SqlitePool,
}

impl RatingService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Seeds the initial rating row or touches `updated_at`; a non-empty
    /// username refreshes the stored name.
    pub async fn ensure_user(&self, user_id: i64, username: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO ratings (user_id, username, rating, wins, losses, updated_at)
            VALUES (?, ?, ?, 0, 0, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username = CASE WHEN excluded.username <> '' THEN excluded.username ELSE ratings.username END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(INITIAL_RATING)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_summary(&self, user_id: i64) -> Result<Option<RatingSummary>, sqlx::Error> {
        sqlx::query_as::<_, RatingSummary>(
            "SELECT user_id, username, rating, wins, losses FROM ratings WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// `page >= 1`, `size in [1, 50]`; range checks live at the HTTP layer.
    pub async fn get_leaderboard(
        &self,
        page: u64,
        size: u64,
    ) -> Result<LeaderboardPage, sqlx::Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ratings")
            .fetch_one(&self.pool)
            .await?;
        let entries = sqlx::query_as::<_, RatingSummary>(
            r#"
            SELECT user_id, username, rating, wins, losses
            FROM ratings
            ORDER BY rating DESC, user_id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(size as i64)
        .bind(((page - 1) * size) as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(LeaderboardPage { total, entries })
    }
}
