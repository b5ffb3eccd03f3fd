use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::db::{backoff, is_retryable, MAX_TX_ATTEMPTS};
use crate::models::{now_iso, SessionParticipant};
use crate::rating::{apply_elo, expected_score, INITIAL_RATING};

#[derive(Debug, Clone)]
pub struct MatchResultRecord {
    pub match_id: String,
    pub user1_id: i64,
    pub user2_id: i64,
    pub winner_user_id: i64,
    pub tick_count: i64,
    pub ended_at: String,
    pub snapshot: Value,
}

/// Writes the match result and applies Elo in one transaction. Duplicate
/// protection is carried by the schema, not by in-memory coordination: the
/// result insert is keyed by match id, and the `rating_applies` guard rows
/// make the Elo update apply at most once per (match, user) even if two
/// finalize calls interleave. A constraint hit is treated as a successful
/// no-op.
pub struct ResultService {
    pool: SqlitePool,
}

impl ResultService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn finalize_result(
        &self,
        record: &MatchResultRecord,
        participants: &[SessionParticipant],
    ) -> Result<bool, sqlx::Error> {
        let mut attempt = 1;
        loop {
            match self.try_finalize(record, participants).await {
                Ok(applied) => return Ok(applied),
                Err(err) if is_retryable(&err) && attempt < MAX_TX_ATTEMPTS => {
                    log::warn!(
                        "retrying finalize for {} after transient storage fault: {}",
                        record.match_id,
                        err
                    );
                    backoff(attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_finalize(
        &self,
        record: &MatchResultRecord,
        participants: &[SessionParticipant],
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO match_results
                (match_id, user1_id, user2_id, winner_user_id, tick_count, ended_at, snapshot)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.match_id)
        .bind(record.user1_id)
        .bind(record.user2_id)
        .bind(record.winner_user_id)
        .bind(record.tick_count)
        .bind(&record.ended_at)
        .bind(record.snapshot.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if !inserted {
            // A prior attempt already persisted this match.
            tx.commit().await?;
            return Ok(true);
        }

        for participant in participants {
            Self::ensure_user_in_tx(&mut tx, participant.user_id, &participant.username).await?;
        }
        Self::ensure_user_in_tx(&mut tx, record.user1_id, "").await?;
        Self::ensure_user_in_tx(&mut tx, record.user2_id, "").await?;

        let loser_id = if record.winner_user_id == record.user1_id {
            record.user2_id
        } else {
            record.user1_id
        };
        let winner_guard =
            Self::insert_rating_guard(&mut tx, &record.match_id, record.winner_user_id).await?;
        let loser_guard = Self::insert_rating_guard(&mut tx, &record.match_id, loser_id).await?;
        if !(winner_guard && loser_guard) {
            tx.commit().await?;
            return Ok(true);
        }

        let winner_rating = Self::rating_of(&mut tx, record.winner_user_id).await?;
        let loser_rating = Self::rating_of(&mut tx, loser_id).await?;
        let expected_winner = expected_score(winner_rating, loser_rating);
        let expected_loser = expected_score(loser_rating, winner_rating);
        let next_winner = apply_elo(winner_rating, expected_winner, 1.0);
        let next_loser = apply_elo(loser_rating, expected_loser, 0.0);

        sqlx::query("UPDATE ratings SET rating = ?, wins = wins + 1, updated_at = ? WHERE user_id = ?")
            .bind(next_winner)
            .bind(now_iso())
            .bind(record.winner_user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE ratings SET rating = ?, losses = losses + 1, updated_at = ? WHERE user_id = ?",
        )
        .bind(next_loser)
        .bind(now_iso())
        .bind(loser_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn ensure_user_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: i64,
        username: &str,
    ) -> Result<(), sqlx::Error> {
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
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_rating_guard(
        tx: &mut Transaction<'_, Sqlite>,
        match_id: &str,
        user_id: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO rating_applies (match_id, user_id, applied_at) VALUES (?, ?, ?)",
        )
        .bind(match_id)
        .bind(user_id)
        .bind(now_iso())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rating_of(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: i64,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT rating FROM ratings WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM match_results")
            .fetch_one(&self.pool)
            .await
    }
}
