use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Maximum attempts for a transaction hitting transient storage faults.
pub const MAX_TX_ATTEMPTS: u32 = 3;

/// Opens the connection pool and applies the embedded migrations. The busy
/// timeout keeps lock waits short so contention surfaces quickly.
pub async fn init_db(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(2));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Busy/locked and connection-level faults are worth another attempt;
/// everything else propagates.
pub fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
        ),
        _ => false,
    }
}

/// Exponential backoff with uniform jitter: 50ms * 2^(attempt-1) + [0, 25]ms.
pub async fn backoff(attempt: u32) {
    let base_ms = 50u64 * (1u64 << (attempt - 1));
    let jitter_ms = rand::thread_rng().gen_range(0..=25);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
}
