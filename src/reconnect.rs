use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::Value;

use crate::models::AuthUser;

/// Snapshot bound to a resume token at issuance time.
#[derive(Debug, Clone)]
pub struct ResumeSnapshot {
    pub user: AuthUser,
    pub token: String,
    pub snapshot_version: i64,
    pub snapshot: Value,
    pub issued_at: DateTime<Utc>,
}

/// Issues opaque resume tokens and validates them against the owning user.
/// Issuing with a previous token invalidates that token first, so at most one
/// token per connection lineage is live.
#[derive(Default)]
pub struct ReconnectService {
    tokens: Mutex<HashMap<String, ResumeSnapshot>>,
}

fn generate_token() -> String {
    let mut buffer = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buffer);
    buffer.iter().map(|b| format!("{:02x}", b)).collect()
}

impl ReconnectService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue_token(
        &self,
        user: &AuthUser,
        snapshot_version: i64,
        snapshot: Value,
        previous_token: Option<&str>,
    ) -> String {
        let mut tokens = self.tokens.lock().unwrap();
        if let Some(previous) = previous_token {
            tokens.remove(previous);
        }
        let token = generate_token();
        tokens.insert(
            token.clone(),
            ResumeSnapshot {
                user: user.clone(),
                token: token.clone(),
                snapshot_version,
                snapshot,
                issued_at: Utc::now(),
            },
        );
        token
    }

    pub fn validate(&self, token: &str, user_id: i64) -> Option<ResumeSnapshot> {
        let tokens = self.tokens.lock().unwrap();
        tokens
            .get(token)
            .filter(|record| record.user.user_id == user_id)
            .cloned()
    }
}
