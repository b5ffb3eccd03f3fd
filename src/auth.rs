use std::collections::HashMap;
use std::sync::Mutex;

use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use crate::models::{AuthSession, AuthUser, ErrorReply};

const SALT_BYTES: usize = 16;
const TOKEN_BYTES: usize = 32;

fn random_hex(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buffer);
    buffer.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..(i + 2).min(hex.len())], 16).unwrap_or(0))
        .collect()
}

fn hash_password(password: &str, salt_hex: &str) -> String {
    let salt = hex_decode(salt_hex);
    let mut output = [0u8; 32];
    // Argon2id with the library defaults; fails only on out-of-range
    // parameter sizes, which a 16-byte salt cannot hit.
    if Argon2::default()
        .hash_password_into(password.as_bytes(), &salt, &mut output)
        .is_err()
    {
        return String::new();
    }
    output.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Fixed-window counter per key (the login path keys by client IP).
pub struct RateLimiter {
    max_attempts: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    count: usize,
    window_start: DateTime<Utc>,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window_seconds: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::seconds(window_seconds as i64),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
        });
        if now - bucket.window_start > self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        if bucket.count >= self.max_attempts {
            return false;
        }
        bucket.count += 1;
        true
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token_ttl_seconds: u64,
    pub login_window_seconds: u64,
    pub login_max_attempts: usize,
}

struct UserRecord {
    id: i64,
    username: String,
    salt_hex: String,
    hash_hex: String,
}

struct AuthState {
    next_user_id: i64,
    users: HashMap<String, UserRecord>,
    sessions: HashMap<String, AuthSession>,
}

/// In-memory credential and bearer-token store with a login rate limit.
pub struct AuthService {
    config: AuthConfig,
    state: Mutex<AuthState>,
    rate_limiter: RateLimiter,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        let rate_limiter =
            RateLimiter::new(config.login_max_attempts, config.login_window_seconds);
        Self {
            config,
            state: Mutex::new(AuthState {
                next_user_id: 1,
                users: HashMap::new(),
                sessions: HashMap::new(),
            }),
            rate_limiter,
        }
    }

    pub fn register_user(&self, username: &str, password: &str) -> Result<AuthUser, ErrorReply> {
        if username.is_empty() || password.is_empty() {
            return Err(ErrorReply::new(
                "bad_request",
                "username and password are required",
            ));
        }
        let mut state = self.state.lock().unwrap();
        if state.users.contains_key(username) {
            return Err(ErrorReply::new("duplicate_user", "username already taken"));
        }
        let id = state.next_user_id;
        state.next_user_id += 1;
        let salt_hex = random_hex(SALT_BYTES);
        let hash_hex = hash_password(password, &salt_hex);
        state.users.insert(
            username.to_string(),
            UserRecord {
                id,
                username: username.to_string(),
                salt_hex,
                hash_hex,
            },
        );
        Ok(AuthUser {
            user_id: id,
            username: username.to_string(),
        })
    }

    pub fn login(
        &self,
        username: &str,
        password: &str,
        ip: &str,
    ) -> Result<AuthSession, ErrorReply> {
        let now = Utc::now();
        if !self.rate_limiter.allow(ip, now) {
            return Err(ErrorReply::new("rate_limited", "too many login attempts"));
        }

        let mut state = self.state.lock().unwrap();
        let user = match state.users.get(username) {
            Some(record) if hash_password(password, &record.salt_hex) == record.hash_hex => {
                AuthUser {
                    user_id: record.id,
                    username: record.username.clone(),
                }
            }
            _ => return Err(ErrorReply::new("unauthorized", "invalid credentials")),
        };

        state.sessions.retain(|_, session| session.expires_at > now);
        let session = AuthSession {
            token: random_hex(TOKEN_BYTES),
            user,
            expires_at: now + Duration::seconds(self.config.token_ttl_seconds as i64),
        };
        state
            .sessions
            .insert(session.token.clone(), session.clone());
        Ok(session)
    }

    pub fn logout(&self, token: &str) -> bool {
        self.state.lock().unwrap().sessions.remove(token).is_some()
    }

    pub fn validate_token(&self, token: &str) -> Option<AuthSession> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        match state.sessions.get(token) {
            Some(session) if session.expires_at > now => Some(session.clone()),
            Some(_) => {
                state.sessions.remove(token);
                None
            }
            None => None,
        }
    }
}
