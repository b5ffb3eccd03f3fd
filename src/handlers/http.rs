use std::collections::HashMap;
use std::time::{Duration, Instant};

use actix_web::http::header::AUTHORIZATION;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde_json::{json, Value};

use crate::auth::AuthService;
use crate::config::AppConfig;
use crate::game::session::SessionManager;
use crate::models::{
    error_envelope, format_iso, success_envelope, AuthSession, CredentialsRequest,
    QueueJoinRequest,
};
use crate::observability::Observability;
use crate::queue::MatchQueue;
use crate::rating::RatingService;

pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn authenticate(req: &HttpRequest, auth: &AuthService) -> Option<AuthSession> {
    bearer_token(req).and_then(|token| auth.validate_token(&token))
}

/// Per-request counters, trace id, and the audit line written when the
/// response is built.
struct RequestScope {
    observability: web::Data<Observability>,
    trace_id: String,
    target: String,
    started: Instant,
}

impl RequestScope {
    fn begin(observability: &web::Data<Observability>, req: &HttpRequest) -> Self {
        observability.increment_request();
        Self {
            observability: observability.clone(),
            trace_id: observability.next_trace_id(),
            target: req.path().to_string(),
            started: Instant::now(),
        }
    }

    fn finish(self, status: StatusCode, body: Value) -> HttpResponse {
        if status.is_client_error() || status.is_server_error() {
            self.observability.increment_error();
        }
        self.observability.log_request(
            &self.trace_id,
            &self.target,
            status.as_u16(),
            self.started.elapsed().as_millis() as i64,
        );
        HttpResponse::build(status)
            .content_type("application/json; charset=utf-8")
            .body(body.to_string())
    }

    fn error(self, status: StatusCode, code: &str, message: &str) -> HttpResponse {
        self.finish(status, error_envelope(code, message))
    }

    fn storage_error(self, err: sqlx::Error) -> HttpResponse {
        log::error!("storage failure on {}: {}", self.target, err);
        self.error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "storage failure",
        )
    }
}

fn remote_ip(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn health(req: HttpRequest, observability: web::Data<Observability>) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let data = json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")});
    scope.finish(StatusCode::OK, success_envelope(data))
}

pub async fn metrics(
    req: HttpRequest,
    observability: web::Data<Observability>,
    session_manager: web::Data<SessionManager>,
    match_queue: web::Data<MatchQueue>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let snapshot = observability.snapshot(
        session_manager.active_session_count() as u64,
        match_queue.queue_length() as u64,
    );
    let data = json!({
        "requests": {"total": snapshot.request_total, "errors": snapshot.request_errors},
        "connections": {"websocket": snapshot.websocket_active},
        "sessions": {"active": snapshot.active_sessions},
        "queue": {"length": snapshot.queue_length},
    });
    scope.finish(StatusCode::OK, success_envelope(data))
}

pub async fn ops_status(
    req: HttpRequest,
    config: web::Data<AppConfig>,
    observability: web::Data<Observability>,
    session_manager: web::Data<SessionManager>,
    match_queue: web::Data<MatchQueue>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let header_token = req
        .headers()
        .get("X-Ops-Token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if config.ops_token.is_empty() || header_token != config.ops_token {
        return scope.error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid ops token");
    }
    let snapshot = observability.snapshot(
        session_manager.active_session_count() as u64,
        match_queue.queue_length() as u64,
    );
    let data = json!({
        "activeSessions": snapshot.active_sessions,
        "queueLength": snapshot.queue_length,
        "activeWebsocket": snapshot.websocket_active,
        "errorCount": snapshot.request_errors,
    });
    scope.finish(StatusCode::OK, success_envelope(data))
}

pub async fn register(
    req: HttpRequest,
    body: web::Bytes,
    auth: web::Data<AuthService>,
    rating: web::Data<RatingService>,
    observability: web::Data<Observability>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let Ok(request) = serde_json::from_slice::<CredentialsRequest>(&body) else {
        return scope.error(StatusCode::BAD_REQUEST, "bad_request", "invalid JSON body");
    };
    let user = match auth.register_user(&request.username, &request.password) {
        Ok(user) => user,
        Err(reply) => {
            let status = if reply.code == "bad_request" {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::CONFLICT
            };
            return scope.error(status, &reply.code, &reply.message);
        }
    };
    if let Err(err) = rating.ensure_user(user.user_id, &user.username).await {
        return scope.storage_error(err);
    }
    let data = json!({"userId": user.user_id, "username": user.username});
    scope.finish(StatusCode::CREATED, success_envelope(data))
}

pub async fn login(
    req: HttpRequest,
    body: web::Bytes,
    auth: web::Data<AuthService>,
    rating: web::Data<RatingService>,
    observability: web::Data<Observability>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let Ok(request) = serde_json::from_slice::<CredentialsRequest>(&body) else {
        return scope.error(StatusCode::BAD_REQUEST, "bad_request", "invalid JSON body");
    };
    let session = match auth.login(&request.username, &request.password, &remote_ip(&req)) {
        Ok(session) => session,
        Err(reply) => {
            let status = if reply.code == "rate_limited" {
                StatusCode::TOO_MANY_REQUESTS
            } else {
                StatusCode::UNAUTHORIZED
            };
            return scope.error(status, &reply.code, &reply.message);
        }
    };
    if let Err(err) = rating
        .ensure_user(session.user.user_id, &session.user.username)
        .await
    {
        return scope.storage_error(err);
    }
    let data = json!({
        "token": session.token,
        "expiresAt": format_iso(&session.expires_at),
        "user": {"userId": session.user.user_id, "username": session.user.username},
    });
    scope.finish(StatusCode::OK, success_envelope(data))
}

pub async fn logout(
    req: HttpRequest,
    auth: web::Data<AuthService>,
    observability: web::Data<Observability>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let Some(session) = authenticate(&req, &auth) else {
        return scope.error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authentication required",
        );
    };
    auth.logout(&session.token);
    scope.finish(StatusCode::OK, success_envelope(json!({"loggedOut": true})))
}

pub async fn queue_join(
    req: HttpRequest,
    body: web::Bytes,
    auth: web::Data<AuthService>,
    config: web::Data<AppConfig>,
    match_queue: web::Data<MatchQueue>,
    observability: web::Data<Observability>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let Some(session) = authenticate(&req, &auth) else {
        return scope.error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authentication required",
        );
    };
    let Ok(request) = serde_json::from_slice::<QueueJoinRequest>(&body) else {
        return scope.error(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "mode or timeoutSeconds is invalid",
        );
    };
    if request.mode != "normal" {
        return scope.error(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "mode or timeoutSeconds is invalid",
        );
    }
    let timeout = Duration::from_secs(
        request
            .timeout_seconds
            .unwrap_or(config.match_queue_timeout_seconds),
    );
    let timeout = if timeout.is_zero() {
        config.default_queue_timeout()
    } else {
        timeout
    };
    if let Err(reply) = match_queue.join(session.user, timeout) {
        let status = if reply.code == "queue_duplicate" {
            StatusCode::CONFLICT
        } else {
            StatusCode::BAD_REQUEST
        };
        return scope.error(status, &reply.code, &reply.message);
    }
    let expires_at = Utc::now() + chrono::Duration::seconds(timeout.as_secs() as i64);
    let data = json!({
        "queued": true,
        "mode": request.mode,
        "expiresAt": format_iso(&expires_at),
    });
    scope.finish(StatusCode::OK, success_envelope(data))
}

pub async fn queue_cancel(
    req: HttpRequest,
    auth: web::Data<AuthService>,
    match_queue: web::Data<MatchQueue>,
    observability: web::Data<Observability>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let Some(session) = authenticate(&req, &auth) else {
        return scope.error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authentication required",
        );
    };
    if let Err(reply) = match_queue.cancel(session.user.user_id) {
        return scope.error(StatusCode::NOT_FOUND, &reply.code, &reply.message);
    }
    scope.finish(StatusCode::OK, success_envelope(json!({"canceled": true})))
}

pub async fn leaderboard(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    rating: web::Data<RatingService>,
    observability: web::Data<Observability>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);

    let parse_param = |key: &str, default: u64, min: u64, max: u64| -> Option<u64> {
        match query.get(key) {
            None => Some(default),
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|value| (min..=max).contains(value)),
        }
    };
    let page = parse_param("page", 1, 1, u64::MAX);
    let size = parse_param("size", 10, 1, 50);
    let (Some(page), Some(size)) = (page, size) else {
        return scope.error(
            StatusCode::BAD_REQUEST,
            "leaderboard_range",
            "page or size is out of range",
        );
    };

    let page_data = match rating.get_leaderboard(page, size).await {
        Ok(page_data) => page_data,
        Err(err) => return scope.storage_error(err),
    };
    let entries: Vec<Value> = page_data
        .entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            json!({
                "rank": (page - 1) * size + i as u64 + 1,
                "userId": entry.user_id,
                "username": entry.username,
                "rating": entry.rating,
                "wins": entry.wins,
                "losses": entry.losses,
                "matches": entry.matches(),
            })
        })
        .collect();
    let data = json!({
        "page": page,
        "size": size,
        "total": page_data.total,
        "entries": entries,
    });
    scope.finish(StatusCode::OK, success_envelope(data))
}

pub async fn profile(
    req: HttpRequest,
    auth: web::Data<AuthService>,
    rating: web::Data<RatingService>,
    observability: web::Data<Observability>,
) -> HttpResponse {
    let scope = RequestScope::begin(&observability, &req);
    let Some(session) = authenticate(&req, &auth) else {
        return scope.error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authentication required",
        );
    };
    let summary = match rating.get_summary(session.user.user_id).await {
        Ok(summary) => summary,
        Err(err) => return scope.storage_error(err),
    };
    let (rating_value, wins, losses) = summary
        .map(|s| (s.rating, s.wins, s.losses))
        .unwrap_or((crate::rating::INITIAL_RATING, 0, 0));
    let data = json!({
        "userId": session.user.user_id,
        "username": session.user.username,
        "rating": rating_value,
        "wins": wins,
        "losses": losses,
        "matches": wins + losses,
    });
    scope.finish(StatusCode::OK, success_envelope(data))
}
