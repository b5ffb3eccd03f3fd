use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::{json, Value};

use crate::auth::AuthService;
use crate::config::AppConfig;
use crate::game::session::SessionManager;
use crate::handlers::http::bearer_token;
use crate::models::{
    error_envelope, now_iso, ws_error_frame, ws_event_frame, AuthUser, SessionInput,
};
use crate::observability::Observability;
use crate::realtime::{Outbound, RealtimeHub};
use crate::reconnect::ReconnectService;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const SNAPSHOT_VERSION: i64 = 1;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Message)]
#[rtype(result = "()")]
struct WriteNext;

/// One authenticated duplex peer. Outbound messages pass through a bounded
/// send queue drained one message at a time; exceeding either queue limit
/// empties the queue and closes the connection with a policy error.
pub struct WsSession {
    conn_id: u64,
    user: AuthUser,
    hb: Instant,
    resume_token: String,
    snapshot: Value,
    send_queue: VecDeque<String>,
    queued_bytes: usize,
    writing: bool,
    closing: bool,
    max_queue_messages: usize,
    max_queue_bytes: usize,
    hub: Arc<RealtimeHub>,
    reconnect: Arc<ReconnectService>,
    session_manager: Arc<SessionManager>,
}

impl WsSession {
    pub fn new(
        user: AuthUser,
        hub: Arc<RealtimeHub>,
        reconnect: Arc<ReconnectService>,
        session_manager: Arc<SessionManager>,
        max_queue_messages: usize,
        max_queue_bytes: usize,
    ) -> Self {
        Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            user,
            hb: Instant::now(),
            resume_token: String::new(),
            snapshot: Value::Null,
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            writing: false,
            closing: false,
            max_queue_messages,
            max_queue_bytes,
            hub,
            reconnect,
            session_manager,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn build_snapshot(&self) -> Value {
        json!({
            "version": SNAPSHOT_VERSION,
            "state": "auth_only",
            "issuedAt": now_iso(),
            "user": {"userId": self.user.user_id, "username": self.user.username},
        })
    }

    fn enqueue(&mut self, ctx: &mut ws::WebsocketContext<Self>, message: String) {
        if self.closing {
            return;
        }
        if self.send_queue.len() >= self.max_queue_messages
            || self.queued_bytes + message.len() > self.max_queue_bytes
        {
            self.trigger_backpressure_close(ctx);
            return;
        }
        self.queued_bytes += message.len();
        self.send_queue.push_back(message);
        if !self.writing {
            self.writing = true;
            ctx.notify(WriteNext);
        }
    }

    fn trigger_backpressure_close(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.send_queue.clear();
        self.queued_bytes = 0;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Policy,
            description: Some("backpressure_exceeded".to_string()),
        }));
        ctx.stop();
    }

    fn send_event(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        event: &str,
        seq: u64,
        payload: Value,
    ) {
        let frame = ws_event_frame(event, seq, payload);
        self.enqueue(ctx, frame);
    }

    fn send_error(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        code: &str,
        message: &str,
        seq: u64,
    ) {
        let frame = ws_error_frame(code, message, seq);
        self.enqueue(ctx, frame);
    }

    fn handle_text(&mut self, ctx: &mut ws::WebsocketContext<Self>, text: &str) {
        let Ok(message) = serde_json::from_str::<Value>(text) else {
            self.send_error(ctx, "bad_request", "invalid JSON frame", 0);
            return;
        };
        let seq = message.get("seq").and_then(Value::as_u64).unwrap_or(0);
        if message.get("t").and_then(Value::as_str) != Some("event") {
            self.send_error(ctx, "bad_request", "unknown message type", seq);
            return;
        }
        let Some(event) = message.get("event").and_then(Value::as_str) else {
            self.send_error(ctx, "bad_request", "missing event name", seq);
            return;
        };
        let payload = message.get("p");
        match event {
            "echo" => self.handle_echo(ctx, payload, seq),
            "resync_request" => self.handle_resync(ctx, payload, seq),
            "session.input" => self.handle_session_input(ctx, payload, seq),
            _ => self.send_error(ctx, "bad_request", "unknown event", seq),
        }
    }

    fn handle_echo(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        payload: Option<&Value>,
        seq: u64,
    ) {
        let Some(payload) = payload.filter(|p| p.is_object()) else {
            self.send_error(ctx, "bad_request", "payload must be an object", seq);
            return;
        };
        if !payload.get("message").is_some_and(Value::is_string) {
            self.send_error(ctx, "bad_request", "message field is required", seq);
            return;
        }
        let mut reply = payload.clone();
        reply["userId"] = json!(self.user.user_id);
        self.send_event(ctx, "echo", seq, reply);
    }

    fn handle_resync(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        payload: Option<&Value>,
        seq: u64,
    ) {
        let token = payload
            .and_then(|p| p.get("resumeToken"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(token) = token else {
            self.send_error(ctx, "invalid_resume_token", "resumeToken is required", seq);
            return;
        };
        if self.reconnect.validate(&token, self.user.user_id).is_none() {
            self.send_error(
                ctx,
                "invalid_resume_token",
                "resume token is not valid for this user",
                seq,
            );
            return;
        }
        self.snapshot = self.build_snapshot();
        self.resume_token = self.reconnect.issue_token(
            &self.user,
            SNAPSHOT_VERSION,
            self.snapshot.clone(),
            Some(&token),
        );
        self.send_event(
            ctx,
            "resync_state",
            seq,
            json!({"resumeToken": self.resume_token, "snapshot": self.snapshot}),
        );
    }

    fn handle_session_input(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        payload: Option<&Value>,
        seq: u64,
    ) {
        let Some(payload) = payload.filter(|p| p.is_object()) else {
            self.send_error(ctx, "bad_request", "payload must be an object", seq);
            return;
        };
        let session_id = payload.get("sessionId").and_then(Value::as_str);
        let sequence = payload.get("sequence").and_then(Value::as_u64);
        let target_tick = payload.get("targetTick").and_then(Value::as_i64);
        let delta = payload.get("delta").and_then(Value::as_i64);
        let (Some(session_id), Some(sequence), Some(target_tick), Some(delta)) =
            (session_id, sequence, target_tick, delta)
        else {
            self.send_error(
                ctx,
                "bad_request",
                "sessionId, sequence, targetTick and delta are required",
                seq,
            );
            return;
        };
        let input = SessionInput {
            session_id: session_id.to_string(),
            user_id: self.user.user_id,
            sequence,
            target_tick,
            delta,
        };
        let manager = self.session_manager.clone();
        let fut = async move { manager.submit_input(input).await };
        ctx.spawn(fut.into_actor(self).map(move |result, act, ctx| {
            if let Err(reply) = result {
                act.send_error(ctx, &reply.code, &reply.message, seq);
            }
        }));
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
        self.snapshot = self.build_snapshot();
        self.resume_token =
            self.reconnect
                .issue_token(&self.user, SNAPSHOT_VERSION, self.snapshot.clone(), None);
        self.hub
            .register(self.user.user_id, self.conn_id, ctx.address().recipient());
        let payload = json!({
            "userId": self.user.user_id,
            "username": self.user.username,
            "resumeToken": self.resume_token,
            "snapshotVersion": SNAPSHOT_VERSION,
        });
        self.send_event(ctx, "auth_state", 0, payload);
        log::info!(
            target: "audit",
            "{}",
            json!({"eventName": "ws.connected", "userId": self.user.user_id})
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.hub.unregister(self.user.user_id, self.conn_id);
    }
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        let frame = match msg {
            Outbound::Event { event, payload } => ws_event_frame(&event, 0, payload),
            Outbound::Error { code, message } => ws_error_frame(&code, &message, 0),
        };
        self.enqueue(ctx, frame);
    }
}

impl Handler<WriteNext> for WsSession {
    type Result = ();

    fn handle(&mut self, _msg: WriteNext, ctx: &mut Self::Context) {
        if self.closing {
            return;
        }
        if let Some(front) = self.send_queue.pop_front() {
            self.queued_bytes -= front.len();
            ctx.text(front);
        }
        if self.send_queue.is_empty() {
            self.writing = false;
        } else {
            ctx.notify(WriteNext);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                if !self.closing {
                    self.handle_text(ctx, &text);
                }
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(_) => ctx.stop(),
            _ => {}
        }
    }
}

/// Upgrade endpoint. The bearer token authenticates the upgrade itself.
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    config: web::Data<AppConfig>,
    auth: web::Data<AuthService>,
    hub: web::Data<RealtimeHub>,
    reconnect: web::Data<ReconnectService>,
    session_manager: web::Data<SessionManager>,
    observability: web::Data<Observability>,
) -> Result<HttpResponse, Error> {
    observability.increment_request();
    let session = bearer_token(&req).and_then(|token| auth.validate_token(&token));
    let Some(session) = session else {
        observability.increment_error();
        return Ok(HttpResponse::Unauthorized()
            .content_type("application/json; charset=utf-8")
            .body(
                error_envelope("unauthorized", "authentication required for websocket upgrade")
                    .to_string(),
            ));
    };

    let ws_session = WsSession::new(
        session.user,
        hub.into_inner(),
        reconnect.into_inner(),
        session_manager.into_inner(),
        config.ws_queue_limit_messages,
        config.ws_queue_limit_bytes,
    );
    ws::start(ws_session, &req, stream)
}
