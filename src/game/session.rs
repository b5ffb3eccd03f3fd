use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use actix::prelude::*;
use serde_json::{json, Value};

use crate::game::simulation::{InputCommand, Simulation};
use crate::models::{now_iso, ErrorReply, SessionInput, SessionParticipant};
use crate::realtime::RealtimeHub;
use crate::results::{MatchResultRecord, ResultService};

#[derive(Message)]
#[rtype(result = "Result<(), ErrorReply>")]
struct ApplyInput(SessionInput);

/// Registry of running sessions. Each session is an actor whose mailbox is
/// the serial executor for that session's simulation and tick timer; the
/// registry mutex only guards the two lookup maps and is never held across a
/// mailbox round-trip.
pub struct SessionManager {
    self_ref: Weak<SessionManager>,
    hub: Arc<RealtimeHub>,
    result_service: Arc<ResultService>,
    tick_interval: Duration,
    max_ticks: usize,
    next_session_id: AtomicU64,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Addr<SessionActor>>,
    user_to_session: HashMap<i64, String>,
}

impl SessionManager {
    pub fn new(
        hub: Arc<RealtimeHub>,
        result_service: Arc<ResultService>,
        tick_interval: Duration,
        max_ticks: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            hub,
            result_service,
            tick_interval,
            max_ticks,
            next_session_id: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn create_session(&self, participants: Vec<SessionParticipant>) -> String {
        let id = format!(
            "session-{}",
            self.next_session_id.fetch_add(1, Ordering::Relaxed)
        );
        let mut simulation = Simulation::default();
        for participant in &participants {
            simulation.add_player(participant.user_id);
        }
        let actor = SessionActor {
            id: id.clone(),
            participant_ids: participants.iter().map(|p| p.user_id).collect(),
            participants,
            simulation,
            tick_sent: 0,
            ended: false,
            tick_interval: self.tick_interval,
            max_ticks: self.max_ticks,
            hub: self.hub.clone(),
            result_service: self.result_service.clone(),
            manager: self.self_ref.clone(),
        };

        let participant_ids: Vec<i64> = actor.participant_ids.iter().copied().collect();
        let addr = actor.start();
        let mut registry = self.registry.lock().unwrap();
        for user_id in participant_ids {
            registry.user_to_session.insert(user_id, id.clone());
        }
        registry.sessions.insert(id.clone(), addr);
        id
    }

    pub fn is_user_in_session(&self, user_id: i64) -> bool {
        self.registry
            .lock()
            .unwrap()
            .user_to_session
            .contains_key(&user_id)
    }

    /// Dispatches validation-and-apply onto the session's mailbox and waits
    /// for completion, so `Ok(())` means the command is queued and observable
    /// to the next tick.
    pub async fn submit_input(&self, input: SessionInput) -> Result<(), ErrorReply> {
        let addr = {
            let registry = self.registry.lock().unwrap();
            registry
                .user_to_session
                .get(&input.user_id)
                .and_then(|session_id| registry.sessions.get(session_id))
                .cloned()
        };
        let Some(addr) = addr else {
            return Err(ErrorReply::new(
                "session_not_found",
                "no active session for this user",
            ));
        };
        match addr.send(ApplyInput(input)).await {
            Ok(result) => result,
            Err(_) => Err(ErrorReply::new("session_closed", "session already ended")),
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.registry.lock().unwrap().sessions.len()
    }

    fn remove_session(&self, session_id: &str, participants: &[SessionParticipant]) {
        let mut registry = self.registry.lock().unwrap();
        registry.sessions.remove(session_id);
        for participant in participants {
            if registry
                .user_to_session
                .get(&participant.user_id)
                .map(String::as_str)
                == Some(session_id)
            {
                registry.user_to_session.remove(&participant.user_id);
            }
        }
    }
}

/// One running match. State transitions one way: created, started, ticking,
/// ended. Once `ended` no input is accepted and no tick is scheduled.
struct SessionActor {
    id: String,
    participants: Vec<SessionParticipant>,
    participant_ids: HashSet<i64>,
    simulation: Simulation,
    tick_sent: usize,
    ended: bool,
    tick_interval: Duration,
    max_ticks: usize,
    hub: Arc<RealtimeHub>,
    result_service: Arc<ResultService>,
    manager: Weak<SessionManager>,
}

impl Actor for SessionActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let participants: Vec<Value> = self
            .participants
            .iter()
            .map(|p| json!({"userId": p.user_id, "username": p.username}))
            .collect();
        self.broadcast(
            "session.created",
            json!({
                "sessionId": self.id,
                "createdAt": now_iso(),
                "participants": participants,
            }),
        );
        self.broadcast(
            "session.started",
            json!({
                "sessionId": self.id,
                "tick": 0,
                "tickIntervalMs": self.tick_interval.as_millis() as u64,
                "state": self.simulation.snapshot(),
            }),
        );
        log::info!(
            target: "audit",
            "{}",
            json!({"eventName": "session.started", "sessionId": self.id})
        );
        self.schedule_tick(ctx);
    }
}

impl SessionActor {
    fn broadcast(&self, event: &str, payload: Value) {
        for participant in &self.participants {
            self.hub
                .send_event_to_user(participant.user_id, event, payload.clone());
        }
    }

    fn schedule_tick(&self, ctx: &mut Context<Self>) {
        ctx.run_later(self.tick_interval, |act, ctx| act.handle_tick(ctx));
    }

    fn handle_tick(&mut self, ctx: &mut Context<Self>) {
        if self.ended {
            return;
        }
        self.simulation.tick_once();
        self.tick_sent += 1;
        let snapshot = self.simulation.snapshot();
        self.broadcast(
            "session.state",
            json!({
                "sessionId": self.id,
                "tick": snapshot["tick"],
                "players": snapshot["players"],
                "issuedAt": now_iso(),
            }),
        );
        if self.tick_sent >= self.max_ticks {
            self.finish(ctx);
        } else {
            self.schedule_tick(ctx);
        }
    }

    fn finish(&mut self, ctx: &mut Context<Self>) {
        if self.ended {
            return;
        }
        self.ended = true;

        // Snapshot players are sorted by user id, so on equal positions the
        // lower user id wins.
        let snapshot = self.simulation.snapshot();
        let mut winner_user_id = 0i64;
        let mut best_position = i64::MIN;
        for player in snapshot["players"].as_array().into_iter().flatten() {
            let position = player["position"].as_i64().unwrap_or(0);
            let user_id = player["userId"].as_i64().unwrap_or(0);
            if position > best_position {
                best_position = position;
                winner_user_id = user_id;
            }
        }
        let ticks = snapshot["tick"].as_i64().unwrap_or(0);

        self.broadcast(
            "session.ended",
            json!({
                "sessionId": self.id,
                "reason": "completed",
                "result": {"winnerUserId": winner_user_id, "ticks": ticks},
            }),
        );
        log::info!(
            target: "audit",
            "{}",
            json!({
                "eventName": "session.ended",
                "sessionId": self.id,
                "winnerUserId": winner_user_id,
                "ticks": ticks,
            })
        );

        let record = MatchResultRecord {
            match_id: self.id.clone(),
            user1_id: self.participants[0].user_id,
            user2_id: self.participants[1].user_id,
            winner_user_id,
            tick_count: ticks,
            ended_at: now_iso(),
            snapshot,
        };
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_session(&self.id, &self.participants);
        }
        let service = self.result_service.clone();
        let participants = self.participants.clone();
        actix_rt::spawn(async move {
            if let Err(err) = service.finalize_result(&record, &participants).await {
                log::error!("finalize failed for {}: {}", record.match_id, err);
            }
        });
        ctx.stop();
    }
}

impl Handler<ApplyInput> for SessionActor {
    type Result = Result<(), ErrorReply>;

    fn handle(&mut self, msg: ApplyInput, _ctx: &mut Self::Context) -> Self::Result {
        if self.ended {
            return Err(ErrorReply::new("session_closed", "session already ended"));
        }
        let input = msg.0;
        if !self.participant_ids.contains(&input.user_id) {
            return Err(ErrorReply::new(
                "not_participant",
                "user is not a participant of this session",
            ));
        }
        let command = InputCommand {
            user_id: input.user_id,
            target_tick: input.target_tick,
            delta: input.delta,
            sequence: input.sequence,
        };
        self.simulation
            .enqueue_input(command)
            .map_err(|reason| ErrorReply::new("input_invalid", reason.as_str()))
    }
}
