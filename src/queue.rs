use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::game::session::SessionManager;
use crate::models::{AuthUser, ErrorReply, SessionParticipant};
use crate::realtime::RealtimeHub;

struct QueueEntry {
    user: AuthUser,
    joined_at: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    members: HashSet<i64>,
    timer_armed: bool,
}

/// FIFO matchmaking queue. A one-second recurring timer, armed on the first
/// join, expires overdue entries and then pairs the two oldest into a
/// session; join order is pairing order.
pub struct MatchQueue {
    self_ref: Weak<MatchQueue>,
    session_manager: Arc<SessionManager>,
    hub: Arc<RealtimeHub>,
    default_timeout: Duration,
    state: Mutex<QueueState>,
}

impl MatchQueue {
    pub fn new(
        session_manager: Arc<SessionManager>,
        hub: Arc<RealtimeHub>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            session_manager,
            hub,
            default_timeout,
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn join(&self, user: AuthUser, timeout: Duration) -> Result<(), ErrorReply> {
        let mut state = self.state.lock().unwrap();
        if state.members.contains(&user.user_id)
            || self.session_manager.is_user_in_session(user.user_id)
        {
            return Err(ErrorReply::new(
                "queue_duplicate",
                "already queued or in an active session",
            ));
        }
        let timeout = if timeout.is_zero() {
            self.default_timeout
        } else {
            timeout
        };
        let now = Instant::now();
        state.members.insert(user.user_id);
        state.entries.push_back(QueueEntry {
            user,
            joined_at: now,
            expires_at: now + timeout,
        });
        self.ensure_timer(&mut state);
        Ok(())
    }

    pub fn cancel(&self, user_id: i64) -> Result<(), ErrorReply> {
        let mut state = self.state.lock().unwrap();
        if !state.members.remove(&user_id) {
            return Err(ErrorReply::new("queue_not_found", "not waiting in the queue"));
        }
        state.entries.retain(|entry| entry.user.user_id != user_id);
        Ok(())
    }

    pub fn queue_length(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    fn ensure_timer(&self, state: &mut QueueState) {
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;
        let weak = self.self_ref.clone();
        actix_rt::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Some(queue) = weak.upgrade() else {
                    break;
                };
                queue.on_tick();
            }
        });
    }

    fn on_tick(&self) {
        let mut state = self.state.lock().unwrap();
        self.handle_timeouts(&mut state);
        self.pair_if_possible(&mut state);
    }

    fn handle_timeouts(&self, state: &mut QueueState) {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        state.entries.retain(|entry| {
            if entry.expires_at > now {
                true
            } else {
                timed_out.push(entry.user.user_id);
                false
            }
        });
        for user_id in timed_out {
            state.members.remove(&user_id);
            self.hub
                .send_error_to_user(user_id, "queue_timeout", "matchmaking timed out");
        }
    }

    fn pair_if_possible(&self, state: &mut QueueState) {
        loop {
            if state.entries.len() < 2 {
                return;
            }
            let (Some(first), Some(second)) =
                (state.entries.pop_front(), state.entries.pop_front())
            else {
                return;
            };
            state.members.remove(&first.user.user_id);
            state.members.remove(&second.user.user_id);
            let waited_ms = first.joined_at.elapsed().as_millis() as u64;
            let participants = vec![
                SessionParticipant {
                    user_id: first.user.user_id,
                    username: first.user.username,
                },
                SessionParticipant {
                    user_id: second.user.user_id,
                    username: second.user.username,
                },
            ];
            let session_id = self.session_manager.create_session(participants);
            log::info!(
                target: "audit",
                "{}",
                json!({"eventName": "queue.paired", "sessionId": session_id, "waitedMs": waited_ms})
            );
        }
    }
}
