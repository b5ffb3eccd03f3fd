use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use actix::prelude::*;
use serde_json::Value;

use crate::observability::Observability;

/// Message enqueued on a connection's bounded send queue. Delivery beyond the
/// enqueue is the connection's responsibility.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub enum Outbound {
    Event { event: String, payload: Value },
    Error { code: String, message: String },
}

struct Entry {
    conn_id: u64,
    recipient: Recipient<Outbound>,
}

/// Registry of active duplex connections by user id. The hub holds enqueue
/// handles only and never blocks on a slow peer; sends to unknown users are
/// silently dropped.
pub struct RealtimeHub {
    connections: Mutex<HashMap<i64, Entry>>,
    observability: Arc<Observability>,
}

impl RealtimeHub {
    pub fn new(observability: Arc<Observability>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            observability,
        }
    }

    /// Overwrites any prior entry for the user; a reconnect replaces the old
    /// connection atomically.
    pub fn register(&self, user_id: i64, conn_id: u64, recipient: Recipient<Outbound>) {
        let mut connections = self.connections.lock().unwrap();
        connections.insert(user_id, Entry { conn_id, recipient });
        self.observability
            .set_websocket_active(connections.len() as u64);
    }

    /// Removes the entry only when `conn_id` still matches, so a stale
    /// connection's teardown cannot evict its replacement.
    pub fn unregister(&self, user_id: i64, conn_id: u64) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(entry) = connections.get(&user_id) {
            if entry.conn_id == conn_id {
                connections.remove(&user_id);
                self.observability
                    .set_websocket_active(connections.len() as u64);
            }
        }
    }

    pub fn send_event_to_user(&self, user_id: i64, event: &str, payload: Value) {
        let recipient = {
            let connections = self.connections.lock().unwrap();
            connections
                .get(&user_id)
                .map(|entry| entry.recipient.clone())
        };
        if let Some(recipient) = recipient {
            recipient.do_send(Outbound::Event {
                event: event.to_string(),
                payload,
            });
        }
    }

    pub fn send_error_to_user(&self, user_id: i64, code: &str, message: &str) {
        let recipient = {
            let connections = self.connections.lock().unwrap();
            connections
                .get(&user_id)
                .map(|entry| entry.recipient.clone())
        };
        if let Some(recipient) = recipient {
            recipient.do_send(Outbound::Error {
                code: code.to_string(),
                message: message.to_string(),
            });
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}
