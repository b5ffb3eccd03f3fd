use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Value};

pub const MAX_DELTA: i64 = 3;
pub const MAX_INPUTS_PER_TICK_PER_USER: usize = 4;

/// Why an input was not admitted. Checks run in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    StaleTick,
    DeltaOutOfRange,
    SequenceRequired,
    SequenceNotMonotonic,
    TickInputLimit,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::StaleTick => "stale_tick",
            RejectReason::DeltaOutOfRange => "delta_out_of_range",
            RejectReason::SequenceRequired => "sequence_required",
            RejectReason::SequenceNotMonotonic => "sequence_not_monotonic",
            RejectReason::TickInputLimit => "tick_input_limit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputCommand {
    pub user_id: i64,
    pub target_tick: i64,
    pub delta: i64,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default)]
struct PlayerState {
    position: i64,
    last_sequence: u64,
}

#[derive(Debug, Default)]
struct UserTracker {
    last_sequence: u64,
    per_tick_count: HashMap<i64, usize>,
}

/// Deterministic tick/input model. Pure data: no I/O, no clock, no
/// concurrency. Two simulations fed the same admitted inputs produce
/// identical snapshots after the same number of ticks.
#[derive(Debug, Default)]
pub struct Simulation {
    current_tick: i64,
    inputs_by_tick: BTreeMap<i64, Vec<InputCommand>>,
    trackers: HashMap<i64, UserTracker>,
    players: BTreeMap<i64, PlayerState>,
}

impl Simulation {
    pub fn add_player(&mut self, user_id: i64) {
        self.players.entry(user_id).or_default();
    }

    pub fn enqueue_input(&mut self, input: InputCommand) -> Result<(), RejectReason> {
        self.validate(&input)?;
        let tracker = self.trackers.entry(input.user_id).or_default();
        tracker.last_sequence = input.sequence;
        *tracker.per_tick_count.entry(input.target_tick).or_insert(0) += 1;
        self.inputs_by_tick
            .entry(input.target_tick)
            .or_default()
            .push(input);
        Ok(())
    }

    fn validate(&self, input: &InputCommand) -> Result<(), RejectReason> {
        if input.target_tick <= self.current_tick {
            return Err(RejectReason::StaleTick);
        }
        if input.delta > MAX_DELTA || input.delta < -MAX_DELTA {
            return Err(RejectReason::DeltaOutOfRange);
        }
        if input.sequence == 0 {
            return Err(RejectReason::SequenceRequired);
        }
        if let Some(tracker) = self.trackers.get(&input.user_id) {
            if input.sequence <= tracker.last_sequence {
                return Err(RejectReason::SequenceNotMonotonic);
            }
            if let Some(count) = tracker.per_tick_count.get(&input.target_tick) {
                if *count >= MAX_INPUTS_PER_TICK_PER_USER {
                    return Err(RejectReason::TickInputLimit);
                }
            }
        }
        Ok(())
    }

    /// Advances one tick and applies the commands admitted for it, ordered by
    /// (sequence, user_id).
    pub fn tick_once(&mut self) {
        self.current_tick += 1;
        let Some(mut events) = self.inputs_by_tick.remove(&self.current_tick) else {
            return;
        };
        events.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.user_id.cmp(&b.user_id)));
        for event in events {
            let state = self.players.entry(event.user_id).or_default();
            state.position += event.delta;
            state.last_sequence = event.sequence;
        }
    }

    pub fn current_tick(&self) -> i64 {
        self.current_tick
    }

    /// Players sorted by user id; stable ordering so snapshots compare equal
    /// across runs.
    pub fn snapshot(&self) -> Value {
        let players: Vec<Value> = self
            .players
            .iter()
            .map(|(user_id, state)| {
                json!({
                    "userId": user_id,
                    "position": state.position,
                    "lastSequence": state.last_sequence,
                })
            })
            .collect();
        json!({"tick": self.current_tick, "players": players})
    }
}
