pub mod http;
pub mod websocket;

pub use http::{
    health, leaderboard, login, logout, metrics, ops_status, profile, queue_cancel, queue_join,
    register,
};
pub use websocket::ws_handler;
