pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod game;
pub mod handlers;
pub mod models;
pub mod observability;
pub mod queue;
pub mod rating;
pub mod realtime;
pub mod reconnect;
pub mod results;
