pub mod auth;
pub mod config;
pub mod graph;
pub mod heartbeat;
pub mod model;
pub mod notify;
pub mod runner;
