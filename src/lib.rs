pub mod achievements;
pub mod api;
pub mod auth;
pub mod config;
pub mod content;
pub mod db;
pub mod energy;
pub mod error;
pub mod finish;
pub mod leveling;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod rate_limit;
pub mod scoring;
pub mod session;
pub mod tournament;
