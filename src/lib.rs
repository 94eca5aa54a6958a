pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod model;
pub mod orchestrator;
pub mod platform;
pub mod sweep;
