// Infrastructure
pub mod config;
pub mod error;
pub mod metrics;

// Fanout core
pub mod broker;
pub mod hub;
pub mod orchestrator;
pub mod registry;

// Application layer
pub mod api;
pub mod server;
pub mod ws;

// Client side
pub mod client;
