pub mod analytics;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod metrics;
pub mod proxy;
pub mod rules;
pub mod server;
pub mod upstream;
