pub mod admin;
pub mod auth;
pub mod config;
pub mod email;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod payment;
pub mod rate_limit;
pub mod server;
pub mod service_config;
pub mod store;

#[cfg(test)]
mod integration_tests;
