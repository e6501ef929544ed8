#![forbid(unsafe_code)]

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod health;
pub mod listener;
pub mod metrics;
pub mod renderer;
pub mod resolver;
pub mod services;
pub mod session;
pub mod tenant_config;
pub mod token_cache;


#[cfg(test)]
mod session_tests;
