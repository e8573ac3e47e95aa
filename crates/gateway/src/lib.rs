pub mod binding_cache;
pub mod config;
pub mod executor;
pub mod http;
pub mod metrics;
pub mod rate_limit;
pub mod resolver;
pub mod source;
