pub mod config;
pub mod documents;
pub mod http;
pub mod metrics;
