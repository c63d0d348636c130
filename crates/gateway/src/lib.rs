pub mod config;
pub mod enrich;
pub mod filters;
pub mod http;
pub mod mapper;
pub mod metrics;
pub mod rate_limit;
pub mod relay;
