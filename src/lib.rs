pub mod auth;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod plan;
pub mod policy;
pub mod query;
pub mod rate_limit;
pub mod registry;
pub mod routes;
