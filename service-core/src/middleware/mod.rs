pub mod metrics;
pub mod tracing;
pub mod trigger_auth;
