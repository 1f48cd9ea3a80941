//! Caching, de-duplicating MCP gateway in front of a local KoboldCpp server.
//!
//! Requests flow session handler → [`security::SecurityGate`] →
//! [`dispatcher::Dispatcher`] → response cache or [`backend::BackendClient`].
//! Every decision on the way leaves an [`audit::AuditRecord`].

pub mod audit;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod health;
pub mod mcp;
pub mod metrics;
pub mod models;
pub mod security;
pub mod state;
pub mod tools;
