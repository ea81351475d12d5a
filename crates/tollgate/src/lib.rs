//! tollgate: an Envoy external processor that routes OpenAI-compatible LLM
//! traffic to heterogeneous backends, translates request/response schemas,
//! injects backend credentials, and meters token usage for downstream
//! rate limiting and billing.

pub mod backend_auth;
pub mod config;
pub mod costs;
pub mod metrics;
pub mod mutation;
pub mod processor;
pub mod router;
pub mod server;
pub mod watcher;
