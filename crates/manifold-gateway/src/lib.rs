//! # Manifold Gateway
//!
//! Runtime engine for the Manifold MCP gateway. One process aggregates many
//! backend tool servers - stdio subprocesses, SSE, streamable HTTP - behind
//! a single MCP endpoint for LLM-agent clients.
//!
//! The engine is built from explicitly constructed, dependency-injected
//! components, each exclusively owning its shared state:
//!
//! - [`upstream::TargetManager`] - per-backend connection state machines
//! - [`oauth::OAuthCoordinator`] - authorization flows for gated backends
//! - [`session::SessionManager`] - client sessions and liveness probing
//! - [`streaming::EventLog`] - bounded, resumable delivery history
//! - [`dedup::ToolCallCache`] - duplicate tool-call collapsing
//! - [`config::ConfigManager`] - two-phase transactional reconfiguration
//!
//! The HTTP surface in [`http`] wires these behind axum routes; [`gateway`]
//! assembles the whole service graph.

pub mod audit;
pub mod config;
pub mod dedup;
pub mod extensions;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod oauth;
pub mod permissions;
pub mod router;
pub mod session;
pub mod streaming;
pub mod upstream;

pub use gateway::Gateway;
