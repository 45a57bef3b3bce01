//! Backstream backend agent
//!
//! Owns the outbound tunnel to the edge proxy and serves each forwarded
//! HTTP request with an in-process handler.

pub mod client;
pub mod handler;

pub use client::{Agent, AgentConfig};
pub use handler::{HttpEventHandler, HttpHandler, RecoveryHandler};
