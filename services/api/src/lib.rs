//! Joinly Manager API Library Crate
//!
//! HTTP and WebSocket surface of the meeting-agent supervisor, plus the MCP
//! transport that connects agents to the joinly server. The `api` binary is
//! a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod joinly;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
