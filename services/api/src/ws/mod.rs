//! WebSocket Event Streams
//!
//! Browsers follow agents through two push channels fed by the supervisor's
//! event hub: one per agent and one for the whole session.

pub mod session;

pub use session::{ws_agent_handler, ws_session_handler};
