//! Boundary to the remote meeting backend.
//!
//! The supervisor owns one [`SessionConnection`] per running agent. Concrete
//! transports live outside the core; the state machine they share lives here
//! so the supervisor can reason about it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{AgentConfig, TranscriptSegment};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("client not connected")]
    NotConnected,
    #[error("not joined to a meeting")]
    NotJoined,
    #[error("already joined a meeting")]
    AlreadyJoined,
    #[error("{operation} failed: {message}")]
    Tool { operation: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Joined,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Joined)
                | (Connected, Disconnected)
                | (Joined, Connected)
                | (Joined, Disconnected)
        )
    }
}

/// Shared state cell used by connection implementations.
#[derive(Debug)]
pub struct ConnectionStateCell(Mutex<ConnectionState>);

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self(Mutex::new(ConnectionState::Disconnected))
    }
}

impl ConnectionStateCell {
    pub fn get(&self) -> ConnectionState {
        *self.0.lock()
    }

    /// Moves to `next` if the edge is legal, returning the previous state.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, ConnectionError> {
        let mut state = self.0.lock();
        let previous = *state;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition_to(next) {
            return Err(match next {
                ConnectionState::Joined => ConnectionError::NotConnected,
                _ => ConnectionError::Transport(format!(
                    "illegal connection transition {previous:?} -> {next:?}"
                )),
            });
        }
        *state = next;
        Ok(previous)
    }

    /// Forces the state, used on teardown.
    pub fn reset(&self) {
        *self.0.lock() = ConnectionState::Disconnected;
    }
}

/// Signal that the live transcript changed and should be re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptNotice {
    pub uri: String,
}

#[async_trait]
pub trait SessionConnection: Send + Sync {
    /// Opens the transport. Change notifications are pushed into `notices`
    /// for as long as the connection stays open.
    async fn connect(&self, notices: mpsc::Sender<TranscriptNotice>) -> Result<(), ConnectionError>;

    async fn join(&self, meeting_url: &str, participant_name: &str) -> Result<(), ConnectionError>;

    async fn leave(&self) -> Result<(), ConnectionError>;

    async fn speak(&self, text: &str) -> Result<(), ConnectionError>;

    /// Full transcript as reported by the backend.
    async fn get_transcript(&self) -> Result<Value, ConnectionError>;

    /// Current live segment window.
    async fn get_live_segments(&self) -> Result<Vec<TranscriptSegment>, ConnectionError>;

    /// Leaves the meeting if needed and closes the transport.
    async fn close(&self) -> Result<(), ConnectionError>;

    fn state(&self) -> ConnectionState;
}

/// Builds one connection per agent start. The config carries the session
/// settings sent to the backend.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, agent_id: &str, config: &AgentConfig) -> Arc<dyn SessionConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_walks_the_happy_path() {
        let cell = ConnectionStateCell::default();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        cell.transition(ConnectionState::Connecting).unwrap();
        cell.transition(ConnectionState::Connected).unwrap();
        cell.transition(ConnectionState::Joined).unwrap();
        cell.transition(ConnectionState::Connected).unwrap();
        cell.transition(ConnectionState::Disconnected).unwrap();
    }

    #[test]
    fn test_join_requires_connection() {
        let cell = ConnectionStateCell::default();
        assert_eq!(
            cell.transition(ConnectionState::Joined),
            Err(ConnectionError::NotConnected)
        );
    }

    #[test]
    fn test_same_state_is_a_noop() {
        let cell = ConnectionStateCell::default();
        cell.transition(ConnectionState::Connecting).unwrap();
        cell.transition(ConnectionState::Connected).unwrap();
        cell.transition(ConnectionState::Joined).unwrap();
        assert_eq!(
            cell.transition(ConnectionState::Joined),
            Ok(ConnectionState::Joined)
        );
    }
}
