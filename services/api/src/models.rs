//! API Models
//!
//! Request and response bodies that exist only at the HTTP boundary. The
//! domain types themselves (agents, configs, analysis) come from
//! `joinly_core` and derive their schemas there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct MessageResponse {
    #[schema(example = "Agent deleted")]
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Query string of the logs endpoint.
#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct LogsQuery {
    /// Number of most recent entries to return (default 100).
    pub lines: Option<usize>,
}

pub const DEFAULT_HTTP_LOG_LINES: usize = 100;

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct FormattedAnalysis {
    /// Markdown report.
    pub content: String,
}
