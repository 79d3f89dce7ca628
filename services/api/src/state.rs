//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared
//! supervisor handle and the loaded configuration.

use crate::config::Config;
use joinly_core::Supervisor;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub config: Arc<Config>,
}
