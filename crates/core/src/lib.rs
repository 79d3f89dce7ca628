pub mod analyst;
pub mod connection;
pub mod consolidation;
pub mod context;
pub mod error;
pub mod events;
pub mod hub;
pub mod llm;
pub mod models;
pub mod responder;
pub mod supersession;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use error::SupervisorError;
pub use supervisor::{Supervisor, SupervisorSettings};
