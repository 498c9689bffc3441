//! Core domain for tracking peer-to-peer wine sales.
//!
//! This crate is free of I/O: it holds the data model, the domain error
//! taxonomy, the pure lifecycle state machine and the status-message renderer.
//! The server crate wires these to storage, the chat surface and the scheduler.

pub mod error;
pub mod model;
pub mod reaction;
pub mod render;
pub mod state_machine;

pub use error::TransactionError;
pub use model::*;
pub use reaction::ReactionKind;
pub use render::{render_reminder, render_status};
pub use state_machine::TransitionResult;
