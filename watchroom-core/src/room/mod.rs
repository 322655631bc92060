//! Room session management
//!
//! Owns the join/connect/disconnect state machine and the per-room event
//! loop that serializes every input source onto one task.

mod manager;
mod state;

pub use manager::RoomConnectionManager;
pub use state::{ConnectionState, Participant, RoomSession};
