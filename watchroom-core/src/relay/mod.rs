//! Relay Service interface
//!
//! The relay fans room membership, settings, and playback events out
//! between participants. Only the behavioral contract lives here: the
//! coordinator talks to whatever transport binds these channels, and the
//! wire encoding is the transport's business.

mod handle;
mod protocol;

pub use handle::{RelayCommand, RelayError, RelayEvent, RelayHandle};
pub use protocol::*;
