//! Local Player Control
//!
//! The coordinator drives an out-of-process video player through this
//! module. The player exposes a small localhost HTTP API; everything the
//! coordinator needs from it goes through the [`PlayerControl`] trait so
//! tests can substitute a scripted player.

mod client;
mod types;

pub use client::{PlayerClient, PlayerError};
pub use types::*;

use async_trait::async_trait;

/// Commands the coordinator issues to the local player.
#[async_trait]
pub trait PlayerControl: Send + Sync {
    /// Current playback status (active entry, position, speed, paused).
    async fn status(&self) -> Result<PlayerStatus, PlayerError>;

    /// Load a playlist entry from the given source reference.
    async fn load(&self, entry_id: &str, source: &str) -> Result<(), PlayerError>;

    /// Change the playback speed.
    async fn set_speed(&self, speed: f64) -> Result<(), PlayerError>;

    /// Seek to a position in seconds. The player reports whether the jump
    /// forced a media reload instead of an in-buffer seek.
    async fn seek(&self, position_secs: f64) -> Result<SeekOutcome, PlayerError>;

    /// Select audio/subtitle tracks for the current entry.
    async fn select_tracks(&self, audio: Option<u32>, subtitle: Option<u32>)
        -> Result<(), PlayerError>;
}
