//! Player API payload types

use serde::{Deserialize, Serialize};

/// Wrapper around every player API response body
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Playback status as reported by the player
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    /// Entry currently loaded, if any
    #[serde(rename = "entryId")]
    pub entry_id: Option<String>,
    /// Position in seconds
    pub position: f64,
    /// Current playback speed
    pub speed: f64,
    /// Whether playback is paused
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadRequest {
    #[serde(rename = "entryId")]
    pub entry_id: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeedRequest {
    pub speed: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeekRequest {
    pub position: f64,
}

/// Response to a seek: whether the player had to reload the media to land
/// on the requested position.
#[derive(Debug, Clone, Deserialize)]
pub struct SeekResponse {
    pub reloaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackRequest {
    pub audio: Option<u32>,
    pub subtitle: Option<u32>,
}

/// Player status as consumed by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub entry_id: Option<String>,
    pub position_secs: f64,
    pub speed: f64,
    pub paused: bool,
}

impl From<StatusResponse> for PlayerStatus {
    fn from(r: StatusResponse) -> Self {
        Self {
            entry_id: r.entry_id,
            position_secs: r.position,
            speed: r.speed,
            paused: r.paused,
        }
    }
}

/// Outcome of a seek command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekOutcome {
    /// True when the player had to reload the media rather than jump
    /// within the buffer.
    pub reloaded: bool,
}
