//! Room session state

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::relay::TrackSelection;

/// Lifecycle of the local participant's binding to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Established {
        /// The transport dropped and the session is trying to come back
        reconnecting: bool,
    },
    Disconnecting,
}

impl ConnectionState {
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionState::Established { .. })
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, ConnectionState::Established { reconnecting: true })
    }
}

/// A participant as the room session sees them. Readiness and presence
/// live in their dedicated trackers.
#[derive(Debug, Clone)]
pub struct Participant {
    pub participant_id: String,
    pub tracks: TrackSelection,
    pub sync_audio: bool,
    pub sync_subtitles: bool,
}

impl Participant {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            tracks: TrackSelection::default(),
            sync_audio: true,
            sync_subtitles: true,
        }
    }
}

/// The local participant's binding to one room. Created on join intent,
/// destroyed on leave completion or fatal failure.
#[derive(Debug)]
pub struct RoomSession {
    pub room_id: String,
    pub state: ConnectionState,
    /// Playlist entry currently being watched, if any
    pub active_entry: Option<String>,
    /// Bumped on every join/leave so detached command completions can be
    /// told apart from live ones
    pub epoch: u64,
    pub participants: HashMap<String, Participant>,
}

impl RoomSession {
    pub fn new(room_id: impl Into<String>, local_id: &str, epoch: u64) -> Self {
        let mut participants = HashMap::new();
        participants.insert(local_id.to_string(), Participant::new(local_id));

        Self {
            room_id: room_id.into(),
            state: ConnectionState::Connecting,
            active_entry: None,
            epoch,
            participants,
        }
    }

    pub fn add_participant(&mut self, participant: Participant) {
        self.participants
            .insert(participant.participant_id.clone(), participant);
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> Option<Participant> {
        self.participants.remove(participant_id)
    }
}
