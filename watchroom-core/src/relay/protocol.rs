//! Relay payload types

use serde::{Deserialize, Serialize};

use crate::ready::ReadyState;
use crate::settings::{PartialSettings, SettingsScope};

/// Audio/subtitle track choice for the active entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSelection {
    pub audio: Option<u32>,
    pub subtitle: Option<u32>,
}

/// Presence change for one participant, as observed by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub participant_id: String,
    pub online: bool,
    /// Round-trip time the relay measured for this participant, if any
    pub ping_ms: Option<u64>,
}

/// Authoritative position broadcast for a playlist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceUpdate {
    pub entry_id: String,
    pub position_secs: f64,
    pub source_participant: String,
}

/// Messages the coordinator broadcasts to the other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BroadcastPayload {
    ReadyState {
        participant_id: String,
        state: ReadyState,
    },
    SettingsChange {
        scope: SettingsScope,
        settings: PartialSettings,
    },
    TrackSelection {
        participant_id: String,
        tracks: TrackSelection,
        sync_audio: bool,
        sync_subtitles: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_payload_shape() {
        let payload = BroadcastPayload::ReadyState {
            participant_id: "alice".to_string(),
            state: ReadyState::Ready,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["ReadyState"]["participant_id"], "alice");
        assert_eq!(json["ReadyState"]["state"], "Ready");

        let back: BroadcastPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_settings_change_payload_carries_only_set_fields() {
        let payload = BroadcastPayload::SettingsChange {
            scope: SettingsScope::Room {
                room_id: "room1".to_string(),
            },
            settings: PartialSettings {
                desync_tolerance: Some(1.5),
                ..Default::default()
            },
        };

        let json = serde_json::to_value(&payload).unwrap();
        let settings = &json["SettingsChange"]["settings"];
        assert_eq!(settings["desync_tolerance"], 1.5);
        assert!(settings["major_desync_min"].is_null());
    }
}
