//! Presentation-facing surface
//!
//! The presentation layer drives the coordinator through
//! [`CoordinatorHandle`] intents, observes it through the
//! [`CoordinatorEvent`] stream, and reads the published
//! [`CoordinatorSnapshot`] for current state. The snapshot is written only
//! by the room event loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::desync::DesyncSeverity;
use crate::ready::{ReadyError, ReadyState, ReadySummary};
use crate::relay::{RelayError, TrackSelection};
use crate::room::ConnectionState;
use crate::settings::{PartialSettings, PlaybackSettings, SettingsError, SettingsScope};

/// Intents from the presentation layer.
#[derive(Debug)]
pub enum CoordinatorCommand {
    RequestJoin {
        room_id: String,
    },
    RequestLeave,
    ToggleReady,
    RetryLoad,
    LoadEntry {
        entry_id: String,
        source: String,
    },
    SetReadyOptIn {
        opt_in: bool,
    },
    SelectTracks {
        tracks: TrackSelection,
        sync_audio: bool,
        sync_subtitles: bool,
    },
    RequestSettingsChange {
        scope: SettingsScope,
        settings: PartialSettings,
        reply: oneshot::Sender<Result<PlaybackSettings, CoordinatorError>>,
    },
}

/// Errors surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error("already in a room")]
    AlreadyInRoom,

    #[error("not in a room")]
    NotInRoom,

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Ready(#[from] ReadyError),

    #[error("broadcast failed: {0}")]
    Broadcast(#[from] RelayError),

    #[error("coordinator task closed")]
    Closed,
}

/// Events pushed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    ConnectionChanged(ConnectionState),
    /// A reconnection attempt is starting
    Reconnecting { attempt: u32 },
    /// Reconnection gave up; the session was forced to Disconnected
    ReconnectExhausted,
    JoinFailed { room_id: String },
    LeaveFailed,
    ParticipantJoined { participant_id: String },
    ParticipantLeft { participant_id: String },
    ReadyChanged {
        participant_id: String,
        state: ReadyState,
    },
    /// Who is still holding playback up, published after load results
    ReadinessSummary(ReadySummary),
    /// Latest desync measurement for the local participant
    SyncStatus {
        offset_secs: f64,
        severity: DesyncSeverity,
    },
    SettingsChanged { effective: PlaybackSettings },
    /// The player rejected a command; manual retry required
    PlayerError(String),
    Error(String),
}

/// Read-only state published for the presentation layer.
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub connection: ConnectionState,
    pub room_id: Option<String>,
    pub active_entry: Option<String>,
    pub ready: HashMap<String, ReadyState>,
    pub room_ready: bool,
    pub pings: HashMap<String, Option<u64>>,
    pub effective_settings: PlaybackSettings,
}

impl Default for CoordinatorSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            room_id: None,
            active_entry: None,
            ready: HashMap::new(),
            room_ready: false,
            pings: HashMap::new(),
            effective_settings: PlaybackSettings::default(),
        }
    }
}

pub(crate) type SharedSnapshot = Arc<RwLock<CoordinatorSnapshot>>;

/// Handle the presentation layer holds onto.
#[derive(Clone)]
pub struct CoordinatorHandle {
    command_tx: mpsc::UnboundedSender<CoordinatorCommand>,
    snapshot: SharedSnapshot,
}

impl CoordinatorHandle {
    pub(crate) fn new(
        command_tx: mpsc::UnboundedSender<CoordinatorCommand>,
        snapshot: SharedSnapshot,
    ) -> Self {
        Self {
            command_tx,
            snapshot,
        }
    }

    fn send(&self, command: CoordinatorCommand) -> Result<(), CoordinatorError> {
        self.command_tx
            .send(command)
            .map_err(|_| CoordinatorError::Closed)
    }

    pub fn request_join(&self, room_id: &str) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::RequestJoin {
            room_id: room_id.to_string(),
        })
    }

    pub fn request_leave(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::RequestLeave)
    }

    pub fn toggle_ready(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::ToggleReady)
    }

    pub fn retry_load(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::RetryLoad)
    }

    pub fn load_entry(&self, entry_id: &str, source: &str) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::LoadEntry {
            entry_id: entry_id.to_string(),
            source: source.to_string(),
        })
    }

    pub fn set_ready_opt_in(&self, opt_in: bool) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::SetReadyOptIn { opt_in })
    }

    pub fn select_tracks(
        &self,
        tracks: TrackSelection,
        sync_audio: bool,
        sync_subtitles: bool,
    ) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::SelectTracks {
            tracks,
            sync_audio,
            sync_subtitles,
        })
    }

    /// Request a validated, broadcast settings change. Resolves once the
    /// change is committed (or rejected).
    pub async fn request_settings_change(
        &self,
        scope: SettingsScope,
        settings: PartialSettings,
    ) -> Result<PlaybackSettings, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CoordinatorCommand::RequestSettingsChange {
            scope,
            settings,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| CoordinatorError::Closed)?
    }

    /// Current coordinator state.
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        self.snapshot.read().clone()
    }
}
