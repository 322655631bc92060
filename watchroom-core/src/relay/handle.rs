//! Relay command/event channels

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::ready::ReadyState;
use crate::settings::{PartialSettings, SettingsScope};

use super::protocol::{BroadcastPayload, PresenceUpdate, ReferenceUpdate, TrackSelection};

/// How long a broadcast may wait for its delivery acknowledgement
const BROADCAST_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay-facing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    ChannelClosed,

    #[error("broadcast was not acknowledged in time")]
    AckTimeout,

    #[error("broadcast rejected by the relay")]
    Rejected,
}

/// Commands sent to the relay transport.
#[derive(Debug)]
pub enum RelayCommand {
    /// Join a room; the relay answers with [`RelayEvent::JoinAck`]
    Join { room_id: String },
    /// Leave the current room; answered with [`RelayEvent::LeaveAck`]
    Leave,
    /// Liveness ping; answered with [`RelayEvent::HeartbeatAck`]
    Heartbeat { sent_at_ms: u64 },
    /// Fan a payload out to the room; `ack` reports delivery
    Broadcast {
        payload: BroadcastPayload,
        ack: oneshot::Sender<bool>,
    },
}

/// Events the relay transport feeds into the coordinator.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    JoinAck {
        room_id: String,
        success: bool,
    },
    LeaveAck {
        success: bool,
    },
    /// The underlying channel died while established
    TransportDropped,
    HeartbeatAck {
        sent_at_ms: u64,
    },
    RemoteReadyState {
        room_id: String,
        participant_id: String,
        state: ReadyState,
    },
    RemotePresence(PresenceUpdate),
    /// A participant permanently left (account deletion, explicit removal)
    ParticipantRemoved {
        participant_id: String,
    },
    RemoteSettingsChanged {
        scope: SettingsScope,
        settings: PartialSettings,
    },
    RemoteTrackSelection {
        room_id: String,
        participant_id: String,
        tracks: TrackSelection,
        sync_audio: bool,
        sync_subtitles: bool,
    },
    ReferencePosition(ReferenceUpdate),
}

/// Handle for talking to the relay transport.
#[derive(Clone)]
pub struct RelayHandle {
    command_tx: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayHandle {
    /// Create a handle and the command receiver a transport binds to.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Self { command_tx }, command_rx)
    }

    pub fn join(&self, room_id: &str) -> Result<(), RelayError> {
        self.command_tx
            .send(RelayCommand::Join {
                room_id: room_id.to_string(),
            })
            .map_err(|_| RelayError::ChannelClosed)
    }

    pub fn leave(&self) -> Result<(), RelayError> {
        self.command_tx
            .send(RelayCommand::Leave)
            .map_err(|_| RelayError::ChannelClosed)
    }

    pub fn heartbeat(&self, sent_at_ms: u64) -> Result<(), RelayError> {
        self.command_tx
            .send(RelayCommand::Heartbeat { sent_at_ms })
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Broadcast a payload to the room and wait (bounded) for the relay to
    /// confirm delivery.
    pub async fn broadcast(&self, payload: BroadcastPayload) -> Result<(), RelayError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(RelayCommand::Broadcast {
                payload,
                ack: ack_tx,
            })
            .map_err(|_| RelayError::ChannelClosed)?;

        match tokio::time::timeout(BROADCAST_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(RelayError::Rejected),
            Ok(Err(_)) => Err(RelayError::ChannelClosed),
            Err(_) => Err(RelayError::AckTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_resolves_on_ack() {
        let (handle, mut rx) = RelayHandle::channel();

        let broadcast = tokio::spawn(async move {
            handle
                .broadcast(BroadcastPayload::ReadyState {
                    participant_id: "local".to_string(),
                    state: ReadyState::Ready,
                })
                .await
        });

        match rx.recv().await.unwrap() {
            RelayCommand::Broadcast { ack, .. } => ack.send(true).unwrap(),
            other => panic!("unexpected command: {other:?}"),
        }

        assert_eq!(broadcast.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_broadcast_rejected() {
        let (handle, mut rx) = RelayHandle::channel();

        let broadcast = tokio::spawn(async move {
            handle
                .broadcast(BroadcastPayload::ReadyState {
                    participant_id: "local".to_string(),
                    state: ReadyState::Ready,
                })
                .await
        });

        match rx.recv().await.unwrap() {
            RelayCommand::Broadcast { ack, .. } => ack.send(false).unwrap(),
            other => panic!("unexpected command: {other:?}"),
        }

        assert_eq!(broadcast.await.unwrap(), Err(RelayError::Rejected));
    }

    #[tokio::test]
    async fn test_commands_fail_after_transport_drops_receiver() {
        let (handle, rx) = RelayHandle::channel();
        drop(rx);

        assert_eq!(handle.join("room1"), Err(RelayError::ChannelClosed));
        assert_eq!(handle.heartbeat(1), Err(RelayError::ChannelClosed));
    }
}
