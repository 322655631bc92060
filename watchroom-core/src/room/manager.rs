//! Room connection management
//!
//! One background task per room session. Every input source — presentation
//! intents, relay events, player command completions, heartbeat and desync
//! sampling ticks — is serialized onto this task, so no decision is ever
//! computed against half-updated trackers. Player commands that can take a
//! while (loads, corrections) run as detached tasks whose completions come
//! back through the internal event channel tagged with the session epoch;
//! completions from a session that has since ended are discarded.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::correction::{self, CorrectionActuator, CorrectionCommand};
use crate::desync::DesyncDetector;
use crate::events::{
    CoordinatorCommand, CoordinatorError, CoordinatorEvent, CoordinatorSnapshot, CoordinatorHandle,
    SharedSnapshot,
};
use crate::player::PlayerControl;
use crate::presence::{PresenceTracker, LIVENESS_TIMEOUT};
use crate::ready::{ReadyState, ReadyStateTracker};
use crate::relay::{BroadcastPayload, PresenceUpdate, ReferenceUpdate, RelayEvent, RelayHandle};
use crate::room::state::{ConnectionState, Participant, RoomSession};
use crate::settings::SettingsStore;

/// Liveness ping cadence while established
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Desync sampling cadence
const DESYNC_SAMPLE_INTERVAL: Duration = Duration::from_millis(1500);

/// How long to wait for a join acknowledgement
const JOIN_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a leave acknowledgement before forcing disconnect
const LEAVE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnection attempts before giving up
const RECONNECT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for reconnection backoff
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// How long a single reconnection attempt may wait for its ack
const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Completions and timers routed back into the event loop.
#[derive(Debug)]
enum InternalEvent {
    LoadCompleted {
        epoch: u64,
        success: bool,
        error: Option<String>,
    },
    CorrectionCompleted {
        epoch: u64,
        success: bool,
        reloaded: bool,
        error: Option<String>,
    },
    JoinAckTimeout {
        epoch: u64,
    },
    LeaveAckTimeout {
        epoch: u64,
    },
    ReconnectTick {
        epoch: u64,
        attempt: u32,
    },
    ReconnectAttemptTimedOut {
        epoch: u64,
        attempt: u32,
    },
}

/// Owns the join/connect/disconnect state machine and composes the
/// per-room trackers.
pub struct RoomConnectionManager {
    local_id: String,
    player: Arc<dyn PlayerControl>,
    relay: RelayHandle,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    commands: mpsc::UnboundedReceiver<CoordinatorCommand>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    settings: Arc<SettingsStore>,
    presence: PresenceTracker,
    ready: ReadyStateTracker,
    detector: DesyncDetector,
    actuator: CorrectionActuator,
    session: Option<RoomSession>,
    /// Bumped whenever a session ends so detached completions die quietly
    epoch: u64,
    /// Attempt currently underway while reconnecting (0 = none yet)
    reconnect_attempt: u32,
    snapshot: SharedSnapshot,
}

impl RoomConnectionManager {
    /// Spawn the coordinator task. Returns the presentation handle and the
    /// event stream.
    pub fn start(
        local_id: impl Into<String>,
        player: Arc<dyn PlayerControl>,
        relay: RelayHandle,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        settings: Arc<SettingsStore>,
    ) -> (CoordinatorHandle, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let local_id = local_id.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let snapshot: SharedSnapshot = Arc::new(parking_lot::RwLock::new(
            CoordinatorSnapshot::default(),
        ));

        let handle = CoordinatorHandle::new(command_tx, Arc::clone(&snapshot));

        let manager = Self {
            ready: ReadyStateTracker::new(local_id.clone()),
            detector: DesyncDetector::new(local_id.clone()),
            local_id,
            player,
            relay,
            relay_events,
            commands: command_rx,
            internal_tx,
            internal_rx,
            events_tx,
            settings,
            presence: PresenceTracker::new(),
            actuator: CorrectionActuator::new(),
            session: None,
            epoch: 0,
            reconnect_attempt: 0,
            snapshot,
        };

        tokio::spawn(manager.run());

        (handle, events_rx)
    }

    async fn run(mut self) {
        info!("Room coordinator task started for {}", self.local_id);

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sampler = tokio::time::interval(DESYNC_SAMPLE_INTERVAL);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_command = self.commands.recv() => match maybe_command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                maybe_event = self.relay_events.recv() => match maybe_event {
                    Some(event) => self.handle_relay_event(event).await,
                    None => {
                        warn!("Relay event channel closed, stopping coordinator");
                        break;
                    }
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
                _ = heartbeat.tick() => self.on_heartbeat_tick(),
                _ = sampler.tick() => self.on_sample_tick().await,
            }

            self.publish_snapshot();
        }

        info!("Room coordinator task ended");
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_error(&self, message: impl Into<String>) {
        self.emit(CoordinatorEvent::Error(message.into()));
    }

    fn connection_state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Established and not in the middle of reconnecting.
    fn is_active(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::Established { reconnecting: false }
        )
    }

    /// Guard for intents that need a live session.
    fn ensure_active(&self) -> Result<(), String> {
        match self.connection_state() {
            ConnectionState::Established { reconnecting: false } => Ok(()),
            ConnectionState::Established { reconnecting: true } => {
                Err("session is reconnecting".to_string())
            }
            _ => Err(CoordinatorError::NotInRoom.to_string()),
        }
    }

    fn publish_snapshot(&self) {
        let room_id = self.session.as_ref().map(|s| s.room_id.clone());
        let snapshot = CoordinatorSnapshot {
            connection: self.connection_state(),
            active_entry: self.session.as_ref().and_then(|s| s.active_entry.clone()),
            ready: self.ready.states(),
            room_ready: self.ready.room_ready(),
            pings: self.presence.pings(),
            effective_settings: self.settings.effective(room_id.as_deref()),
            room_id,
        };
        *self.snapshot.write() = snapshot;
    }

    // === Intents ===

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::RequestJoin { room_id } => self.handle_join(room_id),
            CoordinatorCommand::RequestLeave => self.handle_leave(),
            CoordinatorCommand::ToggleReady => self.handle_toggle_ready().await,
            CoordinatorCommand::RetryLoad => self.handle_retry_load(),
            CoordinatorCommand::LoadEntry { entry_id, source } => {
                self.handle_load_entry(entry_id, source).await
            }
            CoordinatorCommand::SetReadyOptIn { opt_in } => {
                self.ready.set_local_opt_in(opt_in);
            }
            CoordinatorCommand::SelectTracks {
                tracks,
                sync_audio,
                sync_subtitles,
            } => self.handle_select_tracks(tracks, sync_audio, sync_subtitles).await,
            CoordinatorCommand::RequestSettingsChange {
                scope,
                settings,
                reply,
            } => {
                let result = self.handle_settings_change(scope, settings).await;
                let _ = reply.send(result);
            }
        }
    }

    fn handle_join(&mut self, room_id: String) {
        if self.session.is_some() {
            self.emit_error(CoordinatorError::AlreadyInRoom.to_string());
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        self.session = Some(RoomSession::new(room_id.clone(), &self.local_id, epoch));
        self.emit(CoordinatorEvent::ConnectionChanged(
            ConnectionState::Connecting,
        ));

        if self.relay.join(&room_id).is_err() {
            self.fail_join(room_id);
            return;
        }

        info!("Joining room {}", room_id);
        self.spawn_internal_after(JOIN_ACK_TIMEOUT, InternalEvent::JoinAckTimeout { epoch });
    }

    fn fail_join(&mut self, room_id: String) {
        warn!("Join failed for room {}", room_id);
        self.teardown_session();
        self.emit(CoordinatorEvent::JoinFailed { room_id });
        self.emit(CoordinatorEvent::ConnectionChanged(
            ConnectionState::Disconnected,
        ));
    }

    fn handle_leave(&mut self) {
        let Some(session) = self.session.as_mut() else {
            self.emit_error(CoordinatorError::NotInRoom.to_string());
            return;
        };
        if !session.state.is_established() {
            self.emit_error(CoordinatorError::NotInRoom.to_string());
            return;
        }

        // An explicit leave cancels any reconnection in progress
        session.state = ConnectionState::Disconnecting;
        let epoch = session.epoch;
        let room_id = session.room_id.clone();
        self.reconnect_attempt = 0;
        self.emit(CoordinatorEvent::ConnectionChanged(
            ConnectionState::Disconnecting,
        ));

        info!("Leaving room {}", room_id);
        if self.relay.leave().is_err() {
            // Transport already gone; nothing to wait for
            self.complete_disconnect();
            return;
        }
        self.spawn_internal_after(LEAVE_ACK_TIMEOUT, InternalEvent::LeaveAckTimeout { epoch });
    }

    async fn handle_toggle_ready(&mut self) {
        if let Err(reason) = self.ensure_active() {
            self.emit_error(reason);
            return;
        }

        let previous = self.ready.local_state();
        let new_state = match self.ready.toggle_local() {
            Ok(state) => state,
            Err(e) => {
                self.emit_error(e.to_string());
                return;
            }
        };
        self.emit(CoordinatorEvent::ReadyChanged {
            participant_id: self.local_id.clone(),
            state: new_state,
        });

        let payload = BroadcastPayload::ReadyState {
            participant_id: self.local_id.clone(),
            state: new_state,
        };
        if let Err(e) = self.relay.broadcast(payload).await {
            // Roll the optimistic flip back; the room never saw it
            self.ready.set_local(previous);
            self.emit(CoordinatorEvent::ReadyChanged {
                participant_id: self.local_id.clone(),
                state: previous,
            });
            self.emit_error(format!("ready state broadcast failed: {e}"));
        }
    }

    fn handle_retry_load(&mut self) {
        match self.ready.retry_load() {
            Ok((entry_id, source)) => {
                self.emit(CoordinatorEvent::ReadyChanged {
                    participant_id: self.local_id.clone(),
                    state: ReadyState::Loading,
                });
                info!("Retrying load of {}", entry_id);
                self.spawn_load(entry_id, source);
            }
            Err(e) => self.emit_error(e.to_string()),
        }
    }

    async fn handle_load_entry(&mut self, entry_id: String, source: String) {
        if let Err(reason) = self.ensure_active() {
            self.emit_error(reason);
            return;
        }

        if let Some(session) = self.session.as_mut() {
            session.active_entry = Some(entry_id.clone());
        }
        self.detector.clear_reference();
        self.ready.on_load_start(&entry_id, &source);
        self.emit(CoordinatorEvent::ReadyChanged {
            participant_id: self.local_id.clone(),
            state: ReadyState::Loading,
        });

        self.broadcast_local_ready(ReadyState::Loading).await;
        self.spawn_load(entry_id, source);
    }

    /// Best-effort ready-state broadcast for lifecycle transitions (load
    /// start/finish). Unlike the toggle, the local state is factual here
    /// and is not rolled back when the room did not hear about it.
    async fn broadcast_local_ready(&mut self, state: ReadyState) {
        let payload = BroadcastPayload::ReadyState {
            participant_id: self.local_id.clone(),
            state,
        };
        if let Err(e) = self.relay.broadcast(payload).await {
            self.emit_error(format!("ready state broadcast failed: {e}"));
        }
    }

    async fn handle_select_tracks(
        &mut self,
        tracks: crate::relay::TrackSelection,
        sync_audio: bool,
        sync_subtitles: bool,
    ) {
        if let Err(reason) = self.ensure_active() {
            self.emit_error(reason);
            return;
        }

        if let Some(session) = self.session.as_mut() {
            if let Some(local) = session.participants.get_mut(&self.local_id) {
                local.tracks = tracks;
                local.sync_audio = sync_audio;
                local.sync_subtitles = sync_subtitles;
            }
        }

        if let Err(e) = self.player.select_tracks(tracks.audio, tracks.subtitle).await {
            self.emit(CoordinatorEvent::PlayerError(format!(
                "track selection failed: {e}"
            )));
            return;
        }

        let payload = BroadcastPayload::TrackSelection {
            participant_id: self.local_id.clone(),
            tracks,
            sync_audio,
            sync_subtitles,
        };
        if let Err(e) = self.relay.broadcast(payload).await {
            self.emit_error(format!("track selection broadcast failed: {e}"));
        }
    }

    async fn handle_settings_change(
        &mut self,
        scope: crate::settings::SettingsScope,
        settings: crate::settings::PartialSettings,
    ) -> Result<crate::settings::PlaybackSettings, CoordinatorError> {
        // Validate before anything leaves this process
        self.settings.check(&scope, &settings)?;

        // Commit only once the room has heard about the change
        self.relay
            .broadcast(BroadcastPayload::SettingsChange {
                scope: scope.clone(),
                settings,
            })
            .await?;

        let effective = self.settings.set(&scope, &settings)?;
        self.emit(CoordinatorEvent::SettingsChanged { effective });
        Ok(effective)
    }

    // === Relay events ===

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::JoinAck { room_id, success } => self.handle_join_ack(room_id, success),
            RelayEvent::LeaveAck { success } => self.handle_leave_ack(success),
            RelayEvent::TransportDropped => self.handle_transport_dropped(),
            RelayEvent::HeartbeatAck { sent_at_ms } => {
                let local_id = self.local_id.clone();
                self.presence.handle_pong(&local_id, sent_at_ms);
            }
            RelayEvent::RemoteReadyState {
                room_id,
                participant_id,
                state,
            } => self.handle_remote_ready(room_id, participant_id, state),
            RelayEvent::RemotePresence(update) => self.handle_remote_presence(update),
            RelayEvent::ParticipantRemoved { participant_id } => {
                self.presence.remove(&participant_id);
                self.ready.remove_participant(&participant_id);
                if let Some(session) = self.session.as_mut() {
                    session.remove_participant(&participant_id);
                }
                self.emit(CoordinatorEvent::ParticipantLeft { participant_id });
            }
            RelayEvent::RemoteSettingsChanged { scope, settings } => {
                match self.settings.set(&scope, &settings) {
                    Ok(effective) => {
                        self.emit(CoordinatorEvent::SettingsChanged { effective });
                    }
                    Err(e) => warn!("Rejected invalid remote settings change: {e}"),
                }
            }
            RelayEvent::RemoteTrackSelection {
                room_id,
                participant_id,
                tracks,
                sync_audio,
                sync_subtitles,
            } => {
                let Some(session) = self.session.as_mut() else { return };
                if session.room_id != room_id {
                    return;
                }
                let participant = session
                    .participants
                    .entry(participant_id.clone())
                    .or_insert_with(|| Participant::new(participant_id));
                participant.tracks = tracks;
                participant.sync_audio = sync_audio;
                participant.sync_subtitles = sync_subtitles;
            }
            RelayEvent::ReferencePosition(update) => self.handle_reference_position(update),
        }
    }

    fn handle_join_ack(&mut self, room_id: String, success: bool) {
        let Some(session) = self.session.as_mut() else {
            debug!("Join ack for {} without a session, ignoring", room_id);
            return;
        };
        if session.room_id != room_id {
            debug!("Join ack for stale room {}, ignoring", room_id);
            return;
        }

        match session.state {
            ConnectionState::Connecting => {
                if success {
                    session.state = ConnectionState::Established { reconnecting: false };
                    info!("Joined room {}", room_id);
                    self.ready.reset();
                    let local_id = self.local_id.clone();
                    self.presence.set_online(&local_id);
                    self.emit(CoordinatorEvent::ConnectionChanged(
                        ConnectionState::Established { reconnecting: false },
                    ));
                } else {
                    self.fail_join(room_id);
                }
            }
            ConnectionState::Established { reconnecting: true } => {
                if success {
                    session.state = ConnectionState::Established { reconnecting: false };
                    self.reconnect_attempt = 0;
                    info!("Reconnected to room {}", room_id);
                    self.emit(CoordinatorEvent::ConnectionChanged(
                        ConnectionState::Established { reconnecting: false },
                    ));
                } else {
                    let attempt = self.reconnect_attempt;
                    self.reconnect_attempt_failed(attempt);
                }
            }
            _ => debug!("Join ack in state {:?}, ignoring", session.state),
        }
    }

    fn handle_leave_ack(&mut self, success: bool) {
        let Some(session) = self.session.as_mut() else { return };
        if session.state != ConnectionState::Disconnecting {
            return;
        }

        if success {
            self.complete_disconnect();
        } else {
            // The room still considers us a member
            session.state = ConnectionState::Established { reconnecting: false };
            self.emit(CoordinatorEvent::LeaveFailed);
            self.emit(CoordinatorEvent::ConnectionChanged(
                ConnectionState::Established { reconnecting: false },
            ));
        }
    }

    fn handle_transport_dropped(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        match session.state {
            ConnectionState::Established { reconnecting: false } => {
                warn!("Transport dropped, reconnecting to {}", session.room_id);
                session.state = ConnectionState::Established { reconnecting: true };
                self.reconnect_attempt = 0;
                self.emit(CoordinatorEvent::ConnectionChanged(
                    ConnectionState::Established { reconnecting: true },
                ));
                self.schedule_reconnect(1);
            }
            ConnectionState::Connecting => {
                let room_id = session.room_id.clone();
                self.fail_join(room_id);
            }
            _ => {}
        }
    }

    fn handle_remote_ready(&mut self, room_id: String, participant_id: String, state: ReadyState) {
        // Updates for a room we have since left are dropped
        let Some(session) = self.session.as_mut() else {
            debug!("Ready state for {} after leaving, discarding", room_id);
            return;
        };
        if session.room_id != room_id {
            debug!("Ready state for other room {}, discarding", room_id);
            return;
        }
        if !session.state.is_established() {
            debug!("Ready state before the session is established, discarding");
            return;
        }

        if !session.participants.contains_key(&participant_id) {
            session.add_participant(Participant::new(participant_id.clone()));
        }
        self.ready.insert_participant(&participant_id);
        self.ready.on_remote(&participant_id, state);
        self.emit(CoordinatorEvent::ReadyChanged {
            participant_id,
            state,
        });
    }

    fn handle_remote_presence(&mut self, update: PresenceUpdate) {
        // Presence is tracked independently of room membership
        if update.online {
            self.presence.set_online(&update.participant_id);
            if let Some(rtt) = update.ping_ms {
                self.presence.record_rtt(&update.participant_id, rtt);
            }
            if let Some(session) = self.session.as_mut() {
                if session.state.is_established()
                    && !session.participants.contains_key(&update.participant_id)
                {
                    session.add_participant(Participant::new(update.participant_id.clone()));
                    self.ready.insert_participant(&update.participant_id);
                    self.emit(CoordinatorEvent::ParticipantJoined {
                        participant_id: update.participant_id,
                    });
                }
            }
        } else {
            self.presence.set_offline(&update.participant_id);
        }
    }

    fn handle_reference_position(&mut self, update: ReferenceUpdate) {
        let Some(session) = self.session.as_ref() else { return };
        if session.active_entry.as_deref() != Some(update.entry_id.as_str()) {
            debug!(
                "Reference position for inactive entry {}, ignoring",
                update.entry_id
            );
            return;
        }

        self.detector.on_reference_position(
            &update.entry_id,
            update.position_secs,
            &update.source_participant,
        );
        self.presence.mark_seen(&update.source_participant);
    }

    // === Internal events ===

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::LoadCompleted {
                epoch,
                success,
                error,
            } => {
                if epoch != self.epoch {
                    debug!("Load completed after session end, discarding");
                    return;
                }
                let state = self.ready.on_load_result(success);
                self.emit(CoordinatorEvent::ReadyChanged {
                    participant_id: self.local_id.clone(),
                    state,
                });
                if success {
                    self.emit(CoordinatorEvent::ReadinessSummary(self.ready.summary()));
                } else {
                    self.emit(CoordinatorEvent::PlayerError(
                        error.unwrap_or_else(|| "load failed".to_string()),
                    ));
                }
                self.broadcast_local_ready(state).await;
            }
            InternalEvent::CorrectionCompleted {
                epoch,
                success,
                reloaded,
                error,
            } => {
                if epoch != self.epoch {
                    debug!("Correction completed after session end, discarding");
                    return;
                }
                self.actuator.complete(success);
                if !success {
                    // Persistent error; the user retries through the ready path
                    self.ready.set_local(ReadyState::Error);
                    self.emit(CoordinatorEvent::ReadyChanged {
                        participant_id: self.local_id.clone(),
                        state: ReadyState::Error,
                    });
                    self.emit(CoordinatorEvent::PlayerError(
                        error.unwrap_or_else(|| "correction failed".to_string()),
                    ));
                } else if reloaded {
                    // The jump went through a reload; surface the blip
                    for state in [ReadyState::Loading, ReadyState::Ready] {
                        self.ready.set_local(state);
                        self.emit(CoordinatorEvent::ReadyChanged {
                            participant_id: self.local_id.clone(),
                            state,
                        });
                    }
                }
            }
            InternalEvent::JoinAckTimeout { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                if let Some(session) = self.session.as_ref() {
                    if session.state == ConnectionState::Connecting {
                        let room_id = session.room_id.clone();
                        warn!("Join ack timeout for {}", room_id);
                        self.fail_join(room_id);
                    }
                }
            }
            InternalEvent::LeaveAckTimeout { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                if self.connection_state() == ConnectionState::Disconnecting {
                    warn!("Leave ack timeout, forcing disconnect");
                    self.complete_disconnect();
                }
            }
            InternalEvent::ReconnectTick { epoch, attempt } => {
                if epoch != self.epoch || !self.connection_state().is_reconnecting() {
                    return;
                }
                if self.reconnect_attempt >= attempt {
                    return;
                }
                self.reconnect_attempt = attempt;
                self.emit(CoordinatorEvent::Reconnecting { attempt });

                let room_id = self
                    .session
                    .as_ref()
                    .map(|s| s.room_id.clone())
                    .unwrap_or_default();
                info!("Reconnect attempt {}/{}", attempt, RECONNECT_MAX_ATTEMPTS);
                if self.relay.join(&room_id).is_err() {
                    self.reconnect_attempt_failed(attempt);
                    return;
                }
                self.spawn_internal_after(
                    RECONNECT_ATTEMPT_TIMEOUT,
                    InternalEvent::ReconnectAttemptTimedOut { epoch, attempt },
                );
            }
            InternalEvent::ReconnectAttemptTimedOut { epoch, attempt } => {
                if epoch != self.epoch
                    || !self.connection_state().is_reconnecting()
                    || self.reconnect_attempt != attempt
                {
                    return;
                }
                self.reconnect_attempt_failed(attempt);
            }
        }
    }

    fn reconnect_attempt_failed(&mut self, attempt: u32) {
        if attempt >= RECONNECT_MAX_ATTEMPTS {
            warn!("Reconnection exhausted after {} attempts", attempt);
            self.teardown_session();
            self.emit(CoordinatorEvent::ReconnectExhausted);
            self.emit(CoordinatorEvent::ConnectionChanged(
                ConnectionState::Disconnected,
            ));
        } else {
            self.schedule_reconnect(attempt + 1);
        }
    }

    fn schedule_reconnect(&self, attempt: u32) {
        let exponent = attempt.saturating_sub(1).min(3);
        let jitter = rand::thread_rng().gen_range(0..500);
        let delay = RECONNECT_BASE_DELAY * 2u32.pow(exponent) + Duration::from_millis(jitter);
        debug!("Scheduling reconnect attempt {} in {:?}", attempt, delay);
        self.spawn_internal_after(
            delay,
            InternalEvent::ReconnectTick {
                epoch: self.epoch,
                attempt,
            },
        );
    }

    // === Timers ===

    fn on_heartbeat_tick(&mut self) {
        if !self.is_active() {
            return;
        }

        let sent_at_ms = self.presence.create_ping();
        if self.relay.heartbeat(sent_at_ms).is_err() {
            warn!("Heartbeat send failed");
        }

        // Participants whose liveness signal went quiet drop to offline
        for participant_id in self.presence.stale_participants(LIVENESS_TIMEOUT) {
            if participant_id != self.local_id {
                debug!("Participant {} went quiet, marking offline", participant_id);
                self.presence.set_offline(&participant_id);
            }
        }
    }

    async fn on_sample_tick(&mut self) {
        if !self.is_active() || self.ready.local_state() != ReadyState::Ready {
            return;
        }
        let Some((room_id, entry_id)) = self
            .session
            .as_ref()
            .and_then(|s| s.active_entry.clone().map(|e| (s.room_id.clone(), e)))
        else {
            return;
        };

        let status = match self.player.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Desync sample skipped, player status failed: {e}");
                return;
            }
        };

        let settings = self.settings.effective(Some(&room_id));
        let latency_ms = self
            .detector
            .reference()
            .map(|r| self.presence.one_way_ms(&r.source_participant))
            .unwrap_or(0);

        let Some(event) =
            self.detector
                .sample(&entry_id, status.position_secs, latency_ms, &settings)
        else {
            return;
        };

        self.emit(CoordinatorEvent::SyncStatus {
            offset_secs: event.offset_secs,
            severity: event.severity,
        });

        let reference_secs = status.position_secs - event.offset_secs;
        let action = correction::decide(&event, &settings, reference_secs);
        if let Some(command) = self.actuator.apply(action, &settings) {
            self.spawn_correction(command);
        }
    }

    // === Detached player commands ===

    fn spawn_load(&self, entry_id: String, source: String) {
        let player = Arc::clone(&self.player);
        let internal_tx = self.internal_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = player.load(&entry_id, &source).await;
            let _ = internal_tx.send(InternalEvent::LoadCompleted {
                epoch,
                success: result.is_ok(),
                error: result.err().map(|e| format!("load of {} failed: {e}", entry_id)),
            });
        });
    }

    fn spawn_correction(&self, command: CorrectionCommand) {
        let player = Arc::clone(&self.player);
        let internal_tx = self.internal_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = match command {
                CorrectionCommand::SetSpeed(speed) => {
                    player.set_speed(speed).await.map(|_| false)
                }
                CorrectionCommand::Resync {
                    target_secs,
                    base_speed,
                } => match player.seek(target_secs).await {
                    Ok(outcome) => player.set_speed(base_speed).await.map(|_| outcome.reloaded),
                    Err(e) => Err(e),
                },
            };

            let _ = internal_tx.send(InternalEvent::CorrectionCompleted {
                epoch,
                success: result.is_ok(),
                reloaded: *result.as_ref().unwrap_or(&false),
                error: result.err().map(|e| e.to_string()),
            });
        });
    }

    fn spawn_internal_after(&self, delay: Duration, event: InternalEvent) {
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal_tx.send(event);
        });
    }

    // === Teardown ===

    fn complete_disconnect(&mut self) {
        info!("Disconnected");
        self.teardown_session();
        self.emit(CoordinatorEvent::ConnectionChanged(
            ConnectionState::Disconnected,
        ));
    }

    /// Drop the session: timers and in-flight commands are detached (their
    /// completions fail the epoch check), trackers return to their idle
    /// state. Presence history survives for the next session.
    fn teardown_session(&mut self) {
        self.epoch += 1;
        self.session = None;
        self.reconnect_attempt = 0;
        self.ready.reset();
        self.actuator.reset();
        self.detector.clear_reference();
        self.presence.clear_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::desync::DesyncSeverity;
    use crate::player::{PlayerError, PlayerStatus, SeekOutcome};
    use crate::relay::RelayCommand;
    use crate::settings::{PartialSettings, SettingsScope};

    const WAIT: Duration = Duration::from_secs(30);

    #[derive(Default)]
    struct MockPlayer {
        loads: parking_lot::Mutex<Vec<(String, String)>>,
        speeds: parking_lot::Mutex<Vec<f64>>,
        seeks: parking_lot::Mutex<Vec<f64>>,
        position_secs: parking_lot::Mutex<f64>,
        status_calls: AtomicUsize,
        fail_loads: AtomicBool,
        fail_speed: AtomicBool,
        seek_reloads: AtomicBool,
        hold_loads: AtomicBool,
        release_loads: Notify,
    }

    #[async_trait]
    impl PlayerControl for MockPlayer {
        async fn status(&self) -> Result<PlayerStatus, PlayerError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PlayerStatus {
                entry_id: Some("e1".to_string()),
                position_secs: *self.position_secs.lock(),
                speed: 1.0,
                paused: false,
            })
        }

        async fn load(&self, entry_id: &str, source: &str) -> Result<(), PlayerError> {
            if self.hold_loads.load(Ordering::SeqCst) {
                self.release_loads.notified().await;
            }
            self.loads
                .lock()
                .push((entry_id.to_string(), source.to_string()));
            if self.fail_loads.load(Ordering::SeqCst) {
                Err(PlayerError::Rejected("load refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn set_speed(&self, speed: f64) -> Result<(), PlayerError> {
            if self.fail_speed.load(Ordering::SeqCst) {
                return Err(PlayerError::Rejected("speed refused".to_string()));
            }
            self.speeds.lock().push(speed);
            Ok(())
        }

        async fn seek(&self, position_secs: f64) -> Result<SeekOutcome, PlayerError> {
            self.seeks.lock().push(position_secs);
            Ok(SeekOutcome {
                reloaded: self.seek_reloads.load(Ordering::SeqCst),
            })
        }

        async fn select_tracks(
            &self,
            _audio: Option<u32>,
            _subtitle: Option<u32>,
        ) -> Result<(), PlayerError> {
            Ok(())
        }
    }

    struct Harness {
        handle: CoordinatorHandle,
        events: mpsc::UnboundedReceiver<CoordinatorEvent>,
        relay_tx: mpsc::UnboundedSender<RelayEvent>,
        relay_cmds: mpsc::UnboundedReceiver<RelayCommand>,
        player: Arc<MockPlayer>,
        settings: Arc<SettingsStore>,
    }

    fn start_harness() -> Harness {
        let (relay_handle, relay_cmds) = RelayHandle::channel();
        let (relay_tx, relay_events) = mpsc::unbounded_channel();
        let settings = Arc::new(SettingsStore::new());
        let player = Arc::new(MockPlayer::default());
        let player_dyn: Arc<dyn PlayerControl> = Arc::clone(&player) as Arc<dyn PlayerControl>;

        let (handle, events) = RoomConnectionManager::start(
            "local",
            player_dyn,
            relay_handle,
            relay_events,
            Arc::clone(&settings),
        );

        Harness {
            handle,
            events,
            relay_tx,
            relay_cmds,
            player,
            settings,
        }
    }

    impl Harness {
        async fn next_event(
            &mut self,
            pred: impl Fn(&CoordinatorEvent) -> bool,
        ) -> CoordinatorEvent {
            tokio::time::timeout(WAIT, async {
                loop {
                    let event = self.events.recv().await.expect("event channel closed");
                    if pred(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("timed out waiting for coordinator event")
        }

        async fn expect_connection(&mut self, expected: ConnectionState) {
            let event = self
                .next_event(|e| matches!(e, CoordinatorEvent::ConnectionChanged(_)))
                .await;
            assert_eq!(event, CoordinatorEvent::ConnectionChanged(expected));
        }

        /// Next relay command that is not a heartbeat.
        async fn next_relay_cmd(&mut self) -> RelayCommand {
            tokio::time::timeout(WAIT, async {
                loop {
                    let command = self.relay_cmds.recv().await.expect("relay channel closed");
                    if !matches!(command, RelayCommand::Heartbeat { .. }) {
                        return command;
                    }
                }
            })
            .await
            .expect("timed out waiting for relay command")
        }

        async fn expect_join_cmd(&mut self) -> String {
            match self.next_relay_cmd().await {
                RelayCommand::Join { room_id } => room_id,
                other => panic!("expected join, got {other:?}"),
            }
        }

        /// Skip to the next broadcast command, answer its ack, and return
        /// the payload.
        async fn ack_next_broadcast(&mut self, accept: bool) -> BroadcastPayload {
            tokio::time::timeout(WAIT, async {
                loop {
                    match self.relay_cmds.recv().await.expect("relay channel closed") {
                        RelayCommand::Broadcast { payload, ack } => {
                            ack.send(accept).unwrap();
                            return payload;
                        }
                        _ => continue,
                    }
                }
            })
            .await
            .expect("timed out waiting for broadcast")
        }

        async fn establish(&mut self, room_id: &str) {
            self.handle.request_join(room_id).unwrap();
            self.expect_connection(ConnectionState::Connecting).await;
            assert_eq!(self.expect_join_cmd().await, room_id);
            self.relay_tx
                .send(RelayEvent::JoinAck {
                    room_id: room_id.to_string(),
                    success: true,
                })
                .unwrap();
            self.expect_connection(ConnectionState::Established { reconnecting: false })
                .await;
        }

        /// Load an entry and drive the local participant to Ready.
        async fn load_to_ready(&mut self, entry_id: &str, source: &str) {
            self.handle.load_entry(entry_id, source).unwrap();
            self.next_event(|e| {
                matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Loading, .. })
            })
            .await;
            // Loading broadcast, then the load-result broadcast
            self.ack_next_broadcast(true).await;
            self.next_event(|e| {
                matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Ready, .. })
            })
            .await;
            self.ack_next_broadcast(true).await;
        }

        async fn wait_snapshot(&self, pred: impl Fn(&CoordinatorSnapshot) -> bool) {
            tokio::time::timeout(WAIT, async {
                loop {
                    if pred(&self.handle.snapshot()) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("timed out waiting for snapshot");
        }

        /// Let queued work settle, then return everything currently in the
        /// event channel.
        async fn drain_events(&mut self) -> Vec<CoordinatorEvent> {
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut drained = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                drained.push(event);
            }
            drained
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_walks_connecting_to_established() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.wait_snapshot(|s| {
            s.connection == ConnectionState::Established { reconnecting: false }
                && s.room_id.as_deref() == Some("room1")
                && s.ready.get("local") == Some(&ReadyState::NotReady)
        })
        .await;

        // Heartbeat timer is running
        let command = tokio::time::timeout(WAIT, async {
            loop {
                match h.relay_cmds.recv().await.unwrap() {
                    RelayCommand::Heartbeat { sent_at_ms } => return sent_at_ms,
                    _ => continue,
                }
            }
        })
        .await
        .expect("no heartbeat observed");
        assert!(command > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_ack_failure_returns_to_disconnected() {
        let mut h = start_harness();
        h.handle.request_join("room1").unwrap();
        h.expect_connection(ConnectionState::Connecting).await;
        h.expect_join_cmd().await;

        h.relay_tx
            .send(RelayEvent::JoinAck {
                room_id: "room1".to_string(),
                success: false,
            })
            .unwrap();

        h.next_event(|e| matches!(e, CoordinatorEvent::JoinFailed { .. })).await;
        h.expect_connection(ConnectionState::Disconnected).await;
        h.wait_snapshot(|s| s.connection == ConnectionState::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_ack_timeout_fails_the_join() {
        let mut h = start_harness();
        h.handle.request_join("room1").unwrap();
        h.expect_connection(ConnectionState::Connecting).await;
        h.expect_join_cmd().await;

        // No ack ever arrives; the timeout forces the failure path
        h.next_event(|e| matches!(e, CoordinatorEvent::JoinFailed { .. })).await;
        h.expect_connection(ConnectionState::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_acknowledged() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.handle.request_leave().unwrap();
        h.expect_connection(ConnectionState::Disconnecting).await;
        assert!(matches!(h.next_relay_cmd().await, RelayCommand::Leave));

        h.relay_tx.send(RelayEvent::LeaveAck { success: true }).unwrap();
        h.expect_connection(ConnectionState::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_failure_returns_to_established() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.handle.request_leave().unwrap();
        h.expect_connection(ConnectionState::Disconnecting).await;
        assert!(matches!(h.next_relay_cmd().await, RelayCommand::Leave));

        h.relay_tx.send(RelayEvent::LeaveAck { success: false }).unwrap();
        h.next_event(|e| matches!(e, CoordinatorEvent::LeaveFailed)).await;
        h.expect_connection(ConnectionState::Established { reconnecting: false })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_drop_reconnects_then_gives_up() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.relay_tx.send(RelayEvent::TransportDropped).unwrap();
        h.expect_connection(ConnectionState::Established { reconnecting: true })
            .await;

        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            let event = h
                .next_event(|e| matches!(e, CoordinatorEvent::Reconnecting { .. }))
                .await;
            assert_eq!(event, CoordinatorEvent::Reconnecting { attempt });

            assert_eq!(h.expect_join_cmd().await, "room1");
            h.relay_tx
                .send(RelayEvent::JoinAck {
                    room_id: "room1".to_string(),
                    success: false,
                })
                .unwrap();
        }

        h.next_event(|e| matches!(e, CoordinatorEvent::ReconnectExhausted)).await;
        h.expect_connection(ConnectionState::Disconnected).await;
        h.wait_snapshot(|s| s.connection == ConnectionState::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_resumes_session() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.relay_tx.send(RelayEvent::TransportDropped).unwrap();
        h.expect_connection(ConnectionState::Established { reconnecting: true })
            .await;

        h.next_event(|e| matches!(e, CoordinatorEvent::Reconnecting { attempt: 1 }))
            .await;
        h.expect_join_cmd().await;
        h.relay_tx
            .send(RelayEvent::JoinAck {
                room_id: "room1".to_string(),
                success: true,
            })
            .unwrap();

        h.expect_connection(ConnectionState::Established { reconnecting: false })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_suspended_while_reconnecting() {
        let mut h = start_harness();
        h.establish("room1").await;
        h.load_to_ready("e1", "src://e1").await;

        h.relay_tx.send(RelayEvent::TransportDropped).unwrap();
        h.expect_connection(ConnectionState::Established { reconnecting: true })
            .await;

        let before = h.player.status_calls.load(Ordering::SeqCst);
        tokio::time::sleep(DESYNC_SAMPLE_INTERVAL * 4).await;
        assert_eq!(h.player.status_calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_toggle_round_trip_broadcasts_twice() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.handle.toggle_ready().unwrap();
        let first = h.ack_next_broadcast(true).await;
        assert!(matches!(
            first,
            BroadcastPayload::ReadyState { state: ReadyState::Ready, .. }
        ));
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Ready, .. })
        })
        .await;

        h.handle.toggle_ready().unwrap();
        let second = h.ack_next_broadcast(true).await;
        assert!(matches!(
            second,
            BroadcastPayload::ReadyState { state: ReadyState::NotReady, .. }
        ));
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::NotReady, .. })
        })
        .await;

        h.wait_snapshot(|s| s.ready.get("local") == Some(&ReadyState::NotReady)).await;

        // Exactly two broadcasts went out
        h.drain_events().await;
        while let Ok(command) = h.relay_cmds.try_recv() {
            assert!(
                !matches!(command, RelayCommand::Broadcast { .. }),
                "unexpected extra broadcast"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_toggle_rolls_back_on_broadcast_failure() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.handle.toggle_ready().unwrap();
        h.ack_next_broadcast(false).await;

        // Optimistic flip, then the rollback
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Ready, .. })
        })
        .await;
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::NotReady, .. })
        })
        .await;
        h.next_event(|e| matches!(e, CoordinatorEvent::Error(_))).await;

        h.wait_snapshot(|s| s.ready.get("local") == Some(&ReadyState::NotReady)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_sets_error_and_retry_reissues_same_entry() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.player.fail_loads.store(true, Ordering::SeqCst);
        h.handle.load_entry("e1", "src://e1").unwrap();
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Loading, .. })
        })
        .await;
        h.ack_next_broadcast(true).await;

        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Error, .. })
        })
        .await;
        h.next_event(|e| matches!(e, CoordinatorEvent::PlayerError(_))).await;
        h.ack_next_broadcast(true).await;

        // Manual retry re-issues the identical load
        h.player.fail_loads.store(false, Ordering::SeqCst);
        h.handle.retry_load().unwrap();
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Loading, .. })
        })
        .await;
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Ready, .. })
        })
        .await;
        h.ack_next_broadcast(true).await;

        let loads = h.player.loads.lock().clone();
        assert_eq!(
            loads,
            vec![
                ("e1".to_string(), "src://e1".to_string()),
                ("e1".to_string(), "src://e1".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_minor_desync_nudges_speed() {
        let mut h = start_harness();
        h.establish("room1").await;
        h.load_to_ready("e1", "src://e1").await;

        h.relay_tx
            .send(RelayEvent::ReferencePosition(ReferenceUpdate {
                entry_id: "e1".to_string(),
                position_secs: 100.0,
                source_participant: "host".to_string(),
            }))
            .unwrap();
        *h.player.position_secs.lock() = 103.0;

        let event = h
            .next_event(|e| matches!(e, CoordinatorEvent::SyncStatus { .. }))
            .await;
        match event {
            CoordinatorEvent::SyncStatus { severity, offset_secs } => {
                assert_eq!(severity, DesyncSeverity::Minor);
                assert!(offset_secs > 2.0 && offset_secs < 4.0);
            }
            _ => unreachable!(),
        }

        // Ahead of the room: the nudge slows us below base speed
        h.wait_snapshot(|_| !h.player.speeds.lock().is_empty()).await;
        let speed = h.player.speeds.lock()[0];
        assert!((speed - 0.95).abs() < 1e-9, "expected 0.95, got {speed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_major_desync_hard_resyncs_to_reference() {
        let mut h = start_harness();
        h.establish("room1").await;
        h.load_to_ready("e1", "src://e1").await;

        h.relay_tx
            .send(RelayEvent::ReferencePosition(ReferenceUpdate {
                entry_id: "e1".to_string(),
                position_secs: 100.0,
                source_participant: "host".to_string(),
            }))
            .unwrap();
        *h.player.position_secs.lock() = 110.0;

        let event = h
            .next_event(|e| matches!(e, CoordinatorEvent::SyncStatus { .. }))
            .await;
        assert!(matches!(
            event,
            CoordinatorEvent::SyncStatus { severity: DesyncSeverity::Major, .. }
        ));

        h.wait_snapshot(|_| !h.player.seeks.lock().is_empty()).await;
        let target = h.player.seeks.lock()[0];
        assert!(
            (99.0..102.0).contains(&target),
            "expected seek near the reference, got {target}"
        );
        // A hard resync resumes at base speed
        h.wait_snapshot(|_| !h.player.speeds.lock().is_empty()).await;
        assert_eq!(h.player.speeds.lock()[0], 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_correction_forces_error_state() {
        let mut h = start_harness();
        h.establish("room1").await;
        h.load_to_ready("e1", "src://e1").await;

        h.player.fail_speed.store(true, Ordering::SeqCst);
        h.relay_tx
            .send(RelayEvent::ReferencePosition(ReferenceUpdate {
                entry_id: "e1".to_string(),
                position_secs: 100.0,
                source_participant: "host".to_string(),
            }))
            .unwrap();
        *h.player.position_secs.lock() = 103.0;

        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Error, .. })
        })
        .await;
        h.next_event(|e| matches!(e, CoordinatorEvent::PlayerError(_))).await;
        h.wait_snapshot(|s| s.ready.get("local") == Some(&ReadyState::Error)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_change_commits_after_broadcast_ack() {
        let mut h = start_harness();

        let handle = h.handle.clone();
        let request = tokio::spawn(async move {
            handle
                .request_settings_change(
                    SettingsScope::Server,
                    PartialSettings {
                        playback_speed: Some(1.25),
                        ..Default::default()
                    },
                )
                .await
        });

        let payload = h.ack_next_broadcast(true).await;
        assert!(matches!(payload, BroadcastPayload::SettingsChange { .. }));

        let effective = request.await.unwrap().unwrap();
        assert_eq!(effective.playback_speed, 1.25);
        assert_eq!(h.settings.server().playback_speed, 1.25);
        h.next_event(|e| matches!(e, CoordinatorEvent::SettingsChanged { .. })).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_change_rejected_by_relay_is_not_committed() {
        let mut h = start_harness();

        let handle = h.handle.clone();
        let request = tokio::spawn(async move {
            handle
                .request_settings_change(
                    SettingsScope::Server,
                    PartialSettings {
                        playback_speed: Some(1.25),
                        ..Default::default()
                    },
                )
                .await
        });

        h.ack_next_broadcast(false).await;

        let result = request.await.unwrap();
        assert!(matches!(result, Err(CoordinatorError::Broadcast(_))));
        assert_eq!(h.settings.server().playback_speed, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_settings_change_rejected_without_broadcast() {
        let mut h = start_harness();

        let result = h
            .handle
            .request_settings_change(
                SettingsScope::Server,
                PartialSettings {
                    playback_speed: Some(5.0),
                    ..Default::default()
                },
            )
            .await;

        assert!(matches!(result, Err(CoordinatorError::Settings(_))));
        h.drain_events().await;
        assert!(h.relay_cmds.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_settings_change_applies_and_notifies() {
        let mut h = start_harness();

        h.relay_tx
            .send(RelayEvent::RemoteSettingsChanged {
                scope: SettingsScope::Server,
                settings: PartialSettings {
                    desync_tolerance: Some(2.5),
                    ..Default::default()
                },
            })
            .unwrap();

        h.next_event(|e| matches!(e, CoordinatorEvent::SettingsChanged { .. })).await;
        assert_eq!(h.settings.server().desync_tolerance, 2.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_participants_populate_trackers() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.relay_tx
            .send(RelayEvent::RemotePresence(PresenceUpdate {
                participant_id: "bob".to_string(),
                online: true,
                ping_ms: Some(40),
            }))
            .unwrap();
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ParticipantJoined { participant_id } if participant_id == "bob")
        })
        .await;

        h.relay_tx
            .send(RelayEvent::RemoteReadyState {
                room_id: "room1".to_string(),
                participant_id: "bob".to_string(),
                state: ReadyState::Ready,
            })
            .unwrap();
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { participant_id, state: ReadyState::Ready } if participant_id == "bob")
        })
        .await;

        h.wait_snapshot(|s| {
            s.ready.get("bob") == Some(&ReadyState::Ready)
                && s.pings.get("bob") == Some(&Some(40))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_for_left_room_are_discarded() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.handle.request_leave().unwrap();
        h.expect_connection(ConnectionState::Disconnecting).await;
        assert!(matches!(h.next_relay_cmd().await, RelayCommand::Leave));
        h.relay_tx.send(RelayEvent::LeaveAck { success: true }).unwrap();
        h.expect_connection(ConnectionState::Disconnected).await;

        h.relay_tx
            .send(RelayEvent::RemoteReadyState {
                room_id: "room1".to_string(),
                participant_id: "bob".to_string(),
                state: ReadyState::Ready,
            })
            .unwrap();

        let drained = h.drain_events().await;
        assert!(
            drained
                .iter()
                .all(|e| !matches!(e, CoordinatorEvent::ReadyChanged { .. })),
            "ready update for a left room leaked through: {drained:?}"
        );
        assert!(!h.handle.snapshot().ready.contains_key("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_completion_after_leave_is_discarded() {
        let mut h = start_harness();
        h.establish("room1").await;

        h.player.hold_loads.store(true, Ordering::SeqCst);
        h.handle.load_entry("e1", "src://e1").unwrap();
        h.next_event(|e| {
            matches!(e, CoordinatorEvent::ReadyChanged { state: ReadyState::Loading, .. })
        })
        .await;
        h.ack_next_broadcast(true).await;

        // Leave while the load is still in flight
        h.handle.request_leave().unwrap();
        h.expect_connection(ConnectionState::Disconnecting).await;
        assert!(matches!(h.next_relay_cmd().await, RelayCommand::Leave));
        h.relay_tx.send(RelayEvent::LeaveAck { success: true }).unwrap();
        h.expect_connection(ConnectionState::Disconnected).await;

        // The detached load finishes; its completion must die quietly
        h.player.release_loads.notify_one();
        let drained = h.drain_events().await;
        assert!(
            drained
                .iter()
                .all(|e| !matches!(e, CoordinatorEvent::ReadyChanged { .. })),
            "detached load completion leaked through: {drained:?}"
        );
        assert_eq!(
            h.handle.snapshot().ready.get("local"),
            Some(&ReadyState::NotReady)
        );
    }
}
