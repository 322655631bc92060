//! Desync correction
//!
//! Maps a desync classification to a corrective action and tracks the
//! single in-flight player command. The room manager executes the
//! commands this module decides on and reports their completion back;
//! the actuator only ever corrects the local participant.

use tracing::debug;

use crate::desync::{DesyncEvent, DesyncSeverity};
use crate::settings::PlaybackSettings;

/// A correction decision. Represents intent, not state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionAction {
    /// Nothing to correct
    None,
    /// Temporarily change playback speed by this signed delta
    SpeedNudge(f64),
    /// Seek to the reference position and resume at base speed
    HardResync(f64),
}

/// A player command the manager must execute for a correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionCommand {
    /// Set the absolute playback speed
    SetSpeed(f64),
    /// Seek to the target position, then restore the base speed
    Resync { target_secs: f64, base_speed: f64 },
}

/// Decide the corrective action for one desync event. Pure mapping from
/// `(severity, offset sign)` to action; `reference_secs` is the position a
/// hard resync would jump to.
pub fn decide(
    event: &DesyncEvent,
    settings: &PlaybackSettings,
    reference_secs: f64,
) -> CorrectionAction {
    match event.severity {
        DesyncSeverity::InSync => CorrectionAction::None,
        DesyncSeverity::Minor => {
            if event.offset_secs > 0.0 {
                // Ahead: slow down and let the room catch up
                CorrectionAction::SpeedNudge(-settings.minor_desync_playback_slow)
            } else {
                // Behind: speed up to close the gap
                CorrectionAction::SpeedNudge(settings.minor_desync_playback_change)
            }
        }
        DesyncSeverity::Major => CorrectionAction::HardResync(reference_secs),
    }
}

/// Tracks nudge and in-flight state for the local participant.
pub struct CorrectionActuator {
    /// A player command is outstanding; new classifications are ignored
    /// until it completes
    in_flight: bool,
    /// A speed nudge is currently applied
    nudge_active: bool,
}

impl CorrectionActuator {
    pub fn new() -> Self {
        Self {
            in_flight: false,
            nudge_active: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn nudge_active(&self) -> bool {
        self.nudge_active
    }

    /// Turn an action into the player command to execute, updating the
    /// nudge/in-flight bookkeeping. Returns None when nothing needs to be
    /// done: the participant is in sync with no nudge to cancel, or a
    /// previous command is still outstanding.
    pub fn apply(
        &mut self,
        action: CorrectionAction,
        settings: &PlaybackSettings,
    ) -> Option<CorrectionCommand> {
        if self.in_flight {
            debug!("Correction skipped, previous command still in flight");
            return None;
        }

        match action {
            CorrectionAction::None => {
                if !self.nudge_active {
                    return None;
                }
                // Back in sync: restore the base speed exactly once
                self.nudge_active = false;
                self.in_flight = true;
                Some(CorrectionCommand::SetSpeed(settings.playback_speed))
            }
            CorrectionAction::SpeedNudge(delta) => {
                self.nudge_active = true;
                self.in_flight = true;
                Some(CorrectionCommand::SetSpeed(settings.playback_speed + delta))
            }
            CorrectionAction::HardResync(target_secs) => {
                self.nudge_active = false;
                self.in_flight = true;
                Some(CorrectionCommand::Resync {
                    target_secs,
                    base_speed: settings.playback_speed,
                })
            }
        }
    }

    /// The outstanding player command finished. On failure the caller
    /// surfaces a persistent error and forces the local ready state to
    /// Error; the actuator never retries on its own.
    pub fn complete(&mut self, success: bool) {
        self.in_flight = false;
        if !success {
            self.nudge_active = false;
        }
    }

    /// Forget any outstanding command (room teardown). A late completion
    /// is discarded by the manager's epoch check.
    pub fn reset(&mut self) {
        self.in_flight = false;
        self.nudge_active = false;
    }
}

impl Default for CorrectionActuator {
    fn default() -> Self {
        Self::new()
    }
}
