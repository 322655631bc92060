//! Playback Settings
//!
//! Tunables governing desync classification and correction, held at two
//! scopes: a server-wide default and optional per-room overrides. A room
//! override sets a subset of fields; the rest fall through to the server
//! defaults. Every mutation is validated against the merged result and is
//! all-or-nothing.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Allowed playback speed range
pub const SPEED_MIN: f64 = 1.0;
pub const SPEED_MAX: f64 = 2.0;

/// Allowed desync tolerance range (seconds)
pub const TOLERANCE_MIN: f64 = 1.0;
pub const TOLERANCE_MAX: f64 = 3.0;

/// Allowed major-desync threshold range (seconds)
pub const MAJOR_MIN: f64 = 4.0;
pub const MAJOR_MAX: f64 = 10.0;

/// Allowed minor-correction speed delta range
pub const DELTA_MIN: f64 = 0.01;
pub const DELTA_MAX: f64 = 0.10;

/// Effective playback settings for a room.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Base playback speed everyone runs at
    pub playback_speed: f64,
    /// Maximum divergence (seconds) still considered in sync
    pub desync_tolerance: f64,
    /// Minimum divergence (seconds) classified as major
    pub major_desync_min: f64,
    /// Speed delta subtracted to slow a participant running ahead
    pub minor_desync_playback_slow: f64,
    /// Speed delta added to speed up a participant running behind
    pub minor_desync_playback_change: f64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            playback_speed: 1.0,
            desync_tolerance: 2.0,
            major_desync_min: 5.0,
            minor_desync_playback_slow: 0.05,
            minor_desync_playback_change: 0.05,
        }
    }
}

/// A partial settings update: only the present fields change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialSettings {
    pub playback_speed: Option<f64>,
    pub desync_tolerance: Option<f64>,
    pub major_desync_min: Option<f64>,
    pub minor_desync_playback_slow: Option<f64>,
    pub minor_desync_playback_change: Option<f64>,
}

impl PartialSettings {
    /// Merge this partial over a base, field by field.
    pub fn merged_over(&self, base: &PlaybackSettings) -> PlaybackSettings {
        PlaybackSettings {
            playback_speed: self.playback_speed.unwrap_or(base.playback_speed),
            desync_tolerance: self.desync_tolerance.unwrap_or(base.desync_tolerance),
            major_desync_min: self.major_desync_min.unwrap_or(base.major_desync_min),
            minor_desync_playback_slow: self
                .minor_desync_playback_slow
                .unwrap_or(base.minor_desync_playback_slow),
            minor_desync_playback_change: self
                .minor_desync_playback_change
                .unwrap_or(base.minor_desync_playback_change),
        }
    }

    /// Overlay another partial on top of this one.
    fn overlaid(&self, update: &PartialSettings) -> PartialSettings {
        PartialSettings {
            playback_speed: update.playback_speed.or(self.playback_speed),
            desync_tolerance: update.desync_tolerance.or(self.desync_tolerance),
            major_desync_min: update.major_desync_min.or(self.major_desync_min),
            minor_desync_playback_slow: update
                .minor_desync_playback_slow
                .or(self.minor_desync_playback_slow),
            minor_desync_playback_change: update
                .minor_desync_playback_change
                .or(self.minor_desync_playback_change),
        }
    }
}

/// Which scope a settings change applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingsScope {
    Server,
    Room { room_id: String },
}

/// Validation failures for settings updates.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("desync tolerance {tolerance}s must be below major desync threshold {major}s")]
    ToleranceNotBelowMajor { tolerance: f64, major: f64 },
}

/// Notification emitted on every committed change.
#[derive(Debug, Clone)]
pub struct SettingsChange {
    pub scope: SettingsScope,
    /// Effective settings for the changed scope after the commit
    pub effective: PlaybackSettings,
}

fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), SettingsError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(SettingsError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// Validate a fully merged settings value.
pub fn validate(settings: &PlaybackSettings) -> Result<(), SettingsError> {
    if settings.desync_tolerance >= settings.major_desync_min {
        return Err(SettingsError::ToleranceNotBelowMajor {
            tolerance: settings.desync_tolerance,
            major: settings.major_desync_min,
        });
    }

    check_range("playback_speed", settings.playback_speed, SPEED_MIN, SPEED_MAX)?;
    check_range(
        "desync_tolerance",
        settings.desync_tolerance,
        TOLERANCE_MIN,
        TOLERANCE_MAX,
    )?;
    check_range(
        "major_desync_min",
        settings.major_desync_min,
        MAJOR_MIN,
        MAJOR_MAX,
    )?;
    check_range(
        "minor_desync_playback_slow",
        settings.minor_desync_playback_slow,
        DELTA_MIN,
        DELTA_MAX,
    )?;
    check_range(
        "minor_desync_playback_change",
        settings.minor_desync_playback_change,
        DELTA_MIN,
        DELTA_MAX,
    )?;

    Ok(())
}

struct Inner {
    server: PlaybackSettings,
    rooms: HashMap<String, PartialSettings>,
    subscribers: Vec<mpsc::UnboundedSender<SettingsChange>>,
}

/// Two-scope settings store with change notification fan-out.
pub struct SettingsStore {
    inner: RwLock<Inner>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::with_server_defaults(PlaybackSettings::default())
    }

    pub fn with_server_defaults(server: PlaybackSettings) -> Self {
        Self {
            inner: RwLock::new(Inner {
                server,
                rooms: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Subscribe to committed changes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SettingsChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().subscribers.push(tx);
        rx
    }

    /// Server-default settings.
    pub fn server(&self) -> PlaybackSettings {
        self.inner.read().server
    }

    /// Effective settings for a room: the room's override merged over the
    /// server defaults. Unknown rooms get the server defaults.
    pub fn effective(&self, room_id: Option<&str>) -> PlaybackSettings {
        let inner = self.inner.read();
        match room_id.and_then(|r| inner.rooms.get(r)) {
            Some(partial) => partial.merged_over(&inner.server),
            None => inner.server,
        }
    }

    /// Validate a candidate update without committing it. Returns the
    /// settings that would become effective for the scope.
    pub fn check(
        &self,
        scope: &SettingsScope,
        update: &PartialSettings,
    ) -> Result<PlaybackSettings, SettingsError> {
        let inner = self.inner.read();
        let merged = match scope {
            SettingsScope::Server => update.merged_over(&inner.server),
            SettingsScope::Room { room_id } => inner
                .rooms
                .get(room_id)
                .copied()
                .unwrap_or_default()
                .overlaid(update)
                .merged_over(&inner.server),
        };
        validate(&merged)?;
        Ok(merged)
    }

    /// Validate and commit an update. No partial state survives a failure.
    pub fn set(
        &self,
        scope: &SettingsScope,
        update: &PartialSettings,
    ) -> Result<PlaybackSettings, SettingsError> {
        let effective = self.check(scope, update)?;

        let mut inner = self.inner.write();
        match scope {
            SettingsScope::Server => {
                inner.server = effective;
            }
            SettingsScope::Room { room_id } => {
                let merged_partial = inner
                    .rooms
                    .get(room_id)
                    .copied()
                    .unwrap_or_default()
                    .overlaid(update);
                inner.rooms.insert(room_id.clone(), merged_partial);
            }
        }

        let change = SettingsChange {
            scope: scope.clone(),
            effective,
        };
        inner.subscribers.retain(|tx| tx.send(change.clone()).is_ok());

        Ok(effective)
    }

    /// Drop a room's override entirely.
    pub fn clear_room(&self, room_id: &str) {
        self.inner.write().rooms.remove(room_id);
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}
