//! Desync detection
//!
//! Compares the local timeline position against the room's reference
//! position and classifies the divergence. The reference is whatever the
//! relay last broadcast for the active entry; the coordinator does not
//! elect a reference source itself. Broadcast positions are aged by the
//! time since they were received plus the estimated one-way latency to
//! their source before comparison.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::settings::PlaybackSettings;

/// Divergence classification, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DesyncSeverity {
    InSync,
    Minor,
    Major,
}

/// One measured divergence for one participant. Consumed immediately by
/// the correction actuator; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DesyncEvent {
    pub participant_id: String,
    /// Signed offset in seconds; positive = local is ahead of the reference
    pub offset_secs: f64,
    pub severity: DesyncSeverity,
}

/// Classify a signed offset against the effective settings.
pub fn classify(offset_secs: f64, settings: &PlaybackSettings) -> DesyncSeverity {
    let magnitude = offset_secs.abs();
    if magnitude <= settings.desync_tolerance {
        DesyncSeverity::InSync
    } else if magnitude < settings.major_desync_min {
        DesyncSeverity::Minor
    } else {
        DesyncSeverity::Major
    }
}

/// The most recent authoritative position broadcast for an entry.
#[derive(Debug, Clone)]
pub struct ReferencePosition {
    pub entry_id: String,
    pub position_secs: f64,
    pub source_participant: String,
    received_at: Instant,
}

impl ReferencePosition {
    /// Where the reference timeline should be now, assuming it kept
    /// advancing since the broadcast left its source.
    pub fn extrapolated_secs(&self, one_way_latency_ms: u64) -> f64 {
        self.position_secs
            + self.received_at.elapsed().as_secs_f64()
            + one_way_latency_ms as f64 / 1000.0
    }
}

/// Periodically invoked detector for the local participant.
pub struct DesyncDetector {
    local_id: String,
    reference: Option<ReferencePosition>,
}

impl DesyncDetector {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            reference: None,
        }
    }

    /// Record a reference position broadcast by the relay.
    pub fn on_reference_position(
        &mut self,
        entry_id: &str,
        position_secs: f64,
        source_participant: &str,
    ) {
        self.reference = Some(ReferencePosition {
            entry_id: entry_id.to_string(),
            position_secs,
            source_participant: source_participant.to_string(),
            received_at: Instant::now(),
        });
    }

    pub fn reference(&self) -> Option<&ReferencePosition> {
        self.reference.as_ref()
    }

    /// Forget the reference (entry change, room teardown).
    pub fn clear_reference(&mut self) {
        self.reference = None;
    }

    /// Compare the local position against the reference for the active
    /// entry. No reference, or a reference for another entry, yields no
    /// event: the participant is treated as in sync rather than corrected
    /// against stale data.
    pub fn sample(
        &self,
        active_entry: &str,
        local_position_secs: f64,
        one_way_latency_ms: u64,
        settings: &PlaybackSettings,
    ) -> Option<DesyncEvent> {
        let reference = self.reference.as_ref()?;
        if reference.entry_id != active_entry {
            return None;
        }

        let expected = reference.extrapolated_secs(one_way_latency_ms);
        let offset_secs = local_position_secs - expected;
        let severity = classify(offset_secs, settings);

        tracing::debug!(
            "Desync sample: offset {:+.2}s (local {:.2}s, expected {:.2}s) -> {:?}",
            offset_secs,
            local_position_secs,
            expected,
            severity
        );

        Some(DesyncEvent {
            participant_id: self.local_id.clone(),
            offset_secs,
            severity,
        })
    }
}
