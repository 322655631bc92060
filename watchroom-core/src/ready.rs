//! Readiness tracking
//!
//! Per-room map of participant readiness. Local transitions come from
//! user toggles and player load outcomes; remote states only ever come
//! from relay broadcasts. The tracker is mutated exclusively by the room
//! manager's event handlers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A participant's readiness for synchronized playback of the current entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyState {
    NotReady,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadyError {
    #[error("cannot toggle readiness while a load is in progress")]
    ToggleWhileLoading,

    #[error("cannot toggle readiness while the player is in error; retry the load first")]
    ToggleWhileError,

    #[error("no failed load to retry")]
    NothingToRetry,
}

/// Who is holding the room up, from the local participant's point of view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadySummary {
    pub loading: Vec<String>,
    pub not_ready: Vec<String>,
    pub errored: Vec<String>,
}

impl ReadySummary {
    pub fn is_empty(&self) -> bool {
        self.loading.is_empty() && self.not_ready.is_empty() && self.errored.is_empty()
    }
}

#[derive(Debug)]
struct ReadyEntry {
    state: ReadyState,
    /// Participants can opt out of the readiness aggregate (spectators)
    ready_opt_in: bool,
}

impl ReadyEntry {
    fn new() -> Self {
        Self {
            state: ReadyState::NotReady,
            ready_opt_in: true,
        }
    }
}

/// Per-room readiness map. Every participant starts `NotReady`.
pub struct ReadyStateTracker {
    local_id: String,
    entries: HashMap<String, ReadyEntry>,
    /// Entry id and source of the last local load, kept for retry
    last_load: Option<(String, String)>,
}

impl ReadyStateTracker {
    pub fn new(local_id: impl Into<String>) -> Self {
        let local_id = local_id.into();
        let mut entries = HashMap::new();
        entries.insert(local_id.clone(), ReadyEntry::new());
        Self {
            local_id,
            entries,
            last_load: None,
        }
    }

    /// Register a participant observed in the room.
    /// Returns true if the participant was not tracked before.
    pub fn insert_participant(&mut self, participant_id: &str) -> bool {
        if self.entries.contains_key(participant_id) {
            return false;
        }
        self.entries
            .insert(participant_id.to_string(), ReadyEntry::new());
        true
    }

    pub fn remove_participant(&mut self, participant_id: &str) {
        if participant_id != self.local_id {
            self.entries.remove(participant_id);
        }
    }

    pub fn local_state(&self) -> ReadyState {
        self.entries
            .get(&self.local_id)
            .map(|e| e.state)
            .unwrap_or(ReadyState::NotReady)
    }

    pub fn state_of(&self, participant_id: &str) -> Option<ReadyState> {
        self.entries.get(participant_id).map(|e| e.state)
    }

    /// Flip the local participant between NotReady and Ready. Not allowed
    /// while Loading or Error. Returns the new state; the caller is
    /// responsible for broadcasting it and calling [`Self::set_local`] back
    /// to the previous state if the broadcast fails.
    pub fn toggle_local(&mut self) -> Result<ReadyState, ReadyError> {
        let new_state = match self.local_state() {
            ReadyState::NotReady => ReadyState::Ready,
            ReadyState::Ready => ReadyState::NotReady,
            ReadyState::Loading => return Err(ReadyError::ToggleWhileLoading),
            ReadyState::Error => return Err(ReadyError::ToggleWhileError),
        };
        self.set_local(new_state);
        Ok(new_state)
    }

    /// Force the local state (toggle rollback, correction failure policy,
    /// reload transitions).
    pub fn set_local(&mut self, state: ReadyState) {
        self.entries
            .entry(self.local_id.clone())
            .or_insert_with(ReadyEntry::new)
            .state = state;
    }

    /// Opt the local participant in or out of the readiness aggregate.
    pub fn set_local_opt_in(&mut self, opt_in: bool) {
        self.entries
            .entry(self.local_id.clone())
            .or_insert_with(ReadyEntry::new)
            .ready_opt_in = opt_in;
    }

    pub fn local_opt_in(&self) -> bool {
        self.entries
            .get(&self.local_id)
            .map(|e| e.ready_opt_in)
            .unwrap_or(true)
    }

    /// A load of `entry_id` was issued to the player.
    pub fn on_load_start(&mut self, entry_id: &str, source: &str) {
        self.last_load = Some((entry_id.to_string(), source.to_string()));
        self.set_local(ReadyState::Loading);
    }

    /// The player finished (or failed) the outstanding load. Returns the
    /// resulting local state.
    pub fn on_load_result(&mut self, success: bool) -> ReadyState {
        let state = if success {
            if self.local_opt_in() {
                ReadyState::Ready
            } else {
                ReadyState::NotReady
            }
        } else {
            ReadyState::Error
        };
        self.set_local(state);
        state
    }

    /// Re-issue the last failed load. Valid only from Error; returns the
    /// stored entry id and source and moves the local state to Loading.
    pub fn retry_load(&mut self) -> Result<(String, String), ReadyError> {
        if self.local_state() != ReadyState::Error {
            return Err(ReadyError::NothingToRetry);
        }
        let (entry_id, source) = self.last_load.clone().ok_or(ReadyError::NothingToRetry)?;
        self.set_local(ReadyState::Loading);
        Ok((entry_id, source))
    }

    /// Apply a ready state broadcast by a remote participant. Echoes of
    /// our own broadcasts are ignored.
    pub fn on_remote(&mut self, participant_id: &str, state: ReadyState) {
        if participant_id == self.local_id {
            return;
        }
        self.entries
            .entry(participant_id.to_string())
            .or_insert_with(ReadyEntry::new)
            .state = state;
    }

    /// Which other participants are still holding playback up.
    pub fn summary(&self) -> ReadySummary {
        let mut summary = ReadySummary::default();
        for (id, entry) in &self.entries {
            if id == &self.local_id || !entry.ready_opt_in {
                continue;
            }
            match entry.state {
                ReadyState::Loading => summary.loading.push(id.clone()),
                ReadyState::NotReady => summary.not_ready.push(id.clone()),
                ReadyState::Error => summary.errored.push(id.clone()),
                ReadyState::Ready => {}
            }
        }
        summary.loading.sort();
        summary.not_ready.sort();
        summary.errored.sort();
        summary
    }

    /// Room-wide readiness: every participant who has not opted out is
    /// Ready. Read-only; starting playback is the presentation layer's call.
    pub fn room_ready(&self) -> bool {
        self.entries
            .values()
            .filter(|e| e.ready_opt_in)
            .all(|e| e.state == ReadyState::Ready)
    }

    pub fn states(&self) -> HashMap<String, ReadyState> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.state))
            .collect()
    }

    /// Drop the per-room state: remote participants are forgotten and the
    /// local participant returns to NotReady. The local opt-in flag is a
    /// user preference and survives.
    pub fn reset(&mut self) {
        let local_id = self.local_id.clone();
        self.entries.retain(|id, _| id == &local_id);
        self.entries
            .entry(local_id)
            .or_insert_with(ReadyEntry::new)
            .state = ReadyState::NotReady;
        self.last_load = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_everyone_starts_not_ready() {
        let mut tracker = ReadyStateTracker::new("local");
        tracker.insert_participant("remote");

        assert_eq!(tracker.local_state(), ReadyState::NotReady);
        assert_eq!(tracker.state_of("remote"), Some(ReadyState::NotReady));
        assert!(!tracker.room_ready());
    }

    #[test]
    fn test_toggle_round_trips() {
        let mut tracker = ReadyStateTracker::new("local");

        assert_eq!(tracker.toggle_local().unwrap(), ReadyState::Ready);
        assert_eq!(tracker.toggle_local().unwrap(), ReadyState::NotReady);
        assert_eq!(tracker.local_state(), ReadyState::NotReady);
    }

    #[test]
    fn test_toggle_rejected_while_loading_or_error() {
        let mut tracker = ReadyStateTracker::new("local");
        tracker.on_load_start("e1", "src");
        assert_eq!(tracker.toggle_local(), Err(ReadyError::ToggleWhileLoading));

        tracker.on_load_result(false);
        assert_eq!(tracker.toggle_local(), Err(ReadyError::ToggleWhileError));
    }

    #[test]
    fn test_load_lifecycle_and_retry() {
        let mut tracker = ReadyStateTracker::new("local");

        tracker.on_load_start("e1", "src://e1");
        assert_eq!(tracker.local_state(), ReadyState::Loading);

        assert_eq!(tracker.on_load_result(false), ReadyState::Error);

        let (entry, source) = tracker.retry_load().unwrap();
        assert_eq!(entry, "e1");
        assert_eq!(source, "src://e1");
        assert_eq!(tracker.local_state(), ReadyState::Loading);

        assert_eq!(tracker.on_load_result(true), ReadyState::Ready);
        assert_eq!(tracker.retry_load(), Err(ReadyError::NothingToRetry));
    }

    #[test]
    fn test_load_success_respects_opt_out() {
        let mut tracker = ReadyStateTracker::new("local");
        tracker.set_local_opt_in(false);
        tracker.on_load_start("e1", "src");
        assert_eq!(tracker.on_load_result(true), ReadyState::NotReady);
    }

    #[test]
    fn test_room_ready_ignores_opted_out() {
        let mut tracker = ReadyStateTracker::new("local");
        tracker.insert_participant("spectator");
        tracker.insert_participant("viewer");

        tracker.set_local(ReadyState::Ready);
        tracker.on_remote("viewer", ReadyState::Ready);
        assert!(!tracker.room_ready());

        // Spectator never gets ready, but opted out it no longer counts
        tracker
            .entries
            .get_mut("spectator")
            .unwrap()
            .ready_opt_in = false;
        assert!(tracker.room_ready());
    }

    #[test]
    fn test_summary_excludes_local_and_ready() {
        let mut tracker = ReadyStateTracker::new("local");
        tracker.insert_participant("a");
        tracker.insert_participant("b");
        tracker.insert_participant("c");
        tracker.on_remote("a", ReadyState::Loading);
        tracker.on_remote("b", ReadyState::Error);
        tracker.on_remote("c", ReadyState::Ready);

        let summary = tracker.summary();
        assert_eq!(summary.loading, vec!["a".to_string()]);
        assert_eq!(summary.errored, vec!["b".to_string()]);
        assert!(summary.not_ready.is_empty());
    }

    #[test]
    fn test_reset_drops_remote_participants() {
        let mut tracker = ReadyStateTracker::new("local");
        tracker.insert_participant("bob");
        tracker.on_remote("bob", ReadyState::Ready);
        tracker.set_local(ReadyState::Ready);

        tracker.reset();
        assert_eq!(tracker.local_state(), ReadyState::NotReady);
        assert_eq!(tracker.state_of("bob"), None);
    }

    #[test]
    fn test_remote_echo_of_local_ignored() {
        let mut tracker = ReadyStateTracker::new("local");
        tracker.set_local(ReadyState::Ready);
        tracker.on_remote("local", ReadyState::NotReady);
        assert_eq!(tracker.local_state(), ReadyState::Ready);
    }
}
