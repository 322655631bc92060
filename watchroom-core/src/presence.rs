//! Participant presence and latency tracking
//!
//! Maps participants to online/offline and keeps a short window of
//! round-trip-time samples per participant. A participant's ping stays
//! unknown until the first measurement arrives. Entries persist across
//! reconnects; they are only dropped on explicit permanent removal.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Number of RTT samples to keep for averaging
const RTT_SAMPLE_COUNT: usize = 5;

/// Pending pings older than this are dropped
const PENDING_PING_TTL: Duration = Duration::from_secs(10);

/// A participant is considered offline after this long without a liveness signal
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);

/// RTT history for a single participant
#[derive(Debug)]
struct RttWindow {
    samples: Vec<u64>,
    avg_rtt_ms: u64,
}

impl RttWindow {
    fn new(first_sample: u64) -> Self {
        let mut window = Self {
            samples: Vec::with_capacity(RTT_SAMPLE_COUNT),
            avg_rtt_ms: first_sample,
        };
        window.add_sample(first_sample);
        window
    }

    fn add_sample(&mut self, rtt_ms: u64) {
        if self.samples.len() >= RTT_SAMPLE_COUNT {
            self.samples.remove(0);
        }
        self.samples.push(rtt_ms);
        let sum: u64 = self.samples.iter().sum();
        self.avg_rtt_ms = sum / self.samples.len() as u64;
    }

    fn one_way_ms(&self) -> u64 {
        self.avg_rtt_ms / 2
    }
}

#[derive(Debug)]
struct PresenceEntry {
    online: bool,
    rtt: Option<RttWindow>,
    last_seen: Instant,
}

impl PresenceEntry {
    fn new(online: bool) -> Self {
        Self {
            online,
            rtt: None,
            last_seen: Instant::now(),
        }
    }
}

/// Tracks online state and ping per participant, independent of room
/// membership.
#[derive(Default)]
pub struct PresenceTracker {
    /// Pings awaiting acknowledgement, keyed by sent-at timestamp
    pending_pings: HashMap<u64, Instant>,
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a participant online, creating the entry if it is new.
    /// Returns true if the participant was not known before.
    pub fn set_online(&mut self, participant_id: &str) -> bool {
        match self.entries.get_mut(participant_id) {
            Some(entry) => {
                entry.online = true;
                entry.last_seen = Instant::now();
                false
            }
            None => {
                self.entries
                    .insert(participant_id.to_string(), PresenceEntry::new(true));
                true
            }
        }
    }

    /// Mark a participant offline. The entry and its ping history survive.
    pub fn set_offline(&mut self, participant_id: &str) {
        if let Some(entry) = self.entries.get_mut(participant_id) {
            entry.online = false;
        }
    }

    /// Permanently remove a participant (account deletion, explicit removal).
    pub fn remove(&mut self, participant_id: &str) {
        self.entries.remove(participant_id);
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.entries
            .get(participant_id)
            .map(|e| e.online)
            .unwrap_or(false)
    }

    /// Last-known average ping (round trip, ms). None until the first
    /// measurement.
    pub fn ping_ms(&self, participant_id: &str) -> Option<u64> {
        self.entries
            .get(participant_id)?
            .rtt
            .as_ref()
            .map(|w| w.avg_rtt_ms)
    }

    /// Estimated one-way latency to a participant, zero when unmeasured.
    pub fn one_way_ms(&self, participant_id: &str) -> u64 {
        self.entries
            .get(participant_id)
            .and_then(|e| e.rtt.as_ref())
            .map(|w| w.one_way_ms())
            .unwrap_or(0)
    }

    /// Record an RTT measurement reported by the relay for a participant.
    pub fn record_rtt(&mut self, participant_id: &str, rtt_ms: u64) {
        let entry = self
            .entries
            .entry(participant_id.to_string())
            .or_insert_with(|| PresenceEntry::new(true));
        entry.last_seen = Instant::now();
        match entry.rtt.as_mut() {
            Some(window) => window.add_sample(rtt_ms),
            None => entry.rtt = Some(RttWindow::new(rtt_ms)),
        }
    }

    /// Refresh a participant's liveness without touching its ping.
    pub fn mark_seen(&mut self, participant_id: &str) {
        if let Some(entry) = self.entries.get_mut(participant_id) {
            entry.last_seen = Instant::now();
            entry.online = true;
        }
    }

    /// Register an outgoing ping. Returns the timestamp to send with it.
    pub fn create_ping(&mut self) -> u64 {
        let now = Instant::now();
        let timestamp_ms = now_unix_ms();

        self.pending_pings.insert(timestamp_ms, now);
        self.pending_pings
            .retain(|_, sent_at| sent_at.elapsed() < PENDING_PING_TTL);

        timestamp_ms
    }

    /// Resolve a ping acknowledgement for the given participant. Returns
    /// the measured RTT if the timestamp was still pending.
    pub fn handle_pong(&mut self, participant_id: &str, sent_at_ms: u64) -> Option<u64> {
        let sent_at = self.pending_pings.remove(&sent_at_ms)?;
        let rtt_ms = sent_at.elapsed().as_millis() as u64;
        self.record_rtt(participant_id, rtt_ms);

        tracing::debug!(
            "Ping {}: RTT={}ms, avg={}ms",
            participant_id,
            rtt_ms,
            self.ping_ms(participant_id).unwrap_or(0)
        );

        Some(rtt_ms)
    }

    /// Participants whose liveness signal has gone quiet.
    pub fn stale_participants(&self, timeout: Duration) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.online && e.last_seen.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget outstanding pings (when a session ends).
    pub fn clear_pending(&mut self) {
        self.pending_pings.clear();
    }

    /// All currently known participant ids with their ping.
    pub fn pings(&self) -> HashMap<String, Option<u64>> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.rtt.as_ref().map(|w| w.avg_rtt_ms)))
            .collect()
    }
}

/// Current time in milliseconds since UNIX epoch
pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_unknown_until_first_measurement() {
        let mut tracker = PresenceTracker::new();
        tracker.set_online("alice");

        assert!(tracker.is_online("alice"));
        assert_eq!(tracker.ping_ms("alice"), None);
        assert_eq!(tracker.one_way_ms("alice"), 0);
    }

    #[test]
    fn test_pong_roundtrip_records_rtt() {
        let mut tracker = PresenceTracker::new();
        tracker.set_online("local");

        let ts = tracker.create_ping();
        std::thread::sleep(Duration::from_millis(20));
        let rtt = tracker.handle_pong("local", ts);

        assert!(rtt.is_some());
        assert!(rtt.unwrap() >= 20);
        assert!(tracker.ping_ms("local").unwrap() >= 20);

        // A second ack for the same timestamp is not pending anymore
        assert!(tracker.handle_pong("local", ts).is_none());
    }

    #[test]
    fn test_rtt_averaging_window() {
        let mut tracker = PresenceTracker::new();
        tracker.record_rtt("bob", 100);
        tracker.record_rtt("bob", 200);
        tracker.record_rtt("bob", 150);

        assert_eq!(tracker.ping_ms("bob"), Some(150));
        assert_eq!(tracker.one_way_ms("bob"), 75);

        // Window holds the most recent RTT_SAMPLE_COUNT samples
        for _ in 0..RTT_SAMPLE_COUNT {
            tracker.record_rtt("bob", 50);
        }
        assert_eq!(tracker.ping_ms("bob"), Some(50));
    }

    #[test]
    fn test_offline_preserves_ping_history() {
        let mut tracker = PresenceTracker::new();
        tracker.record_rtt("carol", 80);
        tracker.set_offline("carol");

        assert!(!tracker.is_online("carol"));
        assert_eq!(tracker.ping_ms("carol"), Some(80));

        tracker.remove("carol");
        assert_eq!(tracker.ping_ms("carol"), None);
    }
}
