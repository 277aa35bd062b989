//! Hit event accumulator. Both telemetry paths (push and poll) feed
//! normalized events into one pipeline instance, which rejects
//! stale/duplicate/post-goal events and derives splits and transitions.
//!
//! All mutation goes through `accept` on a single instance behind the
//! controller's mutex; the two sources never interleave their
//! read-modify-write of counters and history.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{EventKind, HitRecord, NormalizedEvent, SplitRecord, TransitionRecord};

/// The most recent accepted hit across all devices, used for transition
/// derivation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastHit {
    pub device_id: String,
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Why an event did or did not land. The rejecting outcomes are expected
/// operating conditions, not errors; the counters below keep them
/// distinguishable in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A hit was counted; `new_count` is the device's total afterwards.
    Counted { device_id: String, new_count: u32 },
    /// A start/busy marker moved the session anchor (or confirmed it).
    Ready,
    /// Event kind carries no session meaning.
    Ignored,
    /// Device-reported time predates the subscription; replayed cache.
    Stale,
    /// Exact repeat of an already-accepted hit (same device, same device
    /// timestamp); the poll path re-fetches the latest payload every tick.
    Duplicate,
    /// The device already reached its goal; late trigger discarded.
    AfterStop,
}

/// Drop/accept counters for diagnostics. Stale replay and non-monotonic
/// arrivals are tracked separately so a reconnect storm can be told apart
/// from out-of-order delivery.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDiagnostics {
    pub accepted_hits: u64,
    pub stale_drops: u64,
    pub duplicate_drops: u64,
    pub stopped_drops: u64,
    pub non_monotonic: u64,
    pub ignored_events: u64,
}

/// Read-only view of accumulated state, taken for summary building and for
/// the scheduler's activity scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub session_id: Option<String>,
    pub hit_counts: HashMap<String, u32>,
    pub hit_history: Vec<HitRecord>,
    pub hit_times_by_device: HashMap<String, Vec<DateTime<Utc>>>,
    pub splits: Vec<SplitRecord>,
    pub transitions: Vec<TransitionRecord>,
    pub session_anchor: Option<DateTime<Utc>>,
    pub diagnostics: PipelineDiagnostics,
}

#[derive(Debug)]
pub struct HitEventPipeline {
    session_id: Option<String>,
    /// Events reported before this instant are replayed cache, not live.
    subscription_started_at: DateTime<Utc>,
    hit_counts: HashMap<String, u32>,
    hit_history: Vec<HitRecord>,
    hit_times_by_device: HashMap<String, Vec<DateTime<Utc>>>,
    splits: Vec<SplitRecord>,
    transitions: Vec<TransitionRecord>,
    last_hit_by_device: HashMap<String, DateTime<Utc>>,
    last_hit: Option<LastHit>,
    /// Earliest ready marker across devices; aligns elapsed-time displays.
    session_anchor: Option<DateTime<Utc>>,
    ready_devices: HashSet<String>,
    diagnostics: PipelineDiagnostics,
    /// Set once the summary has been emitted; the pipeline is read-only
    /// from then on.
    frozen: bool,
}

impl HitEventPipeline {
    pub fn new() -> Self {
        Self {
            session_id: None,
            subscription_started_at: Utc::now(),
            hit_counts: HashMap::new(),
            hit_history: Vec::new(),
            hit_times_by_device: HashMap::new(),
            splits: Vec::new(),
            transitions: Vec::new(),
            last_hit_by_device: HashMap::new(),
            last_hit: None,
            session_anchor: None,
            ready_devices: HashSet::new(),
            diagnostics: PipelineDiagnostics::default(),
            frozen: false,
        }
    }

    /// Clear all state for a new session. Must run before the session's
    /// first event is accepted.
    pub fn reset(&mut self, session_id: String, subscription_started_at: DateTime<Utc>) {
        *self = Self::new();
        self.session_id = Some(session_id);
        self.subscription_started_at = subscription_started_at;
    }

    /// Advance the stale-filter watermark after the sources are re-opened
    /// mid-session (visibility resume). Counts and history are untouched;
    /// only the replay cutoff moves, and never backwards.
    pub fn mark_resubscribed(&mut self, at: DateTime<Utc>) {
        if at > self.subscription_started_at {
            self.subscription_started_at = at;
        }
    }

    /// Mark the pipeline read-only after summary emission.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn hit_count(&self, device_id: &str) -> u32 {
        self.hit_counts.get(device_id).copied().unwrap_or(0)
    }

    pub fn last_hit_by_device(&self) -> &HashMap<String, DateTime<Utc>> {
        &self.last_hit_by_device
    }

    pub fn diagnostics(&self) -> PipelineDiagnostics {
        self.diagnostics
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            session_id: self.session_id.clone(),
            hit_counts: self.hit_counts.clone(),
            hit_history: self.hit_history.clone(),
            hit_times_by_device: self.hit_times_by_device.clone(),
            splits: self.splits.clone(),
            transitions: self.transitions.clone(),
            session_anchor: self.session_anchor,
            diagnostics: self.diagnostics,
        }
    }

    /// Apply one normalized event. `stopped` is the set of devices whose
    /// goal has been reached; their late triggers are discarded here.
    pub fn accept(
        &mut self,
        event: &NormalizedEvent,
        device_name: &str,
        stopped: &HashSet<String>,
    ) -> AcceptOutcome {
        if self.frozen {
            return AcceptOutcome::Ignored;
        }

        match event.kind {
            EventKind::Start | EventKind::Busy => {
                return self.mark_ready(&event.device_id, event.timestamp);
            }
            EventKind::Other => {
                self.diagnostics.ignored_events += 1;
                return AcceptOutcome::Ignored;
            }
            EventKind::Hit => {}
        }

        if event.timestamp < self.subscription_started_at {
            self.diagnostics.stale_drops += 1;
            return AcceptOutcome::Stale;
        }

        if stopped.contains(&event.device_id) {
            self.diagnostics.stopped_drops += 1;
            return AcceptOutcome::AfterStop;
        }

        // The pull path re-delivers the latest payload once per tick until
        // a newer one replaces it. An exact repeat of a device timestamp is
        // that redelivery, not a second trigger.
        if self
            .hit_times_by_device
            .get(&event.device_id)
            .map(|times| times.contains(&event.timestamp))
            .unwrap_or(false)
        {
            self.diagnostics.duplicate_drops += 1;
            return AcceptOutcome::Duplicate;
        }

        let count = self.hit_counts.entry(event.device_id.clone()).or_insert(0);
        *count += 1;
        let new_count = *count;
        self.diagnostics.accepted_hits += 1;

        self.hit_history.push(HitRecord {
            device_id: event.device_id.clone(),
            device_name: device_name.to_string(),
            timestamp: event.timestamp,
            session_id: self.session_id.clone().unwrap_or_default(),
        });
        self.hit_times_by_device
            .entry(event.device_id.clone())
            .or_default()
            .push(event.timestamp);

        self.derive_split(event, device_name);
        self.derive_transition(event, device_name);

        AcceptOutcome::Counted {
            device_id: event.device_id.clone(),
            new_count,
        }
    }

    /// Split: consecutive hits on the same device. Interval math requires a
    /// strictly later timestamp; an out-of-order hit still counted above but
    /// produces no split and leaves the device's watermark alone.
    fn derive_split(&mut self, event: &NormalizedEvent, device_name: &str) {
        match self.last_hit_by_device.get(&event.device_id) {
            Some(previous) if event.timestamp > *previous => {
                let delta_ms = (event.timestamp - *previous).num_milliseconds();
                self.splits.push(SplitRecord {
                    device_id: event.device_id.clone(),
                    device_name: device_name.to_string(),
                    split_number: self.splits.len() as u32 + 1,
                    time_secs: delta_ms as f64 / 1000.0,
                    timestamp: event.timestamp,
                });
                self.last_hit_by_device
                    .insert(event.device_id.clone(), event.timestamp);
            }
            Some(_) => {
                self.diagnostics.non_monotonic += 1;
            }
            None => {
                self.last_hit_by_device
                    .insert(event.device_id.clone(), event.timestamp);
            }
        }
    }

    /// Transition: most recent hit anywhere followed by a hit on a
    /// different device. Same monotonicity rule as splits.
    fn derive_transition(&mut self, event: &NormalizedEvent, device_name: &str) {
        if let Some(last) = &self.last_hit {
            if last.device_id != event.device_id && event.timestamp > last.timestamp {
                let delta_ms = (event.timestamp - last.timestamp).num_milliseconds();
                self.transitions.push(TransitionRecord {
                    from_device: last.device_id.clone(),
                    to_device: event.device_id.clone(),
                    from_device_name: last.device_name.clone(),
                    to_device_name: device_name.to_string(),
                    transition_number: self.transitions.len() as u32 + 1,
                    time_secs: delta_ms as f64 / 1000.0,
                    timestamp: event.timestamp,
                });
            }
        }

        let newer = self
            .last_hit
            .as_ref()
            .map(|last| event.timestamp >= last.timestamp)
            .unwrap_or(true);
        if newer {
            self.last_hit = Some(LastHit {
                device_id: event.device_id.clone(),
                device_name: device_name.to_string(),
                timestamp: event.timestamp,
            });
        }
    }

    /// Ready markers do not count; the earliest one per session anchors
    /// elapsed-time displays (minimum across devices, taken the first time
    /// each device reports ready).
    fn mark_ready(&mut self, device_id: &str, timestamp: DateTime<Utc>) -> AcceptOutcome {
        if self.ready_devices.insert(device_id.to_string()) {
            self.session_anchor = match self.session_anchor {
                Some(anchor) => Some(anchor.min(timestamp)),
                None => Some(timestamp),
            };
        }
        AcceptOutcome::Ready
    }
}

impl Default for HitEventPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn hit(device_id: &str, offset_secs: i64) -> NormalizedEvent {
        NormalizedEvent {
            device_id: device_id.to_string(),
            kind: EventKind::Hit,
            value: Some(json!("hit")),
            timestamp: t0() + Duration::seconds(offset_secs),
        }
    }

    fn marker(device_id: &str, kind: EventKind, offset_secs: i64) -> NormalizedEvent {
        NormalizedEvent {
            device_id: device_id.to_string(),
            kind,
            value: None,
            timestamp: t0() + Duration::seconds(offset_secs),
        }
    }

    fn pipeline() -> HitEventPipeline {
        let mut p = HitEventPipeline::new();
        p.reset("session-1".to_string(), t0());
        p
    }

    #[test]
    fn counts_equal_accepted_hits() {
        let mut p = pipeline();
        let none = HashSet::new();
        for offset in [1, 2, 3] {
            p.accept(&hit("d1", offset), "Alpha", &none);
        }
        p.accept(&hit("d2", 4), "Bravo", &none);

        assert_eq!(p.hit_count("d1"), 3);
        assert_eq!(p.hit_count("d2"), 1);
        assert_eq!(p.snapshot().hit_history.len(), 4);
        assert_eq!(p.diagnostics().accepted_hits, 4);
    }

    #[test]
    fn pre_subscription_events_are_complete_noops() {
        let mut p = pipeline();
        let none = HashSet::new();
        let outcome = p.accept(&hit("d1", -5), "Alpha", &none);

        assert_eq!(outcome, AcceptOutcome::Stale);
        assert_eq!(p.hit_count("d1"), 0);
        let snap = p.snapshot();
        assert!(snap.hit_history.is_empty());
        assert!(snap.splits.is_empty());
        assert!(snap.transitions.is_empty());
        assert_eq!(p.diagnostics().stale_drops, 1);
    }

    #[test]
    fn stopped_devices_are_frozen() {
        let mut p = pipeline();
        let none = HashSet::new();
        p.accept(&hit("d1", 1), "Alpha", &none);

        let mut stopped = HashSet::new();
        stopped.insert("d1".to_string());
        let outcome = p.accept(&hit("d1", 2), "Alpha", &stopped);

        assert_eq!(outcome, AcceptOutcome::AfterStop);
        assert_eq!(p.hit_count("d1"), 1);
        assert_eq!(p.diagnostics().stopped_drops, 1);
    }

    #[test]
    fn monotonic_input_yields_monotonic_split_numbering() {
        let mut p = pipeline();
        let none = HashSet::new();
        for offset in [1, 3, 6, 10] {
            p.accept(&hit("d1", offset), "Alpha", &none);
        }

        let splits = p.snapshot().splits;
        assert_eq!(splits.len(), 3);
        for (i, split) in splits.iter().enumerate() {
            assert_eq!(split.split_number, i as u32 + 1);
        }
        assert_eq!(splits[0].time_secs, 2.0);
        assert_eq!(splits[1].time_secs, 3.0);
        assert_eq!(splits[2].time_secs, 4.0);
        let mut timestamps: Vec<_> = splits.iter().map(|s| s.timestamp).collect();
        let sorted = timestamps.clone();
        timestamps.sort();
        assert_eq!(timestamps, sorted);
    }

    #[test]
    fn redelivered_payloads_are_dropped_as_duplicates() {
        let mut p = pipeline();
        let none = HashSet::new();
        p.accept(&hit("d1", 3), "Alpha", &none);
        // The poll loop fetches the same latest value again next tick.
        let outcome = p.accept(&hit("d1", 3), "Alpha", &none);

        assert_eq!(outcome, AcceptOutcome::Duplicate);
        assert_eq!(p.hit_count("d1"), 1);
        assert_eq!(p.snapshot().hit_history.len(), 1);
        assert_eq!(p.diagnostics().duplicate_drops, 1);
    }

    #[test]
    fn out_of_order_hit_counts_but_derives_nothing() {
        let mut p = pipeline();
        let none = HashSet::new();
        p.accept(&hit("d1", 10), "Alpha", &none);
        let outcome = p.accept(&hit("d1", 5), "Alpha", &none);

        assert!(matches!(outcome, AcceptOutcome::Counted { new_count: 2, .. }));
        assert!(p.snapshot().splits.is_empty());
        assert_eq!(p.diagnostics().non_monotonic, 1);

        // The watermark stayed at 10s, so a later hit derives from it.
        p.accept(&hit("d1", 14), "Alpha", &none);
        let splits = p.snapshot().splits;
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].time_secs, 4.0);
    }

    #[test]
    fn transitions_only_across_devices() {
        let mut p = pipeline();
        let none = HashSet::new();
        p.accept(&hit("d1", 1), "Alpha", &none);
        p.accept(&hit("d1", 2), "Alpha", &none);
        p.accept(&hit("d2", 5), "Bravo", &none);
        p.accept(&hit("d1", 6), "Alpha", &none);

        let transitions = p.snapshot().transitions;
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].from_device, "d1");
        assert_eq!(transitions[0].to_device, "d2");
        assert_eq!(transitions[0].time_secs, 3.0);
        assert_eq!(transitions[1].from_device, "d2");
        assert_eq!(transitions[1].to_device, "d1");
        assert_eq!(transitions[1].time_secs, 1.0);
        assert_eq!(transitions[1].transition_number, 2);
    }

    #[test]
    fn ready_markers_anchor_the_session_without_counting() {
        let mut p = pipeline();
        let none = HashSet::new();
        assert_eq!(
            p.accept(&marker("d2", EventKind::Start, 4), "Bravo", &none),
            AcceptOutcome::Ready
        );
        assert_eq!(
            p.accept(&marker("d1", EventKind::Busy, 2), "Alpha", &none),
            AcceptOutcome::Ready
        );
        // Repeat ready from d1 must not move the anchor.
        p.accept(&marker("d1", EventKind::Start, 1), "Alpha", &none);

        let snap = p.snapshot();
        assert_eq!(snap.session_anchor, Some(t0() + Duration::seconds(2)));
        assert!(snap.hit_counts.is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let mut p = pipeline();
        let none = HashSet::new();
        p.accept(&hit("d1", 1), "Alpha", &none);
        p.accept(&hit("d2", 2), "Bravo", &none);

        p.reset("session-2".to_string(), t0());
        let snap = p.snapshot();
        assert_eq!(snap.session_id.as_deref(), Some("session-2"));
        assert!(snap.hit_counts.is_empty());
        assert!(snap.hit_history.is_empty());
        assert!(snap.splits.is_empty());
        assert!(snap.transitions.is_empty());
        assert_eq!(snap.diagnostics.accepted_hits, 0);
    }

    #[test]
    fn resubscribing_moves_the_replay_cutoff_forward_only() {
        let mut p = pipeline();
        let none = HashSet::new();
        p.accept(&hit("d1", 1), "Alpha", &none);

        p.mark_resubscribed(t0() + Duration::seconds(20));
        // Earlier resubscribe instants must not widen the window again.
        p.mark_resubscribed(t0() + Duration::seconds(5));

        assert_eq!(p.accept(&hit("d1", 10), "Alpha", &none), AcceptOutcome::Stale);
        assert!(matches!(
            p.accept(&hit("d1", 25), "Alpha", &none),
            AcceptOutcome::Counted { .. }
        ));
        assert_eq!(p.hit_count("d1"), 2);
    }

    #[test]
    fn frozen_pipeline_rejects_everything() {
        let mut p = pipeline();
        let none = HashSet::new();
        p.accept(&hit("d1", 1), "Alpha", &none);
        p.freeze();

        assert_eq!(p.accept(&hit("d1", 2), "Alpha", &none), AcceptOutcome::Ignored);
        assert_eq!(p.hit_count("d1"), 1);
    }

    #[test]
    fn other_events_are_ignored_with_diagnostics() {
        let mut p = pipeline();
        let none = HashSet::new();
        let outcome = p.accept(&marker("d1", EventKind::Other, 1), "Alpha", &none);
        assert_eq!(outcome, AcceptOutcome::Ignored);
        assert_eq!(p.diagnostics().ignored_events, 1);
    }
}
