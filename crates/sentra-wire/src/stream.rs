use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{missing_required_fields, EventEnvelope};

/// Default cap on the in-memory applied-event ring.
pub const DEFAULT_EVENT_BUFFER: usize = 200;
/// Cap on retained quarantined events.
pub const QUARANTINE_CAP: usize = 50;
/// Cap on the recorded issue list.
pub const ISSUE_CAP: usize = 200;

/// How an incoming event was handled by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// In-order; applied.
    Applied,
    /// Applied, but a gap `(from..=to)` was recorded before it.
    AppliedAfterGap { from: i64, to: i64 },
    /// Sequence already applied; state unchanged.
    Duplicate,
    /// Out-of-order arrival at or below the high-water mark that was never
    /// applied (late gap filler); state unchanged.
    Replay,
    /// Missing required envelope fields; isolated, not applied.
    Quarantined,
}

/// A recorded sequence gap, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    pub from: i64,
    pub to: i64,
}

/// Counters mirrored to the UI.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StreamCounters {
    pub applied: u64,
    pub duplicates: u64,
    pub replays: u64,
    pub quarantined: u64,
    pub gaps: u64,
}

/// Client-side consumer state for one run's event stream.
///
/// Tracks the high-water mark, dedupes by sequence, records gaps, and
/// quarantines malformed events. Buffers are bounded with FIFO eviction.
#[derive(Debug)]
pub struct StreamState {
    run_id: String,
    last_seen: i64,
    seen: HashSet<i64>,
    counters: StreamCounters,
    gaps: Vec<SequenceGap>,
    events: VecDeque<EventEnvelope>,
    quarantine: VecDeque<Value>,
    issues: VecDeque<String>,
    buffer_cap: usize,
}

impl StreamState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self::with_buffer(run_id, DEFAULT_EVENT_BUFFER)
    }

    pub fn with_buffer(run_id: impl Into<String>, buffer_cap: usize) -> Self {
        Self {
            run_id: run_id.into(),
            last_seen: 0,
            seen: HashSet::new(),
            counters: StreamCounters::default(),
            gaps: Vec::new(),
            events: VecDeque::new(),
            quarantine: VecDeque::new(),
            issues: VecDeque::new(),
            buffer_cap: buffer_cap.max(1),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Highest applied sequence; resume subscriptions from here.
    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    pub fn counters(&self) -> StreamCounters {
        self.counters
    }

    pub fn gaps(&self) -> &[SequenceGap] {
        &self.gaps
    }

    pub fn applied_events(&self) -> impl Iterator<Item = &EventEnvelope> {
        self.events.iter()
    }

    pub fn quarantined(&self) -> impl Iterator<Item = &Value> {
        self.quarantine.iter()
    }

    pub fn issues(&self) -> impl Iterator<Item = &str> {
        self.issues.iter().map(String::as_str)
    }

    /// Ingest one raw event from the stream.
    pub fn ingest(&mut self, raw: Value) -> Disposition {
        let missing = missing_required_fields(&raw);
        if !missing.is_empty() {
            self.counters.quarantined += 1;
            self.push_issue(format!(
                "quarantined event missing fields: {}",
                missing.join(", ")
            ));
            push_capped(&mut self.quarantine, raw, QUARANTINE_CAP);
            return Disposition::Quarantined;
        }

        let event: EventEnvelope = match serde_json::from_value(raw.clone()) {
            Ok(event) => event,
            Err(err) => {
                self.counters.quarantined += 1;
                self.push_issue(format!("quarantined undecodable event: {err}"));
                push_capped(&mut self.quarantine, raw, QUARANTINE_CAP);
                return Disposition::Quarantined;
            }
        };

        let seq = event.params.sequence;
        if self.seen.contains(&seq) {
            self.counters.duplicates += 1;
            self.push_issue(format!("duplicate sequence {seq}"));
            return Disposition::Duplicate;
        }
        if seq <= self.last_seen {
            self.counters.replays += 1;
            self.push_issue(format!("replayed sequence {seq} (last seen {})", self.last_seen));
            return Disposition::Replay;
        }

        let disposition = if seq > self.last_seen + 1 {
            let gap = SequenceGap {
                from: self.last_seen + 1,
                to: seq - 1,
            };
            self.counters.gaps += 1;
            self.gaps.push(gap);
            self.push_issue(format!("gap {}..{} before sequence {seq}", gap.from, gap.to));
            Disposition::AppliedAfterGap {
                from: gap.from,
                to: gap.to,
            }
        } else {
            Disposition::Applied
        };

        self.seen.insert(seq);
        self.last_seen = seq;
        self.counters.applied += 1;
        push_capped(&mut self.events, event, self.buffer_cap);
        disposition
    }

    fn push_issue(&mut self, issue: String) {
        push_capped(&mut self.issues, issue, ISSUE_CAP);
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    if buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: i64) -> Value {
        let mut env = EventEnvelope::new("item/evidence", "run-1");
        env.params.sequence = seq;
        serde_json::to_value(&env).unwrap()
    }

    #[test]
    fn in_order_events_apply() {
        let mut state = StreamState::new("run-1");
        for seq in 1..=5 {
            assert_eq!(state.ingest(event(seq)), Disposition::Applied);
        }
        assert_eq!(state.last_seen(), 5);
        assert_eq!(state.counters().applied, 5);
    }

    #[test]
    fn redelivery_counts_as_duplicate_and_leaves_state_unchanged() {
        // Scenario: 1..5 delivered, then 3 redelivered.
        let mut state = StreamState::new("run-1");
        for seq in 1..=5 {
            state.ingest(event(seq));
        }
        assert_eq!(state.ingest(event(3)), Disposition::Duplicate);
        assert_eq!(state.last_seen(), 5);
        assert_eq!(state.counters().duplicates, 1);
        assert_eq!(state.counters().applied, 5);
    }

    #[test]
    fn gap_is_recorded_and_event_applied() {
        // Scenario: 1, 2, 5 delivered.
        let mut state = StreamState::new("run-1");
        state.ingest(event(1));
        state.ingest(event(2));
        assert_eq!(
            state.ingest(event(5)),
            Disposition::AppliedAfterGap { from: 3, to: 4 }
        );
        assert_eq!(state.last_seen(), 5);
        assert_eq!(state.gaps(), &[SequenceGap { from: 3, to: 4 }]);
    }

    #[test]
    fn late_gap_filler_counts_as_replay() {
        let mut state = StreamState::new("run-1");
        state.ingest(event(1));
        state.ingest(event(4));
        // 2 was never applied; it arrives late.
        assert_eq!(state.ingest(event(2)), Disposition::Replay);
        assert_eq!(state.last_seen(), 4);
    }

    #[test]
    fn malformed_events_are_quarantined_not_applied() {
        let mut state = StreamState::new("run-1");
        let raw = json!({"method": "run/started", "params": {"runId": "run-1"}});
        assert_eq!(state.ingest(raw), Disposition::Quarantined);
        assert_eq!(state.last_seen(), 0);
        assert_eq!(state.counters().quarantined, 1);
        assert_eq!(state.quarantined().count(), 1);
    }

    #[test]
    fn quarantine_buffer_is_capped_fifo() {
        let mut state = StreamState::new("run-1");
        for i in 0..(QUARANTINE_CAP + 10) {
            let raw = json!({"method": "x", "params": {"marker": i}});
            state.ingest(raw);
        }
        assert_eq!(state.quarantined().count(), QUARANTINE_CAP);
        let first = state.quarantined().next().unwrap();
        assert_eq!(first["params"]["marker"], 10);
    }

    #[test]
    fn event_ring_evicts_oldest() {
        let mut state = StreamState::with_buffer("run-1", 3);
        for seq in 1..=5 {
            state.ingest(event(seq));
        }
        let seqs: Vec<i64> = state.applied_events().map(|e| e.params.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }
}
