// Event bus: per-run append-only sequencing with subscriber resume.
//
// `publish` holds the run lock while it assigns the sequence and persists the
// row, then releases and fans out. That lock is the only serialization point,
// so server-side sequences are gapless 1..N per run.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sentra_evidence::{EventRow, SqliteStore};
use sentra_wire::EventEnvelope;
use tokio::sync::{broadcast, Mutex};

/// Upper bound on one backfill read; well above any real run's event count.
const BACKFILL_LIMIT: usize = 1_000_000;

/// Durable event persistence behind the bus. The rusqlite store is the
/// production implementation; tests use [`InMemoryEventLog`].
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, tenant_id: &str, event: &EventRow) -> anyhow::Result<()>;
    async fn last_sequence(&self, run_id: &str) -> anyhow::Result<i64>;
    async fn events_after(
        &self,
        run_id: &str,
        from_sequence: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<EventRow>>;
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append(&self, tenant_id: &str, event: &EventRow) -> anyhow::Result<()> {
        SqliteStore::append_event(self, tenant_id, event).await?;
        Ok(())
    }

    async fn last_sequence(&self, run_id: &str) -> anyhow::Result<i64> {
        Ok(SqliteStore::last_sequence(self, run_id).await?)
    }

    async fn events_after(
        &self,
        run_id: &str,
        from_sequence: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<EventRow>> {
        Ok(SqliteStore::events_after(self, run_id, from_sequence, limit).await?)
    }
}

#[derive(Default)]
pub struct InMemoryEventLog {
    events: Mutex<HashMap<String, Vec<EventRow>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, _tenant_id: &str, event: &EventRow) -> anyhow::Result<()> {
        self.events
            .lock()
            .await
            .entry(event.run_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn last_sequence(&self, run_id: &str) -> anyhow::Result<i64> {
        Ok(self
            .events
            .lock()
            .await
            .get(run_id)
            .and_then(|rows| rows.iter().map(|r| r.sequence).max())
            .unwrap_or(0))
    }

    async fn events_after(
        &self,
        run_id: &str,
        from_sequence: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<EventRow>> {
        Ok(self
            .events
            .lock()
            .await
            .get(run_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.sequence > from_sequence)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

struct RunCounter {
    last_sequence: i64,
    recent: VecDeque<EventEnvelope>,
}

/// The process-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    log: Arc<dyn EventLog>,
    runs: Arc<Mutex<HashMap<String, RunCounter>>>,
    tx: broadcast::Sender<EventEnvelope>,
    buffer_cap: usize,
}

impl EventBus {
    pub fn new(log: Arc<dyn EventLog>, buffer_cap: usize) -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self {
            log,
            runs: Arc::new(Mutex::new(HashMap::new())),
            tx,
            buffer_cap: buffer_cap.max(1),
        }
    }

    /// Assign the next sequence, persist, fan out. Returns the sequence.
    pub async fn publish(
        &self,
        tenant_id: &str,
        mut event: EventEnvelope,
    ) -> anyhow::Result<i64> {
        let run_id = event.params.run_id.clone();
        let sequence;
        {
            let mut runs = self.runs.lock().await;
            // First publish for a run in this process resumes the counter
            // from the durable log.
            let resumed = if runs.contains_key(&run_id) {
                None
            } else {
                Some(self.log.last_sequence(&run_id).await?)
            };
            let counter = runs.entry(run_id.clone()).or_insert_with(|| RunCounter {
                last_sequence: resumed.unwrap_or(0),
                recent: VecDeque::new(),
            });
            sequence = counter.last_sequence + 1;
            event.params.sequence = sequence;
            event.params.ts = Utc::now();
            // Tenant tag lets stream consumers scope the firehose.
            event
                .params
                .extra
                .insert("tenantId".to_string(), serde_json::json!(tenant_id));

            let row = EventRow {
                run_id: run_id.clone(),
                sequence,
                method: event.method.clone(),
                payload: serde_json::to_value(&event)?,
                ts: event.params.ts,
            };
            self.log.append(tenant_id, &row).await?;

            counter.last_sequence = sequence;
            if counter.recent.len() >= self.buffer_cap {
                counter.recent.pop_front();
            }
            counter.recent.push_back(event.clone());
        }

        let _ = self.tx.send(event);
        Ok(sequence)
    }

    pub async fn last_sequence(&self, run_id: &str) -> anyhow::Result<i64> {
        {
            let runs = self.runs.lock().await;
            if let Some(counter) = runs.get(run_id) {
                return Ok(counter.last_sequence);
            }
        }
        self.log.last_sequence(run_id).await
    }

    /// The most recent events held in memory for a run (bounded ring);
    /// anything older comes from the log.
    pub async fn recent(&self, run_id: &str) -> Vec<EventEnvelope> {
        let runs = self.runs.lock().await;
        runs.get(run_id)
            .map(|counter| counter.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Backfill fetch for subscribers that detected a gap.
    pub async fn events_after(
        &self,
        run_id: &str,
        from_sequence: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<EventRow>> {
        self.log.events_after(run_id, from_sequence, limit).await
    }

    /// Subscribe to one run, replaying everything after `from_sequence`
    /// before live delivery. In-order, at-least-once.
    pub async fn subscribe(
        &self,
        run_id: &str,
        from_sequence: i64,
    ) -> anyhow::Result<EventSubscription> {
        // Register for live events before reading the backlog so nothing is
        // lost in between; duplicates are filtered by sequence.
        let rx = self.tx.subscribe();
        let backlog = self.log.events_after(run_id, from_sequence, BACKFILL_LIMIT).await?;
        let mut delivered_through = from_sequence;
        let backlog: VecDeque<EventEnvelope> = backlog
            .into_iter()
            .filter_map(|row| serde_json::from_value::<EventEnvelope>(row.payload).ok())
            .inspect(|event| delivered_through = delivered_through.max(event.params.sequence))
            .collect();

        Ok(EventSubscription {
            run_id: run_id.to_string(),
            backlog,
            rx,
            delivered_through,
            bus: self.clone(),
        })
    }

    /// Subscribe to every run (firehose), live only.
    pub fn subscribe_all(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

/// In-order, at-least-once per-run event stream with resume.
pub struct EventSubscription {
    run_id: String,
    backlog: VecDeque<EventEnvelope>,
    rx: broadcast::Receiver<EventEnvelope>,
    delivered_through: i64,
    bus: EventBus,
}

impl EventSubscription {
    /// Next event, or `None` once the live channel is closed and the backlog
    /// is drained.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            self.delivered_through = self.delivered_through.max(event.params.sequence);
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.params.run_id != self.run_id {
                        continue;
                    }
                    if event.params.sequence <= self.delivered_through {
                        continue;
                    }
                    // A skipped-ahead live event means the broadcast dropped
                    // something for us; refill from the log to stay gapless.
                    if event.params.sequence > self.delivered_through + 1 {
                        if let Ok(rows) = self
                            .bus
                            .events_after(&self.run_id, self.delivered_through, BACKFILL_LIMIT)
                            .await
                        {
                            self.backlog = rows
                                .into_iter()
                                .filter_map(|row| {
                                    serde_json::from_value::<EventEnvelope>(row.payload).ok()
                                })
                                .collect();
                            if let Some(first) = self.backlog.pop_front() {
                                self.delivered_through = first.params.sequence;
                                return Some(first);
                            }
                        }
                    }
                    self.delivered_through = event.params.sequence;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Dropped by the ring buffer: recover from the log.
                    if let Ok(rows) = self
                        .bus
                        .events_after(&self.run_id, self.delivered_through, BACKFILL_LIMIT)
                        .await
                    {
                        self.backlog = rows
                            .into_iter()
                            .filter_map(|row| {
                                serde_json::from_value::<EventEnvelope>(row.payload).ok()
                            })
                            .collect();
                        if let Some(first) = self.backlog.pop_front() {
                            self.delivered_through = first.params.sequence;
                            return Some(first);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn delivered_through(&self) -> i64 {
        self.delivered_through
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(InMemoryEventLog::new()), 200)
    }

    #[tokio::test]
    async fn sequences_are_gapless_from_one() {
        let bus = bus();
        for _ in 0..5 {
            bus.publish("tenant-a", EventEnvelope::new("item/step", "run-1"))
                .await
                .unwrap();
        }
        assert_eq!(bus.last_sequence("run-1").await.unwrap(), 5);
        let rows = bus.events_after("run-1", 0, 100).await.unwrap();
        let seqs: Vec<i64> = rows.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn runs_sequence_independently() {
        let bus = bus();
        bus.publish("tenant-a", EventEnvelope::new("run/started", "run-1"))
            .await
            .unwrap();
        let seq = bus
            .publish("tenant-a", EventEnvelope::new("run/started", "run-2"))
            .await
            .unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn subscribe_replays_then_goes_live() {
        let bus = bus();
        for _ in 0..3 {
            bus.publish("tenant-a", EventEnvelope::new("item/step", "run-1"))
                .await
                .unwrap();
        }

        let mut subscription = bus.subscribe("run-1", 1).await.unwrap();
        assert_eq!(subscription.next().await.unwrap().params.sequence, 2);
        assert_eq!(subscription.next().await.unwrap().params.sequence, 3);

        bus.publish("tenant-a", EventEnvelope::new("item/step", "run-1"))
            .await
            .unwrap();
        assert_eq!(subscription.next().await.unwrap().params.sequence, 4);
    }

    #[tokio::test]
    async fn resume_equivalence_after_disconnect() {
        let bus = bus();
        for _ in 0..5 {
            bus.publish("tenant-a", EventEnvelope::new("item/step", "run-1"))
                .await
                .unwrap();
        }

        // Disconnect at k=3, re-subscribe from 3: exactly 4 and 5, in order.
        let mut subscription = bus.subscribe("run-1", 3).await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = subscription.backlog.pop_front() {
            seen.push(event.params.sequence);
        }
        assert_eq!(seen, vec![4, 5]);
    }

    #[tokio::test]
    async fn subscriber_filters_other_runs() {
        let bus = bus();
        let mut subscription = bus.subscribe("run-1", 0).await.unwrap();
        bus.publish("tenant-a", EventEnvelope::new("item/step", "run-2"))
            .await
            .unwrap();
        bus.publish("tenant-a", EventEnvelope::new("item/step", "run-1"))
            .await
            .unwrap();
        let event = subscription.next().await.unwrap();
        assert_eq!(event.params.run_id, "run-1");
        assert_eq!(event.params.sequence, 1);
    }

    #[tokio::test]
    async fn recent_ring_is_bounded_fifo() {
        let bus = EventBus::new(Arc::new(InMemoryEventLog::new()), 3);
        for _ in 0..5 {
            bus.publish("tenant-a", EventEnvelope::new("item/step", "run-1"))
                .await
                .unwrap();
        }
        let recent = bus.recent("run-1").await;
        let seqs: Vec<i64> = recent.iter().map(|e| e.params.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        // The log still has everything for on-demand fetch.
        assert_eq!(bus.events_after("run-1", 0, 100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn counter_resumes_from_persisted_log() {
        let log = Arc::new(InMemoryEventLog::new());
        {
            let bus = EventBus::new(log.clone(), 200);
            for _ in 0..3 {
                bus.publish("tenant-a", EventEnvelope::new("item/step", "run-1"))
                    .await
                    .unwrap();
            }
        }
        // New bus instance over the same log (process restart).
        let bus = EventBus::new(log, 200);
        let seq = bus
            .publish("tenant-a", EventEnvelope::new("item/step", "run-1"))
            .await
            .unwrap();
        assert_eq!(seq, 4);
    }
}
