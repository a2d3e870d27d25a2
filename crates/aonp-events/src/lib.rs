//! Live event fan-out for run subscribers
//!
//! The durable event log in the run store is the system of record; this
//! bus is the best-effort realtime view on top of it. Each run gets a
//! broadcast channel with a bounded ring: publishers never block, and a
//! subscriber that falls behind loses the oldest undelivered events and
//! sees a `subscriber_lag` notice in its own stream only. Late subscribers
//! are seeded with the last few events reconstructed from the store, so a
//! dashboard attaching mid-run still has context.
//!
//! Per-run delivery order is publish order; nothing is guaranteed across
//! runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use aonp_store::{EventKind, EventQuery, EventRecord, RunStore, StoreError};

/// Default per-subscriber ring capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
/// Default number of stored events replayed to a late subscriber.
pub const DEFAULT_REPLAY_EVENTS: usize = 64;

/// One event as seen by a live subscriber.
///
/// Durable events carry their store sequence number; bus-synthesized
/// events (`stream_end`, `subscriber_lag`) carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Store sequence number, absent for synthetic events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    /// Run the event belongs to.
    pub run_id: String,
    /// Event instant.
    pub ts: DateTime<Utc>,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional producing agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Structured payload.
    pub payload: serde_json::Value,
}

impl StreamEvent {
    fn synthetic(run_id: &str, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            seq: None,
            run_id: run_id.to_string(),
            ts: Utc::now(),
            kind: kind.as_str().to_string(),
            agent: None,
            payload,
        }
    }
}

impl From<&EventRecord> for StreamEvent {
    fn from(record: &EventRecord) -> Self {
        Self {
            seq: Some(record.seq),
            run_id: record.run_id.clone(),
            ts: record.ts,
            kind: record.kind.clone(),
            agent: record.agent.clone(),
            payload: record.payload.clone(),
        }
    }
}

/// In-process fan-out of per-run event streams.
///
/// Cheap to clone; clones share the channel registry.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn RunStore>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>>,
    global: broadcast::Sender<StreamEvent>,
    capacity: usize,
    replay: usize,
}

impl EventBus {
    /// Bus with default ring capacity and replay depth.
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self::with_capacity(store, DEFAULT_CHANNEL_CAPACITY, DEFAULT_REPLAY_EVENTS)
    }

    /// Bus with explicit ring capacity and replay depth (tests shrink
    /// these to provoke lag).
    #[must_use]
    pub fn with_capacity(store: Arc<dyn RunStore>, capacity: usize, replay: usize) -> Self {
        let (global, _) = broadcast::channel(capacity.max(1));
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
            global,
            capacity: capacity.max(1),
            replay,
        }
    }

    fn sender_for(&self, run_id: &str) -> broadcast::Sender<StreamEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish a persisted event to the run's live subscribers.
    ///
    /// Non-blocking; with no subscribers the event is simply dropped (the
    /// durable log already has it). Lifecycle events also feed the global
    /// stream; `stdout_line` stays per-run to keep the global stream
    /// coarse.
    pub fn publish(&self, record: &EventRecord) {
        let event = StreamEvent::from(record);
        if event.kind != EventKind::StdoutLine.as_str() {
            let _ = self.global.send(event.clone());
        }
        let _ = self.sender_for(&record.run_id).send(event);
    }

    /// Publish a cross-run observability event to the global stream only.
    pub fn publish_global(&self, event: StreamEvent) {
        let _ = self.global.send(event);
    }

    /// Subscribe to the cross-run stream.
    #[must_use]
    pub fn subscribe_global(&self) -> broadcast::Receiver<StreamEvent> {
        self.global.subscribe()
    }

    /// Close out a terminated run: deliver `stream_end` to its live
    /// subscribers and drop the channel.
    pub fn finish_run(&self, run_id: &str) {
        let sender = {
            let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
            channels.remove(run_id)
        };
        if let Some(sender) = sender {
            let _ = sender.send(StreamEvent::synthetic(
                run_id,
                EventKind::StreamEnd,
                serde_json::json!({}),
            ));
        }
        let _ = self.global.send(StreamEvent::synthetic(
            run_id,
            EventKind::StreamEnd,
            serde_json::json!({}),
        ));
    }

    /// Subscribe to one run's event stream.
    ///
    /// The stream starts with up to the configured number of recent
    /// events replayed from the durable log, then continues live, and
    /// finishes with a terminal `stream_end`. For a run that is already
    /// terminal the stream is the replay plus an immediate `stream_end`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown run; `StoreError` when the replay read
    /// fails.
    pub async fn subscribe(&self, run_id: &str) -> Result<EventStream, StoreError> {
        // Attach to the live channel before reading the replay so no event
        // can fall between the two; duplicates are filtered by sequence
        // number instead.
        let rx = self.sender_for(run_id).subscribe();

        let stored = self.store.get_events(run_id, &EventQuery::default()).await?;
        let skip = stored.len().saturating_sub(self.replay);
        let mut replayed: VecDeque<StreamEvent> =
            stored.iter().skip(skip).map(StreamEvent::from).collect();
        let max_replayed_seq = replayed.iter().filter_map(|e| e.seq).max().unwrap_or(0);

        // Read the run after attaching: if it is already terminal the
        // release event is in the replay and the stream can end
        // immediately; if it terminates later the live channel delivers
        // the end marker.
        let run = self.store.get_run(run_id).await?;
        let live = if run.is_terminal() {
            replayed.push_back(StreamEvent::synthetic(
                run_id,
                EventKind::StreamEnd,
                serde_json::json!({}),
            ));
            None
        } else {
            Some(rx)
        };

        Ok(EventStream {
            run_id: run_id.to_string(),
            replay: replayed,
            live,
            max_replayed_seq,
            ended: false,
        })
    }
}

/// Lazy sequence of one run's events; finite once the run terminates.
pub struct EventStream {
    run_id: String,
    replay: VecDeque<StreamEvent>,
    live: Option<broadcast::Receiver<StreamEvent>>,
    max_replayed_seq: i64,
    ended: bool,
}

impl EventStream {
    /// Next event, or `None` once the stream has ended.
    ///
    /// A subscriber that fell behind receives a synthetic
    /// `subscriber_lag` event carrying the number of dropped events, then
    /// resumes with the oldest event still buffered.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.ended {
            return None;
        }
        if let Some(event) = self.replay.pop_front() {
            if event.kind == EventKind::StreamEnd.as_str() {
                self.ended = true;
            }
            return Some(event);
        }
        let Some(rx) = self.live.as_mut() else {
            self.ended = true;
            return None;
        };
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(seq) = event.seq
                        && seq <= self.max_replayed_seq
                    {
                        continue; // already delivered from the replay
                    }
                    if event.kind == EventKind::StreamEnd.as_str() {
                        self.ended = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    return Some(StreamEvent::synthetic(
                        &self.run_id,
                        EventKind::SubscriberLag,
                        serde_json::json!({ "dropped": dropped }),
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.ended = true;
                    return None;
                }
            }
        }
    }

    /// Drain the stream to completion, collecting every delivered event.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use aonp_store::{
        NewEvent, ReleaseRequest, RunStatus, RunStore, SqliteRunStore,
    };

    const HASH: &str = "b1f5c9d2e8b147061c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b";

    async fn store_with_run(run_id: &str) -> Arc<SqliteRunStore> {
        let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
        store.upsert_study(HASH, "{}").await.unwrap();
        store.create_run(run_id, HASH).await.unwrap();
        store
    }

    async fn publish_line(
        store: &Arc<SqliteRunStore>,
        bus: &EventBus,
        run_id: &str,
        line: &str,
    ) {
        let records = store
            .append_events(
                run_id,
                &[NewEvent::core(EventKind::StdoutLine, serde_json::json!({ "line": line }))],
            )
            .await
            .unwrap();
        for record in &records {
            bus.publish(record);
        }
    }

    #[tokio::test]
    async fn test_live_events_arrive_in_publish_order() {
        let store = store_with_run("r1").await;
        let bus = EventBus::new(store.clone() as Arc<dyn RunStore>);
        let mut stream = bus.subscribe("r1").await.unwrap();
        // Replay contains run_created.
        assert_eq!(stream.next().await.unwrap().kind, "run_created");

        for i in 0..5 {
            publish_line(&store, &bus, "r1", &format!("line {i}")).await;
        }
        for i in 0..5 {
            let event = stream.next().await.unwrap();
            assert_eq!(event.kind, "stdout_line");
            assert_eq!(event.payload["line"], format!("line {i}"));
        }
        bus.finish_run("r1");
        assert_eq!(stream.next().await.unwrap().kind, "stream_end");
        assert!(stream.next().await.is_none(), "stream is closed after stream_end");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay() {
        let store = store_with_run("r1").await;
        let bus = EventBus::new(store.clone() as Arc<dyn RunStore>);
        for i in 0..3 {
            publish_line(&store, &bus, "r1", &format!("early {i}")).await;
        }
        let mut stream = bus.subscribe("r1").await.unwrap();
        let mut kinds = Vec::new();
        // run_created plus the three lines.
        for _ in 0..4 {
            kinds.push(stream.next().await.unwrap().kind);
        }
        assert_eq!(kinds, vec!["run_created", "stdout_line", "stdout_line", "stdout_line"]);
    }

    #[tokio::test]
    async fn test_replay_depth_is_bounded() {
        let store = store_with_run("r1").await;
        let bus = EventBus::with_capacity(store.clone() as Arc<dyn RunStore>, 256, 4);
        for i in 0..10 {
            publish_line(&store, &bus, "r1", &format!("line {i}")).await;
        }
        let mut stream = bus.subscribe("r1").await.unwrap();
        // Only the last four stored events are replayed.
        let first = stream.next().await.unwrap();
        assert_eq!(first.payload["line"], "line 6");
    }

    #[tokio::test]
    async fn test_no_duplicates_across_replay_and_live() {
        let store = store_with_run("r1").await;
        let bus = EventBus::new(store.clone() as Arc<dyn RunStore>);
        publish_line(&store, &bus, "r1", "before").await;
        let mut stream = bus.subscribe("r1").await.unwrap();
        publish_line(&store, &bus, "r1", "after").await;
        bus.finish_run("r1");

        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event);
        }
        let lines: Vec<&str> = seen
            .iter()
            .filter(|e| e.kind == "stdout_line")
            .map(|e| e.payload["line"].as_str().unwrap())
            .collect();
        assert_eq!(lines, vec!["before", "after"], "each line exactly once");
        let seqs: Vec<i64> = seen.iter().filter_map(|e| e.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seqs.len(), sorted.len(), "no duplicate sequence numbers");
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_lag_marker() {
        let store = store_with_run("r1").await;
        let bus = EventBus::with_capacity(store.clone() as Arc<dyn RunStore>, 4, 0);
        let mut stream = bus.subscribe("r1").await.unwrap();
        // Overrun the 4-slot ring without consuming.
        for i in 0..20 {
            publish_line(&store, &bus, "r1", &format!("line {i}")).await;
        }
        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, "subscriber_lag");
        assert_eq!(first.run_id, "r1");
        assert!(first.payload["dropped"].as_u64().unwrap() > 0);
        // The stream resumes with the oldest retained event, not the
        // oldest published one.
        let resumed = stream.next().await.unwrap();
        assert_eq!(resumed.kind, "stdout_line");
        assert_ne!(resumed.payload["line"], "line 0");
    }

    #[tokio::test]
    async fn test_subscribe_to_terminal_run_ends_after_replay() {
        let store = store_with_run("r1").await;
        let bus = EventBus::new(store.clone() as Arc<dyn RunStore>);
        store.claim_next("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        store
            .release(
                "r1",
                "w1",
                ReleaseRequest {
                    status: RunStatus::Succeeded,
                    error: None,
                    artifacts: Default::default(),
                },
            )
            .await
            .unwrap();
        bus.finish_run("r1");

        let stream = bus.subscribe("r1").await.unwrap();
        let events = stream.collect().await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["run_created", "run_claimed", "run_released", "stream_end"]);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_run_fails() {
        let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
        let bus = EventBus::new(store as Arc<dyn RunStore>);
        assert!(bus.subscribe("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_global_stream_skips_stdout_lines() {
        let store = store_with_run("r1").await;
        let bus = EventBus::new(store.clone() as Arc<dyn RunStore>);
        let mut global = bus.subscribe_global();
        publish_line(&store, &bus, "r1", "noise").await;
        let records = store
            .append_events(
                "r1",
                &[NewEvent::core(EventKind::CancelRequested, serde_json::json!({}))],
            )
            .await
            .unwrap();
        bus.publish(&records[0]);
        // The first global event is the cancel, not the stdout line.
        let event = global.recv().await.unwrap();
        assert_eq!(event.kind, "cancel_requested");
    }
}
