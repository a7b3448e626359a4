// In-process pub/sub for per-session transcription events.
//
// Each session gets a broadcast channel plus a bounded replay ring so late
// subscribers (and SSE reconnects) see what they missed. The terminal
// `complete` event is always the last event published for a session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const DEFAULT_RING_CAPACITY: usize = 100;
const BROADCAST_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Partial {
        call_id: String,
        chunk_index: u64,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_sec: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_sec: Option<f64>,
    },
    Complete,
    Ping,
}

impl LiveEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LiveEvent::Partial { .. } => "partial",
            LiveEvent::Complete => "complete",
            LiveEvent::Ping => "ping",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, LiveEvent::Complete)
    }
}

struct SessionChannel {
    tx: broadcast::Sender<LiveEvent>,
    ring: Mutex<VecDeque<LiveEvent>>,
}

pub struct EventBus {
    sessions: DashMap<String, Arc<SessionChannel>>,
    ring_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ring_capacity,
        }
    }

    fn channel(&self, session_id: &str) -> Arc<SessionChannel> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
                Arc::new(SessionChannel {
                    tx,
                    ring: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    /// Publish an event for a session; also appended to the replay ring.
    pub fn publish(&self, session_id: &str, event: LiveEvent) {
        let channel = self.channel(session_id);
        // The ring lock also covers the broadcast send so subscribe() can
        // atomically pair "snapshot" with "attach", without replays or gaps.
        let mut ring = channel.ring.lock().expect("event ring poisoned");
        if ring.len() >= self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(event.clone());
        let _ = channel.tx.send(event.clone());
        drop(ring);

        if let LiveEvent::Partial {
            chunk_index, text, ..
        } = &event
        {
            log::debug!(
                "publish[{session_id}] chunk_index={chunk_index} text_len={}",
                text.len()
            );
        }
    }

    /// Publish the terminal completion event.
    pub fn complete(&self, session_id: &str) {
        self.publish(session_id, LiveEvent::Complete);
        log::info!("complete[{session_id}] emitted");
    }

    /// Buffered events first, then live events until `complete` is observed.
    pub fn subscribe(&self, session_id: &str) -> impl Stream<Item = LiveEvent> {
        let channel = self.channel(session_id);
        let (snapshot, rx) = {
            let ring = channel.ring.lock().expect("event ring poisoned");
            // Attaching the receiver under the ring lock means every event is
            // either in the snapshot or delivered live, never both.
            let rx = channel.tx.subscribe();
            (ring.iter().cloned().collect::<Vec<_>>(), rx)
        };
        log::info!("subscribe[{session_id}] opened ({} buffered)", snapshot.len());

        let buffered = futures_util::stream::iter(snapshot);
        let live = BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(err) => {
                    log::warn!("sse subscriber lagged: {err}");
                    None
                }
            }
        });

        // `complete` is delivered, then the stream ends.
        buffered
            .chain(live)
            .scan(false, |done, event| {
                let emit = if *done {
                    None
                } else {
                    if event.is_complete() {
                        *done = true;
                    }
                    Some(event)
                };
                futures_util::future::ready(emit)
            })
    }

    /// Number of buffered events for a session (diagnostics).
    pub fn buffered_len(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|c| c.ring.lock().expect("event ring poisoned").len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire format: optional `event:` line, `data:` line with JSON, blank
/// terminator.
pub fn sse_format(event_type: Option<&str>, data: &serde_json::Value) -> String {
    let mut out = String::new();
    if let Some(event_type) = event_type {
        out.push_str("event: ");
        out.push_str(event_type);
        out.push('\n');
    }
    out.push_str("data: ");
    out.push_str(&data.to_string());
    out.push_str("\n\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn partial(session: &str, index: u64, text: &str) -> LiveEvent {
        LiveEvent::Partial {
            call_id: session.to_string(),
            chunk_index: index,
            text: text.to_string(),
            start_sec: None,
            end_sec: None,
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_buffered_events_in_order() {
        let bus = EventBus::new();
        for i in 0..3 {
            bus.publish("x", partial("x", i, &format!("part {i}")));
        }
        bus.complete("x");

        let events: Vec<_> = bus.subscribe("x").collect().await;
        assert_eq!(events.len(), 4);
        for (i, event) in events.iter().take(3).enumerate() {
            match event {
                LiveEvent::Partial { chunk_index, .. } => assert_eq!(*chunk_index, i as u64),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(events[3].is_complete());
    }

    #[tokio::test]
    async fn complete_terminates_live_subscribers() {
        let bus = Arc::new(EventBus::new());
        let mut stream = Box::pin(bus.subscribe("s"));

        let bus2 = bus.clone();
        let producer = tokio::spawn(async move {
            bus2.publish("s", partial("s", 0, "hello"));
            bus2.publish("s", partial("s", 1, "world"));
            bus2.complete("s");
        });

        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event);
        }
        producer.await.unwrap();

        assert_eq!(seen.len(), 3);
        assert!(seen[2].is_complete());
    }

    #[tokio::test]
    async fn capacity_one_ring_keeps_only_latest_prefix_event() {
        let bus = EventBus::with_capacity(1);
        bus.publish("s", partial("s", 0, "dropped"));
        bus.publish("s", partial("s", 1, "kept"));

        let mut stream = Box::pin(bus.subscribe("s"));
        bus.publish("s", partial("s", 2, "live"));
        bus.complete("s");

        let first = stream.next().await.unwrap();
        match first {
            LiveEvent::Partial { chunk_index, .. } => assert_eq!(chunk_index, 1),
            other => panic!("unexpected event {other:?}"),
        }
        let rest: Vec<_> = stream.collect().await;
        assert_eq!(rest.len(), 2);
        assert!(rest[1].is_complete());
    }

    #[tokio::test]
    async fn chunk_indices_arrive_monotonic() {
        let bus = EventBus::new();
        for i in 0..10 {
            bus.publish("m", partial("m", i, "t"));
        }
        bus.complete("m");
        let events: Vec<_> = bus.subscribe("m").collect().await;
        let mut last = None;
        for event in &events {
            if let LiveEvent::Partial { chunk_index, .. } = event {
                if let Some(prev) = last {
                    assert!(*chunk_index > prev);
                }
                last = Some(*chunk_index);
            }
        }
    }

    #[test]
    fn sse_format_matches_wire_shape() {
        let body = sse_format(Some("partial"), &serde_json::json!({ "chunk_index": 2 }));
        assert_eq!(body, "event: partial\ndata: {\"chunk_index\":2}\n\n");
        let bare = sse_format(None, &serde_json::json!({}));
        assert_eq!(bare, "data: {}\n\n");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(LiveEvent::Complete).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "complete" }));
        let partial = serde_json::to_value(partial("c", 1, "hi")).unwrap();
        assert_eq!(partial["type"], "partial");
        assert_eq!(partial["chunk_index"], 1);
    }
}
