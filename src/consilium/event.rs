//! Progress events and the per-request event bus.
//!
//! Every stage of the pipeline reports progress as [`Event`]s carrying a
//! typed [`EventPayload`]. Events flow through a per-request [`EventBus`]
//! (single consumer, FIFO) rather than a callback threaded through every
//! stage: stages hold a write-only [`EventSink`], the transport layer drains
//! the matching [`EventStream`], and the bus owns serialization to the wire
//! envelope plus back-pressure monitoring.
//!
//! # Envelope
//!
//! [`Event::to_wire`] produces the transport schema:
//!
//! ```text
//! { stage: string, status: "running"|"streaming"|"complete"|"error",
//!   payload: object, latency_ms?: number, timestamp: ISO-8601 UTC }
//! ```
//!
//! The stage tags form a closed set; the terminal event always has
//! `stage=done`. When the consumer disconnects, the bus cancels the
//! request scope so every running stage unwinds promptly.

use crate::consilium::clock::Clock;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Closed set of stage tags appearing on the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StageTag {
    Heartbeat,
    Classify,
    Prefetch,
    Rag,
    AgentSelection,
    Agents,
    /// One per invoked agent, e.g. `agent:economist`.
    Agent(String),
    Debate,
    /// One per recorded debate turn, e.g. `debate:turn7`.
    DebateTurn(u32),
    DebateFinalSynthesis,
    Critique,
    Verify,
    Synthesize,
    Done,
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageTag::Heartbeat => write!(f, "heartbeat"),
            StageTag::Classify => write!(f, "classify"),
            StageTag::Prefetch => write!(f, "prefetch"),
            StageTag::Rag => write!(f, "rag"),
            StageTag::AgentSelection => write!(f, "agent_selection"),
            StageTag::Agents => write!(f, "agents"),
            StageTag::Agent(id) => write!(f, "agent:{}", id),
            StageTag::Debate => write!(f, "debate"),
            StageTag::DebateTurn(n) => write!(f, "debate:turn{}", n),
            StageTag::DebateFinalSynthesis => write!(f, "debate:final_synthesis"),
            StageTag::Critique => write!(f, "critique"),
            StageTag::Verify => write!(f, "verify"),
            StageTag::Synthesize => write!(f, "synthesize"),
            StageTag::Done => write!(f, "done"),
        }
    }
}

/// Event status. `Streaming` marks intermediate chunks (debate turns),
/// `Complete`/`Error` terminate a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Running,
    Streaming,
    Complete,
    Error,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EventStatus::Running => "running",
            EventStatus::Streaming => "streaming",
            EventStatus::Complete => "complete",
            EventStatus::Error => "error",
        };
        write!(f, "{}", tag)
    }
}

// ── Typed payload variants ───────────────────────────────────────────────
//
// The wire envelope carries an untyped payload object; internally every
// stage fills a closed variant so payload shape mismatches are compile
// errors, not runtime surprises.

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    /// Stage the pipeline is currently inside.
    pub waiting_on: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationPayload {
    pub intent: String,
    pub complexity: String,
    pub confidence: f32,
    pub entity_count: usize,
    pub routing: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrefetchPayload {
    pub fact_count: usize,
    pub sources: Vec<String>,
    pub failed_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagPayload {
    pub snippet_count: usize,
    pub source_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSelectionPayload {
    pub selected: Vec<String>,
    pub complexity: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentPayload {
    pub agent_id: String,
    pub confidence: f32,
    pub finding_count: usize,
    pub warning_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentsPayload {
    pub report_count: usize,
    pub empty_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebatePhasePayload {
    pub phase: String,
    pub turns_so_far: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebateTurnPayload {
    pub turn: u32,
    pub phase: String,
    pub speaker: String,
    /// First 160 characters of the utterance.
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnFailedPayload {
    pub speaker: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebateSummaryPayload {
    pub completion: String,
    pub turn_count: u32,
    pub contradiction_count: usize,
    pub resolution_count: usize,
    pub refocused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CritiquePayload {
    pub item_count: usize,
    pub assessment_preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationPayload {
    pub citation_violations: usize,
    pub fabricated_numbers: usize,
    pub stale_claims: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisPayload {
    pub cluster_count: usize,
    pub confidence: f32,
    pub degraded_clustering: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageErrorPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DonePayload {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stage tags that recovered locally during this request.
    pub degraded_stages: Vec<String>,
}

/// Closed set of payload shapes. Serialized untagged: the wire sees only the
/// inner object, exactly as the envelope schema requires.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Heartbeat(HeartbeatPayload),
    Classification(ClassificationPayload),
    Prefetch(PrefetchPayload),
    Rag(RagPayload),
    AgentSelection(AgentSelectionPayload),
    Agent(AgentPayload),
    Agents(AgentsPayload),
    DebatePhase(DebatePhasePayload),
    DebateTurn(DebateTurnPayload),
    TurnFailed(TurnFailedPayload),
    DebateSummary(DebateSummaryPayload),
    Critique(CritiquePayload),
    Verification(VerificationPayload),
    Synthesis(SynthesisPayload),
    StageError(StageErrorPayload),
    Done(DonePayload),
    /// Stage entry marker with nothing to report yet.
    Empty {},
}

/// A single progress event. Read-only once enqueued.
#[derive(Debug, Clone)]
pub struct Event {
    pub stage: StageTag,
    pub status: EventStatus,
    pub payload: EventPayload,
    /// Milliseconds since the emitting stage was entered.
    pub latency_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Serialize to the transport envelope.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut envelope = serde_json::json!({
            "stage": self.stage.to_string(),
            "status": self.status.to_string(),
            "payload": serde_json::to_value(&self.payload).unwrap_or_else(|_| serde_json::json!({})),
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        if let Some(latency) = self.latency_ms {
            envelope["latency_ms"] = serde_json::json!(latency);
        }
        envelope
    }
}

struct BusShared {
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    depth: AtomicUsize,
    watermark: usize,
    watermark_logged: AtomicBool,
    stage_events: AtomicU64,
}

/// Producer side of the per-request event queue.
///
/// Cheap to clone; every stage receives a clone wrapped in an [`EventSink`].
/// Enqueueing is synchronous with respect to the emitting stage; the consumer
/// may lag. The queue is unbounded, with a watermark that logs a warning when
/// the consumer falls behind.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
    shared: Arc<BusShared>,
}

impl EventBus {
    /// Create the bus and its single consumer stream.
    pub fn channel(
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        watermark: usize,
    ) -> (EventBus, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BusShared {
            clock,
            cancel,
            depth: AtomicUsize::new(0),
            watermark,
            watermark_logged: AtomicBool::new(false),
            stage_events: AtomicU64::new(0),
        });
        let bus = EventBus {
            tx,
            shared: Arc::clone(&shared),
        };
        let stream = EventStream { rx, shared };
        (bus, stream)
    }

    /// Enqueue one event. A closed consumer cancels the request scope.
    pub fn emit(
        &self,
        stage: StageTag,
        status: EventStatus,
        payload: EventPayload,
        latency_ms: Option<u64>,
    ) {
        if stage != StageTag::Heartbeat {
            self.shared.stage_events.fetch_add(1, Ordering::SeqCst);
        }

        let depth = self.shared.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.shared.watermark
            && !self.shared.watermark_logged.swap(true, Ordering::SeqCst)
        {
            log::warn!(
                "event queue depth {} passed watermark {}; consumer is lagging",
                depth,
                self.shared.watermark
            );
        }

        let event = Event {
            stage,
            status,
            payload,
            latency_ms,
            timestamp: self.shared.clock.now(),
        };

        if self.tx.send(event).is_err() {
            // Consumer went away; unwind the whole request.
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            if !self.shared.cancel.is_cancelled() {
                log::debug!("event consumer disconnected; cancelling request scope");
                self.shared.cancel.cancel();
            }
        }
    }

    /// Number of non-heartbeat events enqueued so far. The heartbeat task
    /// uses this to detect stalls without inspecting the queue.
    pub fn stage_event_count(&self) -> u64 {
        self.shared.stage_events.load(Ordering::SeqCst)
    }

    /// Stage-scoped sink; records the stage entry time for latency figures.
    pub fn sink(&self, stage: StageTag) -> EventSink {
        EventSink {
            bus: self.clone(),
            stage,
            entered: self.shared.clock.now(),
        }
    }
}

/// Write-only handle a stage uses to report progress.
pub struct EventSink {
    bus: EventBus,
    stage: StageTag,
    entered: DateTime<Utc>,
}

impl EventSink {
    fn latency(&self) -> Option<u64> {
        let elapsed = (self.bus.shared.clock.now() - self.entered).num_milliseconds();
        if elapsed >= 0 {
            Some(elapsed as u64)
        } else {
            None
        }
    }

    pub fn running(&self, payload: EventPayload) {
        self.bus
            .emit(self.stage.clone(), EventStatus::Running, payload, self.latency());
    }

    pub fn streaming(&self, payload: EventPayload) {
        self.bus.emit(
            self.stage.clone(),
            EventStatus::Streaming,
            payload,
            self.latency(),
        );
    }

    pub fn complete(&self, payload: EventPayload) {
        self.bus.emit(
            self.stage.clone(),
            EventStatus::Complete,
            payload,
            self.latency(),
        );
    }

    pub fn error(&self, payload: EventPayload) {
        self.bus
            .emit(self.stage.clone(), EventStatus::Error, payload, self.latency());
    }

    /// Emit under a different stage tag (per-agent / per-turn events) while
    /// keeping this sink's entry time for latency.
    pub fn emit_as(&self, stage: StageTag, status: EventStatus, payload: EventPayload) {
        self.bus.emit(stage, status, payload, self.latency());
    }
}

/// Consumer side of the per-request queue. Exactly one per request.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
    shared: Arc<BusShared>,
}

impl EventStream {
    /// Await the next event. `None` after the terminal event, once every
    /// producer handle is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
        }
        event
    }

    /// Non-blocking variant for tests and polling consumers.
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => {
                self.shared.depth.fetch_sub(1, Ordering::SeqCst);
                Some(event)
            }
            Err(_) => None,
        }
    }

    /// Adapt into a `futures_util::Stream` for transports that speak streams.
    pub fn into_stream(self) -> impl futures_util::Stream<Item = Event> {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|event| (event, stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consilium::clock::SystemClock;

    fn bus() -> (EventBus, EventStream) {
        EventBus::channel(Arc::new(SystemClock), CancellationToken::new(), 1_024)
    }

    #[tokio::test]
    async fn events_arrive_in_fifo_order() {
        let (bus, mut stream) = bus();
        let sink = bus.sink(StageTag::Classify);
        sink.running(EventPayload::Empty {});
        sink.complete(EventPayload::Empty {});

        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert_eq!(first.status, EventStatus::Running);
        assert_eq!(second.status, EventStatus::Complete);
        assert_eq!(first.stage, StageTag::Classify);
    }

    #[tokio::test]
    async fn consumer_disconnect_cancels_request_scope() {
        let cancel = CancellationToken::new();
        let (bus, stream) = EventBus::channel(Arc::new(SystemClock), cancel.clone(), 16);
        drop(stream);

        bus.emit(StageTag::Prefetch, EventStatus::Running, EventPayload::Empty {}, None);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn heartbeats_do_not_count_as_stage_events() {
        let (bus, _stream) = bus();
        bus.emit(
            StageTag::Heartbeat,
            EventStatus::Running,
            EventPayload::Heartbeat(HeartbeatPayload {
                waiting_on: "classify".into(),
            }),
            None,
        );
        assert_eq!(bus.stage_event_count(), 0);

        bus.emit(StageTag::Classify, EventStatus::Running, EventPayload::Empty {}, None);
        assert_eq!(bus.stage_event_count(), 1);
    }

    #[test]
    fn wire_envelope_has_closed_schema() {
        let event = Event {
            stage: StageTag::DebateTurn(7),
            status: EventStatus::Streaming,
            payload: EventPayload::DebateTurn(DebateTurnPayload {
                turn: 7,
                phase: "cross_examination".into(),
                speaker: "economist".into(),
                preview: "I challenge the 3.2% figure".into(),
            }),
            latency_ms: Some(42),
            timestamp: Utc::now(),
        };
        let wire = event.to_wire();
        assert_eq!(wire["stage"], "debate:turn7");
        assert_eq!(wire["status"], "streaming");
        assert_eq!(wire["latency_ms"], 42);
        assert_eq!(wire["payload"]["speaker"], "economist");
        assert!(wire["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn stage_tags_render_the_closed_set() {
        assert_eq!(StageTag::AgentSelection.to_string(), "agent_selection");
        assert_eq!(StageTag::Agent("economist".into()).to_string(), "agent:economist");
        assert_eq!(StageTag::DebateFinalSynthesis.to_string(), "debate:final_synthesis");
        assert_eq!(StageTag::Rag.to_string(), "rag");
        assert_eq!(StageTag::Done.to_string(), "done");
    }
}
