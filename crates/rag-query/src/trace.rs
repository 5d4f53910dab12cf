//! Stage instrumentation and the live debug event stream.
//!
//! The [`Emitter`] records one [`StageEvent`] per stage in start order and
//! forwards completed stages, plus the `debug_*` projection, to an optional
//! caller-provided [`EventSink`]. Recording never fails a run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use ulid::Ulid;

use rag_core::{
    unix_millis, PipelineTrace, RankedResult, RewrittenQuery, StageEvent, Strategy,
};

/// Annotation attached to stages still open when the trace is frozen.
const ABANDONED: &str = "abandoned";

/// Events delivered to an [`EventSink`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TraceEvent {
    /// A stage finished.
    Stage(StageEvent),

    /// Query rewrites for a pass.
    DebugQuery(QuerySnapshot),

    /// Ranked candidates with scores for a pass.
    DebugChunks(ChunksSnapshot),

    /// Timing breakdown of the run so far.
    DebugTiming(TimingSnapshot),
}

impl TraceEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stage(_) => "stage",
            Self::DebugQuery(_) => "debug_query",
            Self::DebugChunks(_) => "debug_chunks",
            Self::DebugTiming(_) => "debug_timing",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuerySnapshot {
    pub query_id: Ulid,
    pub raw_text: String,
    pub strategy: Strategy,
    pub iteration: Option<u32>,
    pub rewrites: Vec<RewrittenQuery>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunksSnapshot {
    pub query_id: Ulid,
    pub iteration: Option<u32>,
    pub results: Vec<RankedResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingSnapshot {
    pub query_id: Ulid,
    pub total_us: u64,
    pub stages: Vec<StageTiming>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage_name: String,
    pub started_at_us: u64,
    pub duration_us: u64,
}

/// Consumer of trace events.
///
/// Called synchronously from the pipeline, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn send(&self, event: TraceEvent);
}

/// Sink forwarding events over an unbounded channel.
pub struct ChannelSink {
    tx: UnboundedSender<TraceEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<TraceEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: TraceEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped, discarding trace event");
        }
    }
}

/// Sink collecting events in memory.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for CollectingSink {
    fn send(&self, event: TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Handle to a stage opened with [`Emitter::begin`].
#[derive(Debug)]
#[must_use = "an opened stage should be ended"]
pub struct StageId(usize);

struct Slot {
    event: StageEvent,
    open: bool,
}

/// Per-run trace recorder.
pub struct Emitter {
    query_id: Ulid,
    started_at_ms: u64,
    origin: Instant,
    slots: Mutex<Vec<Slot>>,
    sink: Option<Arc<dyn EventSink>>,
    debug: bool,
}

impl Emitter {
    /// Create an emitter for one query. Debug projections reach the sink only
    /// when `debug` is set; completed stages always do.
    pub fn new(query_id: Ulid, sink: Option<Arc<dyn EventSink>>, debug: bool) -> Self {
        Self {
            query_id,
            started_at_ms: unix_millis(),
            origin: Instant::now(),
            slots: Mutex::new(Vec::new()),
            sink,
            debug,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forward(&self, event: TraceEvent) {
        if let Some(sink) = &self.sink {
            sink.send(event);
        }
    }

    /// Open a stage. Its position in the trace is fixed here, so the trace
    /// reflects start order even when stages complete out of order.
    pub fn begin(&self, stage_name: impl Into<String>) -> StageId {
        let stage_name = stage_name.into();
        let mut slots = self.slots();
        if slots
            .iter()
            .any(|s| s.open && s.event.stage_name == stage_name)
        {
            warn!("Stage {} opened while already running", stage_name);
        }
        let now = self.origin.elapsed();
        slots.push(Slot {
            event: StageEvent {
                stage_name,
                started_at: now,
                ended_at: now,
                payload: serde_json::Value::Null,
                annotations: Vec::new(),
            },
            open: true,
        });
        StageId(slots.len() - 1)
    }

    /// Close a stage with its payload and any degradation annotations.
    pub fn end(&self, id: StageId, payload: serde_json::Value, annotations: Vec<String>) {
        let completed = {
            let mut slots = self.slots();
            let now = self.origin.elapsed();
            match slots.get_mut(id.0) {
                Some(slot) if slot.open => {
                    slot.open = false;
                    slot.event.ended_at = now.max(slot.event.started_at);
                    slot.event.payload = payload;
                    slot.event.annotations = annotations;
                    Some(slot.event.clone())
                }
                _ => {
                    warn!("Ignoring end of unknown or closed stage {}", id.0);
                    None
                }
            }
        };

        if let Some(event) = completed {
            self.forward(TraceEvent::Stage(event));
        }
    }

    /// Record an instantaneous stage.
    pub fn emit(&self, stage_name: impl Into<String>, payload: serde_json::Value) {
        let id = self.begin(stage_name);
        self.end(id, payload, Vec::new());
    }

    pub fn debug_query(
        &self,
        raw_text: &str,
        strategy: Strategy,
        iteration: Option<u32>,
        rewrites: &[RewrittenQuery],
    ) {
        if !self.debug {
            return;
        }
        self.forward(TraceEvent::DebugQuery(QuerySnapshot {
            query_id: self.query_id,
            raw_text: raw_text.to_string(),
            strategy,
            iteration,
            rewrites: rewrites.to_vec(),
        }));
    }

    pub fn debug_chunks(&self, iteration: Option<u32>, results: &[RankedResult]) {
        if !self.debug {
            return;
        }
        self.forward(TraceEvent::DebugChunks(ChunksSnapshot {
            query_id: self.query_id,
            iteration,
            results: results.to_vec(),
        }));
    }

    pub fn debug_timing(&self) {
        if !self.debug {
            return;
        }
        let stages = self
            .slots()
            .iter()
            .filter(|s| !s.open)
            .map(|s| StageTiming {
                stage_name: s.event.stage_name.clone(),
                started_at_us: s.event.started_at.as_micros() as u64,
                duration_us: s.event.duration().as_micros() as u64,
            })
            .collect();
        self.forward(TraceEvent::DebugTiming(TimingSnapshot {
            query_id: self.query_id,
            total_us: self.elapsed().as_micros() as u64,
            stages,
        }));
    }

    /// Time since the emitter was created.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Freeze the trace. Stages left open by abandoned work are closed now.
    pub fn finish(self) -> PipelineTrace {
        let now = self.origin.elapsed();
        let slots = self
            .slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let stage_events = slots
            .into_iter()
            .map(|slot| {
                let mut event = slot.event;
                if slot.open {
                    event.ended_at = now.max(event.started_at);
                    event.annotations.push(ABANDONED.to_string());
                }
                event
            })
            .collect();

        PipelineTrace {
            query_id: self.query_id,
            started_at_ms: self.started_at_ms,
            stage_events,
        }
    }
}
