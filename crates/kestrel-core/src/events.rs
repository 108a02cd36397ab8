// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

/// Which compaction path produced a `ContextCompacted`-carrying `Status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionKind {
    Structured,
    Narrative,
    Emergency,
}

/// The logical channel a `StreamChunk` belongs to — lets a UI route model
/// text and extended-thinking output to separate panes without parsing
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChannel {
    Text,
    Reasoning,
}

/// Typed events fanned out to subscribed UIs during a turn. Handlers are
/// expected to be async and non-blocking; a slow consumer must not stall
/// the engine, so the emitter side ([`EventEmitter`]) uses a bounded,
/// drop-oldest queue for `StreamChunk` only. Every other variant is always
/// delivered.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A message was appended to a session (user, assistant, or tool).
    Message {
        role: kestrel_model::Role,
        content: String,
        agent_id: Option<String>,
        session_id: String,
    },
    /// Incremental model output. Exactly one `is_final=true` chunk closes
    /// out a given assistant message on a given channel.
    StreamChunk { chunk: String, channel: StreamChannel, is_final: bool, agent_id: Option<String> },
    /// Context-window budget usage, reported per category.
    TokenUpdate { used: usize, max: usize, per_category: Vec<(kestrel_model::MessageCategory, usize)> },
    /// A phase transition or lifecycle notice (turn started, compacted, cancelled, ...).
    Status { phase: String, detail: Option<String>, agent_id: Option<String> },
    /// A tool call finished (successfully or not).
    ToolInvocation { name: String, input_summary: String, ok: bool, duration_ms: u64, timed_out: bool },
    /// A recoverable error occurred.
    Error { kind: String, message: String, correlation_id: Option<String> },
    /// A checkpoint was created.
    Checkpoint { checkpoint_id: String, session_id: String, kind: String },
    /// The agent is relaying text to/from a human outside the model loop.
    HumanMessage { text: String, message_type: String },
}

impl EngineEvent {
    pub fn status(phase: impl Into<String>) -> Self {
        EngineEvent::Status { phase: phase.into(), detail: None, agent_id: None }
    }

    pub fn compacted(kind: CompactionKind, tokens_before: usize, tokens_after: usize) -> Self {
        let phase = match kind {
            CompactionKind::Structured => "compacted_structured",
            CompactionKind::Narrative => "compacted_narrative",
            CompactionKind::Emergency => "compacted_emergency",
        };
        EngineEvent::Status {
            phase: phase.into(),
            detail: Some(format!("{tokens_before} -> {tokens_after} tokens")),
            agent_id: None,
        }
    }
}

/// Default capacity of the `StreamChunk` queue. Sized for a few in-flight
/// assistant turns' worth of non-final chunks, not for a whole message.
const STREAM_QUEUE_CAPACITY: usize = 256;

/// A bounded, drop-oldest single-producer/single-consumer queue. Pushing past
/// capacity silently evicts the oldest queued item rather than blocking the
/// pusher or growing without bound.
struct StreamQueue {
    buf: Mutex<VecDeque<EngineEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl StreamQueue {
    fn new(capacity: usize) -> Self {
        Self { buf: Mutex::new(VecDeque::with_capacity(capacity)), capacity, notify: Notify::new(), closed: AtomicBool::new(false) }
    }

    fn push(&self, event: EngineEvent) {
        let mut buf = self.buf.lock().expect("stream queue mutex poisoned");
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<EngineEvent> {
        self.buf.lock().expect("stream queue mutex poisoned").pop_front()
    }

    async fn pop(&self) -> Option<EngineEvent> {
        loop {
            {
                let mut buf = self.buf.lock().expect("stream queue mutex poisoned");
                if let Some(event) = buf.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Producer handle for the event stream. `StreamChunk` events go through a
/// bounded, drop-oldest queue; every other variant is delivered over an
/// unbounded channel and is never dropped. Clone freely — every clone shares
/// the same underlying queues.
#[derive(Clone)]
pub struct EventEmitter {
    main: mpsc::UnboundedSender<EngineEvent>,
    stream: Arc<StreamQueue>,
}

/// Consumer handle paired with an [`EventEmitter`]. `recv` interleaves
/// buffered `StreamChunk`s with every other event in roughly send order.
pub struct EventReceiver {
    main: mpsc::UnboundedReceiver<EngineEvent>,
    stream: Arc<StreamQueue>,
}

impl EventEmitter {
    /// Create a linked emitter/receiver pair with the default stream-chunk
    /// queue depth.
    pub fn channel() -> (EventEmitter, EventReceiver) {
        Self::channel_with_capacity(STREAM_QUEUE_CAPACITY)
    }

    pub fn channel_with_capacity(stream_capacity: usize) -> (EventEmitter, EventReceiver) {
        let (main, main_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(StreamQueue::new(stream_capacity));
        (EventEmitter { main, stream: stream.clone() }, EventReceiver { main: main_rx, stream })
    }

    /// Deliver an event. Never blocks; `StreamChunk` silently drops the
    /// oldest queued chunk on overflow, every other variant is always
    /// accepted by the underlying unbounded channel.
    pub fn send(&self, event: EngineEvent) {
        match event {
            chunk @ EngineEvent::StreamChunk { .. } => self.stream.push(chunk),
            other => {
                let _ = self.main.send(other);
            }
        }
    }
}

impl EventReceiver {
    /// Await the next event, whichever of the two queues produces one first.
    /// Returns `None` once the emitter side is gone and both queues are
    /// drained.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        tokio::select! {
            biased;
            Some(event) = self.stream.pop() => Some(event),
            event = self.main.recv() => match event {
                Some(event) => Some(event),
                None => {
                    self.stream.close();
                    self.stream.pop().await
                }
            },
        }
    }

    /// Non-blocking poll of both queues, stream chunks first. Mirrors
    /// `mpsc::UnboundedReceiver::try_recv`'s error type so existing
    /// `while let Ok(event) = rx.try_recv()` drain loops keep working.
    pub fn try_recv(&mut self) -> Result<EngineEvent, mpsc::error::TryRecvError> {
        if let Some(event) = self.stream.try_pop() {
            return Ok(event);
        }
        self.main.try_recv()
    }
}
