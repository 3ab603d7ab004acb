// src/core/aggregate/events.rs

//! The aggregate event stream: fan-in from every target cluster's event
//! manager with a per-scope sequence counter and resume ring for SSE
//! reconnects.

use crate::core::errors::KubedeckError;
use crate::core::metrics;
use crate::core::refresh::{ClusterStreamEvent, DomainSnapshot};
use crate::core::scope::Scope;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::snapshot::AggregateSnapshotService;

/// The domain tag carried on event frames.
const EVENT_STREAM_DOMAIN: &str = "events";

/// One SSE frame on the aggregate event stream.
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    pub domain: String,
    pub scope: String,
    pub sequence: u64,
    #[serde(rename = "generatedAt")]
    pub generated_at: i64,
    pub reset: bool,
    pub events: Vec<ClusterStreamEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<DomainSnapshot>,
}

/// Per-scope sequencing state: the monotonic counter plus the resume ring.
#[derive(Debug, Default)]
struct ScopeBuffer {
    next_sequence: u64,
    ring: VecDeque<(u64, EventFrame)>,
}

impl ScopeBuffer {
    fn append(&mut self, frame: EventFrame, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.ring.len() == capacity {
            self.ring.pop_front();
        }
        self.ring.push_back((frame.sequence, frame));
    }

    /// Frames strictly after `since`, when the ring still covers that point.
    fn replay_from(&self, since: u64) -> Option<Vec<EventFrame>> {
        let oldest = self.ring.front().map(|(seq, _)| *seq)?;
        if since + 1 < oldest || since >= self.next_sequence {
            return None;
        }
        Some(
            self.ring
                .iter()
                .filter(|(seq, _)| *seq > since)
                .map(|(_, frame)| frame.clone())
                .collect(),
        )
    }
}

/// A live subscription handed to the SSE endpoint.
pub struct EventSubscription {
    /// Replayed frames, or a single reset frame with a fresh snapshot.
    pub initial: Vec<EventFrame>,
    /// Live frames as they arrive.
    pub rx: mpsc::Receiver<EventFrame>,
    cancel: CancellationToken,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The fan-in hub for `/api/v2/stream/events`.
pub struct AggregateEventStream {
    snapshots: Arc<AggregateSnapshotService>,
    buffers: DashMap<String, Arc<Mutex<ScopeBuffer>>>,
    entry_buffer: usize,
    resume_buffer: usize,
}

impl AggregateEventStream {
    pub fn new(
        snapshots: Arc<AggregateSnapshotService>,
        entry_buffer: usize,
        resume_buffer: usize,
    ) -> Self {
        Self {
            snapshots,
            buffers: DashMap::new(),
            entry_buffer: entry_buffer.max(1),
            resume_buffer,
        }
    }

    fn scope_buffer(&self, raw_scope: &str) -> Arc<Mutex<ScopeBuffer>> {
        self.buffers
            .entry(raw_scope.to_string())
            .or_default()
            .clone()
    }

    /// Opens a subscription on `raw_scope`.
    ///
    /// When `since` is covered by the scope's resume ring, the buffered
    /// frames after it are replayed and no snapshot is built. Otherwise the
    /// subscription starts with a single reset frame carrying a fresh
    /// snapshot.
    pub async fn subscribe(
        &self,
        raw_scope: &str,
        since: Option<u64>,
    ) -> Result<EventSubscription, KubedeckError> {
        let scope = Scope::parse(raw_scope)?;
        let targets = self
            .snapshots
            .resolve_targets(EVENT_STREAM_DOMAIN, &scope)?;

        let buffer = self.scope_buffer(raw_scope);

        let initial = match since.and_then(|m| buffer.lock().replay_from(m)) {
            Some(frames) => {
                debug!(
                    "Event stream on '{}' resuming from sequence {} with {} buffered frames.",
                    raw_scope,
                    since.unwrap_or(0),
                    frames.len()
                );
                frames
            }
            None => {
                let snapshot = self
                    .snapshots
                    .build(EVENT_STREAM_DOMAIN, raw_scope)
                    .await?;
                let mut guard = buffer.lock();
                guard.next_sequence += 1;
                let frame = EventFrame {
                    domain: EVENT_STREAM_DOMAIN.to_string(),
                    scope: raw_scope.to_string(),
                    sequence: guard.next_sequence,
                    generated_at: chrono::Utc::now().timestamp_millis(),
                    reset: true,
                    events: Vec::new(),
                    snapshot: Some(snapshot),
                };
                guard.append(frame.clone(), self.resume_buffer);
                vec![frame]
            }
        };

        let cancel = CancellationToken::new();
        let (frame_tx, frame_rx) = mpsc::channel::<EventFrame>(self.entry_buffer);
        let (merge_tx, mut merge_rx) = mpsc::channel::<ClusterStreamEvent>(self.entry_buffer);

        // One forwarder per target cluster into the bounded merge channel.
        for target in &targets {
            let mut events_rx = target.events.subscribe();
            let merge_tx = merge_tx.clone();
            let selector = scope.selector.clone();
            let forward_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = forward_cancel.cancelled() => return,
                        event = events_rx.recv() => match event {
                            Ok(event) => event,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!("Event stream subscriber lagged by {} entries.", skipped);
                                continue;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        },
                    };
                    if !event.matches_scope(&selector) {
                        continue;
                    }
                    if merge_tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(merge_tx);

        // The sequencer: assigns per-scope sequence numbers, appends to the
        // resume ring, and delivers to the subscriber.
        let sequencer_cancel = cancel.clone();
        let raw = raw_scope.to_string();
        let resume_buffer = self.resume_buffer;
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = sequencer_cancel.cancelled() => return,
                    event = merge_rx.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                let frame = {
                    let mut guard = buffer.lock();
                    guard.next_sequence += 1;
                    let frame = EventFrame {
                        domain: EVENT_STREAM_DOMAIN.to_string(),
                        scope: raw.clone(),
                        sequence: guard.next_sequence,
                        generated_at: chrono::Utc::now().timestamp_millis(),
                        reset: false,
                        events: vec![event],
                        snapshot: None,
                    };
                    guard.append(frame.clone(), resume_buffer);
                    frame
                };
                metrics::EVENT_STREAM_ENTRIES_TOTAL.inc();
                if frame_tx.send(frame).await.is_err() {
                    return;
                }
            }
        });

        Ok(EventSubscription {
            initial,
            rx: frame_rx,
            cancel,
        })
    }

    /// Drops the resume buffer for one scope. Used by tests and by scope
    /// retirement.
    pub fn drop_scope_buffer(&self, raw_scope: &str) {
        self.buffers.remove(raw_scope);
    }
}

impl std::fmt::Debug for AggregateEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateEventStream")
            .field("scopes", &self.buffers.len())
            .finish()
    }
}
