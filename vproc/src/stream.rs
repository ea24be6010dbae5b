// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Byte-stream plumbing for process stdio slots.
//!
//! A [`StreamHandle`] is a cheaply cloneable handle to one stdio slot. Bytes
//! pushed by any producer are moved by a background distributor task to every
//! attached consumer, so a slot behaves as a multi-producer fan-in combined
//! with a multi-subscriber fan-out:
//!
//! - Producers (see [`StreamHandle::writer`]) share one bounded channel; a
//!   fast producer is throttled once the slowest consumer stops draining.
//! - Per-producer chunk ordering is preserved. No ordering exists across two
//!   producers feeding the same slot; their chunks interleave in arrival
//!   order.
//! - The slot reaches end-of-stream only once every registered producer has
//!   ended. End-of-stream is propagated to attached slots (see
//!   [`StreamHandle::attach`]) and observed by readers as channel close.
//! - I/O failures travel in-band as `Err` chunks so that a consumer wired to
//!   the slot always observes them.
//!
//! Chunks that arrive while no consumer is attached are retained: the
//! distributor holds its intake until the first subscriber or attachment
//! appears, so the bytes back up in the bounded channel and throttle the
//! producer, the way an OS pipe keeps bytes nobody has read yet. A slot that
//! never gains a consumer keeps its task and buffered bytes for the life of
//! the runtime.

use bytes::Bytes;
use log::debug;
use std::io;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Buffered chunks per slot before producers are throttled.
const SLOT_CAPACITY: usize = 32;

/// A stream-level failure, delivered in-band to every consumer of the slot.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// An underlying read, write or open failed.
    #[error("stream I/O failure: {0}")]
    Io(#[source] Arc<io::Error>),
    /// The slot has already ended, or was never present.
    #[error("stream is closed")]
    Closed,
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io(Arc::new(err))
    }
}

/// One unit of stream data: a byte chunk, or an in-band failure.
pub type Chunk = Result<Bytes, StreamError>;

enum Item {
    Data(Chunk),
    /// One producer finished.
    End,
}

#[derive(Clone)]
enum Tap {
    /// A plain subscriber; sees chunks, observes end as channel close.
    Reader(mpsc::Sender<Chunk>),
    /// Another slot's intake; additionally receives an explicit end mark.
    Slot(mpsc::Sender<Item>),
}

impl Tap {
    fn is_closed(&self) -> bool {
        match self {
            Tap::Reader(tx) => tx.is_closed(),
            Tap::Slot(tx) => tx.is_closed(),
        }
    }
}

struct State {
    taps: Vec<Tap>,
    producers: usize,
    ended: bool,
}

/// Handle to one stdio slot. Clones share the same underlying channel.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::Sender<Item>,
    state: Arc<Mutex<State>>,
    wired: Arc<Notify>,
}

impl PartialEq for StreamHandle {
    /// Two handles are equal when they alias the same slot.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

impl StreamHandle {
    /// Create an empty slot. Must be called from within a tokio runtime; the
    /// distributor task is spawned here.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(SLOT_CAPACITY);
        let state = Arc::new(Mutex::new(State {
            taps: Vec::new(),
            producers: 0,
            ended: false,
        }));
        let wired = Arc::new(Notify::new());
        tokio::spawn(distribute(rx, Arc::clone(&state), Arc::clone(&wired)));
        Self { tx, state, wired }
    }

    /// Register a producer on this slot. The slot will not end until the
    /// returned writer calls [`StreamWriter::end`].
    pub fn writer(&self) -> StreamWriter {
        self.state.lock().unwrap().producers += 1;
        StreamWriter {
            tx: self.tx.clone(),
        }
    }

    /// Subscribe to this slot. A late subscriber still receives chunks held
    /// back while the slot had no consumer; a reader on an already-ended
    /// slot observes an immediate end-of-stream.
    pub fn subscribe(&self) -> StreamReader {
        let (tx, rx) = mpsc::channel(SLOT_CAPACITY);
        let mut st = self.state.lock().unwrap();
        if !st.ended {
            st.taps.push(Tap::Reader(tx));
            self.wired.notify_one();
        }
        StreamReader { rx }
    }

    /// Connect this slot as a producer feeding `sink`: every chunk seen here
    /// is forwarded, and when this slot ends, the producer registered on
    /// `sink` ends with it. Existing wiring on either slot is left intact.
    pub fn attach(&self, sink: &StreamHandle) {
        sink.add_producer();
        let mut st = self.state.lock().unwrap();
        if st.ended {
            drop(st);
            debug!("attach on an ended slot is a no-op");
            sink.retire_producer();
            return;
        }
        st.taps.push(Tap::Slot(sink.tx.clone()));
        self.wired.notify_one();
    }

    fn add_producer(&self) {
        self.state.lock().unwrap().producers += 1;
    }

    /// Deliver the end mark for one registered producer.
    fn retire_producer(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Item::End).await;
        });
    }
}

impl Default for StreamHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of a slot, registered as one producer.
pub struct StreamWriter {
    tx: mpsc::Sender<Item>,
}

impl StreamWriter {
    /// Push a chunk, waiting for buffer space. Fails once the slot has ended.
    pub async fn send(&self, data: Bytes) -> Result<(), StreamError> {
        self.tx
            .send(Item::Data(Ok(data)))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Deliver a failure in-band to every consumer of the slot.
    pub async fn error(&self, err: StreamError) {
        let _ = self.tx.send(Item::Data(Err(err))).await;
    }

    /// Mark this producer as finished. The slot ends once all producers have.
    pub async fn end(self) {
        let _ = self.tx.send(Item::End).await;
    }
}

/// Read side of a slot subscription.
pub struct StreamReader {
    rx: mpsc::Receiver<Chunk>,
}

impl StreamReader {
    /// Next chunk, or `None` at end-of-stream.
    pub async fn recv(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Drain the slot to end-of-stream, returning all bytes in order. The
    /// first in-band failure aborts the read.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

async fn distribute(mut rx: mpsc::Receiver<Item>, state: Arc<Mutex<State>>, wired: Arc<Notify>) {
    loop {
        // Hold the intake while nothing is attached, so chunks back up in
        // the bounded channel instead of being lost. `notify_one` stores a
        // permit, so a tap registered between the check and the await is
        // not missed.
        while state.lock().unwrap().taps.is_empty() {
            wired.notified().await;
        }
        // None means every handle and writer is gone; treat as end.
        let Some(item) = rx.recv().await else { break };
        match item {
            Item::Data(chunk) => {
                let taps: Vec<Tap> = state.lock().unwrap().taps.clone();
                let mut any_dead = false;
                for tap in &taps {
                    let delivered = match tap {
                        Tap::Reader(tx) => tx.send(chunk.clone()).await.is_ok(),
                        Tap::Slot(tx) => tx.send(Item::Data(chunk.clone())).await.is_ok(),
                    };
                    if !delivered {
                        any_dead = true;
                    }
                }
                if any_dead {
                    state.lock().unwrap().taps.retain(|t| !t.is_closed());
                }
            }
            Item::End => {
                let last = {
                    let mut st = state.lock().unwrap();
                    st.producers = st.producers.saturating_sub(1);
                    st.producers == 0
                };
                if last {
                    break;
                }
            }
        }
    }

    let taps = {
        let mut st = state.lock().unwrap();
        st.ended = true;
        std::mem::take(&mut st.taps)
    };
    for tap in taps {
        // Readers observe end-of-stream when their sender is dropped here.
        if let Tap::Slot(tx) = tap {
            let _ = tx.send(Item::End).await;
        }
    }
}
