// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The uniform process contract and its leaf implementation.
//!
//! [`VirtualProcess`] is the contract shared by a single OS process and any
//! composite built from several of them: an identity, a fixed stdio triple,
//! a kill operation and the `exit`/`close`/`error` lifecycle events. Because
//! composites satisfy the same contract as leaves, topologies nest
//! arbitrarily (a pipeline can feed another pipeline, a group can contain
//! groups).
//!
//! [`LeafProcess`] is the constructible leaf: it holds an injected kill
//! capability, so it is polymorphic over "real OS process" and "anything
//! else that can be killed". [`LeafProcess::wrap_child`] adapts an
//! already-spawned [`tokio::process::Child`].

use crate::redirect::{self, Redirection};
use crate::stream::{StreamHandle, StreamReader, StreamWriter};
use bytes::BytesMut;
use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Signal sent by [`VirtualProcess::terminate`]. Single point of change for
/// platform-specific substitutions.
pub const DEFAULT_TERM_SIGNAL: Signal = Signal::SIGTERM;

/// Buffered lifecycle events per process.
const EVENT_CAPACITY: usize = 16;

const READ_CHUNK: usize = 8192;

/// Opaque process identity; stable for the object's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessId {
    /// A real OS pid.
    Pid(u32),
    /// An external-handle token for entities that are not OS processes.
    Token(String),
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Pid(pid) => write!(f, "pid:{pid}"),
            ProcessId::Token(token) => write!(f, "token:{token}"),
        }
    }
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number, if it was killed.
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Lifecycle notifications. Exactly these three kinds exist; an adapter never
/// forwards anything else.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// The process terminated.
    Exit(ExitInfo),
    /// The process terminated and all stdio pumps have drained. This is the
    /// authoritative "fully done" signal; no further events follow it.
    Close(ExitInfo),
    /// The underlying resource reported a failure (spawn, wait or kill
    /// delivery).
    Error(Arc<io::Error>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Exit,
    Close,
    Error,
}

impl ProcessEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProcessEvent::Exit(_) => EventKind::Exit,
            ProcessEvent::Close(_) => EventKind::Close,
            ProcessEvent::Error(_) => EventKind::Error,
        }
    }
}

/// Broadcast channel plus the settled exit/close outcome, so a subscriber
/// arriving after termination can still learn how the process ended.
pub(crate) struct EventBus {
    tx: broadcast::Sender<ProcessEvent>,
    settled: Mutex<Settled>,
}

#[derive(Default)]
struct Settled {
    exit: Option<ExitInfo>,
    close: Option<ExitInfo>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            settled: Mutex::new(Settled::default()),
        }
    }

    /// Record and broadcast. `Exit` and `Close` settle at most once; a
    /// duplicate is dropped.
    pub(crate) fn emit(&self, event: ProcessEvent) {
        {
            let mut settled = self.settled.lock().unwrap();
            match &event {
                ProcessEvent::Exit(info) => {
                    if settled.exit.is_some() {
                        return;
                    }
                    settled.exit = Some(*info);
                }
                ProcessEvent::Close(info) => {
                    if settled.close.is_some() {
                        return;
                    }
                    settled.close = Some(*info);
                }
                ProcessEvent::Error(_) => {}
            }
        }
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn settled_event(&self, kind: EventKind) -> Option<ProcessEvent> {
        let settled = self.settled.lock().unwrap();
        match kind {
            EventKind::Exit => settled.exit.map(ProcessEvent::Exit),
            EventKind::Close => settled.close.map(ProcessEvent::Close),
            EventKind::Error => None,
        }
    }
}

/// Event intake for the party adapting an external handle: whatever the
/// external source reports is re-emitted with the payload unchanged. Only
/// the three [`ProcessEvent`] kinds can pass through.
#[derive(Clone)]
pub struct EventEmitter {
    bus: Arc<EventBus>,
}

impl EventEmitter {
    pub fn emit(&self, event: ProcessEvent) {
        self.bus.emit(event);
    }
}

/// The ordered stdio triple. Slots 0/1/2 are stdin/stdout/stderr, fixed at
/// construction and never reassigned; a slot may be absent.
#[derive(Debug, Clone, Default)]
pub struct StdioSet {
    slots: [Option<StreamHandle>; 3],
}

impl StdioSet {
    pub fn new(
        stdin: Option<StreamHandle>,
        stdout: Option<StreamHandle>,
        stderr: Option<StreamHandle>,
    ) -> Self {
        Self {
            slots: [stdin, stdout, stderr],
        }
    }

    /// All three slots absent.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fresh handle in every slot. Must be called within a tokio runtime.
    pub fn piped() -> Self {
        Self::new(
            Some(StreamHandle::new()),
            Some(StreamHandle::new()),
            Some(StreamHandle::new()),
        )
    }

    pub fn get(&self, slot: usize) -> Option<&StreamHandle> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn stdin(&self) -> Option<&StreamHandle> {
        self.get(0)
    }

    pub fn stdout(&self) -> Option<&StreamHandle> {
        self.get(1)
    }

    pub fn stderr(&self) -> Option<&StreamHandle> {
        self.get(2)
    }
}

/// Capability that delivers a termination signal to whatever the process
/// represents. Captured at construction; everything it needs is in the
/// closure.
pub type KillFn = Box<dyn Fn(Signal) + Send + Sync>;

/// The uniform process contract. Satisfied by [`LeafProcess`] and by
/// [`ProcessGroup`](crate::ProcessGroup), so any composite can stand in for
/// a single process.
pub trait VirtualProcess: Send + Sync {
    fn id(&self) -> ProcessId;

    fn stdio(&self) -> &StdioSet;

    /// Issue a signal-delivery request. Returns once the request is issued,
    /// not once the process has died; success is not reported here. A
    /// delivery failure surfaces, if at all, as a later [`ProcessEvent::Error`].
    fn kill(&self, signal: Signal);

    /// Subscribe to lifecycle events. Events emitted before the subscription
    /// are not replayed; the settled exit/close outcome stays available
    /// through [`VirtualProcess::settled_event`].
    fn events(&self) -> broadcast::Receiver<ProcessEvent>;

    /// The already-emitted event of `kind`, if the process has settled it.
    /// Exit and close outcomes are retained; error events are not.
    fn settled_event(&self, _kind: EventKind) -> Option<ProcessEvent> {
        None
    }

    /// Kill with [`DEFAULT_TERM_SIGNAL`].
    fn terminate(&self) {
        self.kill(DEFAULT_TERM_SIGNAL);
    }

    fn stdin(&self) -> Option<&StreamHandle> {
        self.stdio().get(0)
    }

    fn stdout(&self) -> Option<&StreamHandle> {
        self.stdio().get(1)
    }

    fn stderr(&self) -> Option<&StreamHandle> {
        self.stdio().get(2)
    }

    /// Connect this process's stdout as a producer feeding `target`'s stdin.
    /// Byte-exact and flow-controlled; existing wiring on either slot is
    /// kept, so a source can fan out and a sink can fan in.
    fn pipe(&self, target: &dyn VirtualProcess) {
        match (self.stdout(), target.stdin()) {
            (Some(src), Some(dst)) => src.attach(dst),
            _ => debug!(
                "pipe {} -> {}: missing stdio slot, nothing connected",
                self.id(),
                target.id()
            ),
        }
    }

    /// As [`pipe`](VirtualProcess::pipe), but stdout and stderr both feed
    /// `target`'s stdin. Per-source ordering is kept; the two sources
    /// interleave in arrival order. The sink ends only after both sources
    /// have ended.
    fn pipe_both(&self, target: &dyn VirtualProcess) {
        let Some(dst) = target.stdin() else {
            debug!("pipe_both -> {}: no stdin slot", target.id());
            return;
        };
        if let Some(out) = self.stdout() {
            out.attach(dst);
        }
        if let Some(err) = self.stderr() {
            err.attach(dst);
        }
    }

    /// Open `path` for reading and feed it into stdin (slot 0). Existing
    /// wiring into the slot is kept; sources interleave.
    fn redirect_input(&self, path: &Path) -> Redirection {
        self.redirect_input_to(path, 0)
    }

    fn redirect_input_to(&self, path: &Path, slot: usize) -> Redirection {
        redirect::file_into_slot(self.stdio().get(slot), path)
    }

    /// Create/truncate `path`, then write every chunk from stdout (slot 1)
    /// to it. The returned [`Redirection`] resolves once the truncating open
    /// has completed, so a caller can sequence against the truncation;
    /// failures are also delivered in-band on the slot. Existing wiring from
    /// the slot is kept (fan-out, not replace).
    fn redirect_output(&self, path: &Path) -> Redirection {
        self.redirect_output_to(path, 1)
    }

    fn redirect_output_to(&self, path: &Path, slot: usize) -> Redirection {
        redirect::slot_into_file(self.stdio().get(slot), path, false)
    }

    /// As [`redirect_output`](VirtualProcess::redirect_output), but append
    /// mode: no truncation, existing file content is preserved.
    fn redirect_output_append(&self, path: &Path) -> Redirection {
        self.redirect_output_append_to(path, 1)
    }

    fn redirect_output_append_to(&self, path: &Path, slot: usize) -> Redirection {
        redirect::slot_into_file(self.stdio().get(slot), path, true)
    }
}

/// Await the next event of `kind` on a subscription obtained earlier.
/// Returns `None` if the process is gone without emitting it.
pub async fn next_event(
    rx: &mut broadcast::Receiver<ProcessEvent>,
    kind: EventKind,
) -> Option<ProcessEvent> {
    loop {
        match rx.recv().await {
            Ok(ev) if ev.kind() == kind => return Some(ev),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("event subscription lagged, {n} events missed");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Await the next event of `kind`, or return it immediately when it has
/// already settled. The subscription is taken before the settled check, so
/// an event firing in between cannot be missed. Error events are not
/// retained; for those, hold a receiver from [`VirtualProcess::events`]
/// before the process can fail.
pub async fn wait_for_event(proc: &dyn VirtualProcess, kind: EventKind) -> Option<ProcessEvent> {
    let mut rx = proc.events();
    if let Some(event) = proc.settled_event(kind) {
        return Some(event);
    }
    next_event(&mut rx, kind).await
}

/// A leaf process: one real OS process, or any externally supplied
/// kill/stream handle, behind the uniform contract.
pub struct LeafProcess {
    id: ProcessId,
    stdio: StdioSet,
    kill_fn: KillFn,
    events: Arc<EventBus>,
}

impl LeafProcess {
    /// Construct a leaf from an explicit kill capability, identity and stdio
    /// triple. No validation is performed; a miswired stdio slot surfaces
    /// later as stream-operation errors, not here.
    pub fn new(kill_fn: KillFn, id: ProcessId, stdio: StdioSet) -> Self {
        Self {
            id,
            stdio,
            kill_fn,
            events: Arc::new(EventBus::new()),
        }
    }

    /// Event intake for the party that constructed this leaf. An adapter
    /// over an external handle subscribes to its source's notifications and
    /// re-emits each here with the payload unchanged.
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            bus: Arc::clone(&self.events),
        }
    }

    /// Adapt an already-spawned [`Child`] so it can participate in
    /// composition:
    ///
    /// - identity is the child's pid;
    /// - each piped stdio handle gets a slot, pumped by a background task;
    /// - the kill capability delivers signals to the child's pid, emitting
    ///   [`ProcessEvent::Error`] when delivery fails;
    /// - `Exit` is emitted with the real exit status, and `Close` once the
    ///   output pumps have drained. Nothing else is ever emitted.
    pub fn wrap_child(mut child: Child) -> Self {
        let pid = child.id();
        let events = Arc::new(EventBus::new());

        let stdin = child.stdin.take().map(|sink| {
            let slot = StreamHandle::new();
            spawn_input_pump(sink, slot.subscribe());
            slot
        });
        let mut pumps = Vec::new();
        let stdout = child.stdout.take().map(|src| {
            let slot = StreamHandle::new();
            pumps.push(spawn_output_pump(src, slot.writer(), "stdout"));
            slot
        });
        let stderr = child.stderr.take().map(|src| {
            let slot = StreamHandle::new();
            pumps.push(spawn_output_pump(src, slot.writer(), "stderr"));
            slot
        });

        let wait_events = Arc::clone(&events);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let info = ExitInfo::from_status(status);
                    wait_events.emit(ProcessEvent::Exit(info));
                    for pump in pumps {
                        let _ = pump.await;
                    }
                    wait_events.emit(ProcessEvent::Close(info));
                }
                Err(err) => {
                    wait_events.emit(ProcessEvent::Error(Arc::new(err)));
                }
            }
        });

        let kill_events = Arc::clone(&events);
        let kill_fn: KillFn = Box::new(move |sig| {
            let Some(pid) = pid else {
                warn!("kill {sig}: child has no pid");
                return;
            };
            if let Err(errno) = signal::kill(Pid::from_raw(pid as i32), sig) {
                warn!("failed to deliver {sig} to pid {pid}: {errno}");
                kill_events.emit(ProcessEvent::Error(Arc::new(io::Error::from_raw_os_error(
                    errno as i32,
                ))));
            }
        });

        Self {
            id: ProcessId::Pid(pid.unwrap_or(0)),
            stdio: StdioSet::new(stdin, stdout, stderr),
            kill_fn,
            events,
        }
    }
}

impl VirtualProcess for LeafProcess {
    fn id(&self) -> ProcessId {
        self.id.clone()
    }

    fn stdio(&self) -> &StdioSet {
        &self.stdio
    }

    fn kill(&self, signal: Signal) {
        (self.kill_fn)(signal);
    }

    fn events(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    fn settled_event(&self, kind: EventKind) -> Option<ProcessEvent> {
        self.events.settled_event(kind)
    }
}

/// Drain a slot subscription into the child's stdin, then close it so the
/// child observes EOF.
fn spawn_input_pump(mut sink: impl AsyncWrite + Unpin + Send + 'static, mut reader: StreamReader) {
    tokio::spawn(async move {
        while let Some(chunk) = reader.recv().await {
            match chunk {
                Ok(data) => {
                    if let Err(err) = sink.write_all(&data).await {
                        debug!("stdin pump stopping: {err}");
                        break;
                    }
                }
                Err(err) => debug!("in-band error reached stdin, skipping: {err}"),
            }
        }
        let _ = sink.shutdown().await;
        // sink drops here, closing the child's stdin.
    });
}

/// Pump an output pipe into its slot; read failures travel in-band.
fn spawn_output_pump(
    mut src: impl AsyncRead + Unpin + Send + 'static,
    writer: StreamWriter,
    label: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            match src.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if writer.send(buf.split().freeze()).await.is_err() {
                        debug!("{label} slot closed, pump stopping");
                        return;
                    }
                }
                Err(err) => {
                    debug!("{label} read failed: {err}");
                    writer.error(err.into()).await;
                    break;
                }
            }
        }
        writer.end().await;
    })
}
