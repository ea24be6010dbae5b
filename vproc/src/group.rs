// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Composition of processes into a single process-shaped unit.
//!
//! A [`ProcessGroup`] satisfies [`VirtualProcess`] itself, which is the whole
//! point: a pipeline wrapped in a group can be killed, waited on, piped or
//! redirected exactly like one process, and can be a member of a larger
//! group. Construction is strictly bottom-up (members exist before the
//! group), so member trees cannot contain cycles.
//!
//! Event policy per composition kind:
//! - [`ProcessGroup::new`] (single member): events are forwarded from that
//!   member.
//! - [`ProcessGroup::pipeline`]: events are forwarded from the last member,
//!   whose termination means the pipeline has drained.
//!
//! `kill` always fans out to every member.

use crate::process::{EventBus, EventKind, ProcessEvent, ProcessId, StdioSet, VirtualProcess};
use log::debug;
use nix::sys::signal::Signal;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One or more [`VirtualProcess`] members exposed as a single one.
pub struct ProcessGroup {
    id: ProcessId,
    stdio: StdioSet,
    members: Vec<Arc<dyn VirtualProcess>>,
    events: Arc<EventBus>,
}

impl ProcessGroup {
    /// Wrap a single member, aliasing its stdio handles as the group's own.
    pub fn new(member: Arc<dyn VirtualProcess>) -> Self {
        Self::from_members(vec![member])
    }

    /// Wire `members` into a pipeline (each member's stdout feeding the
    /// next member's stdin) and expose the first member's stdin plus the
    /// last member's stdout/stderr as the group's stdio.
    ///
    /// Panics if `members` is empty; that is a construction error, not an
    /// operational failure.
    pub fn pipeline(members: Vec<Arc<dyn VirtualProcess>>) -> Self {
        assert!(!members.is_empty(), "pipeline requires at least one member");
        for pair in members.windows(2) {
            pair[0].pipe(pair[1].as_ref());
        }
        Self::from_members(members)
    }

    fn from_members(members: Vec<Arc<dyn VirtualProcess>>) -> Self {
        let first = members.first().expect("members checked non-empty");
        let last = members.last().expect("members checked non-empty");

        // Stdio handles are aliased, not copied: clones share the slot.
        let stdio = StdioSet::new(
            first.stdin().cloned(),
            last.stdout().cloned(),
            last.stderr().cloned(),
        );
        let id = last.id();

        let events = Arc::new(EventBus::new());
        forward_events(last.as_ref(), Arc::clone(&events));

        debug!("group {} composed from {} member(s)", id, members.len());
        Self {
            id,
            stdio,
            members,
            events,
        }
    }
}

impl VirtualProcess for ProcessGroup {
    fn id(&self) -> ProcessId {
        self.id.clone()
    }

    fn stdio(&self) -> &StdioSet {
        &self.stdio
    }

    /// Fan the signal out to every member.
    fn kill(&self, signal: Signal) {
        for member in &self.members {
            member.kill(signal);
        }
    }

    fn events(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    fn settled_event(&self, kind: EventKind) -> Option<ProcessEvent> {
        self.events.settled_event(kind)
    }
}

/// Re-emit the authoritative member's events on the group until it closes.
/// Events the member settled before the group existed are seeded first; the
/// bus drops duplicates, so the relay can overlap the seed safely.
fn forward_events(member: &dyn VirtualProcess, bus: Arc<EventBus>) {
    let mut rx = member.events();
    for kind in [EventKind::Exit, EventKind::Close] {
        if let Some(event) = member.settled_event(kind) {
            bus.emit(event);
        }
    }
    if bus.settled_event(EventKind::Close).is_some() {
        return;
    }
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let closed = matches!(event, ProcessEvent::Close(_));
                    bus.emit(event);
                    if closed {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("group event forwarding lagged by {n}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
