// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Uniform process composition: build shell-like process topologies (pipes,
//! redirections, groups) without caring whether a node is one OS process or
//! many.
//!
//! The [`VirtualProcess`] trait is the single contract: identity, a fixed
//! stdio triple, `kill`, and `exit`/`close`/`error` lifecycle events.
//! [`LeafProcess`] satisfies it for a single process (see
//! [`LeafProcess::wrap_child`]); [`ProcessGroup`] satisfies it for a
//! composite, so composition is closed and topologies nest arbitrarily.
//!
//! Operational failures are asynchronous by design: wiring operations do not
//! fail at the call site. Process-level failures arrive as
//! [`ProcessEvent::Error`]; stream-level failures travel in-band on the
//! affected slot. A caller that listens to neither will not observe them.

#[cfg(not(unix))]
compile_error!("vproc relies on Unix signal delivery and is Unix-only");

mod group;
mod process;
mod redirect;
mod stream;

pub use group::ProcessGroup;
pub use process::{
    next_event, wait_for_event, EventEmitter, EventKind, ExitInfo, KillFn, LeafProcess,
    ProcessEvent, ProcessId, StdioSet, VirtualProcess, DEFAULT_TERM_SIGNAL,
};
pub use redirect::Redirection;
pub use stream::{Chunk, StreamError, StreamHandle, StreamReader, StreamWriter};

pub use nix::sys::signal::Signal;
