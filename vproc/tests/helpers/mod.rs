// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use vproc::{LeafProcess, VirtualProcess};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn a command with the requested slots piped and wrap it as a leaf.
pub fn leaf(cmd: &str, args: &[&str], stdin: bool, stdout: bool, stderr: bool) -> Arc<dyn VirtualProcess> {
    let mut command = Command::new(cmd);
    command.args(args);
    command.stdin(if stdin { Stdio::piped() } else { Stdio::null() });
    command.stdout(if stdout { Stdio::piped() } else { Stdio::null() });
    command.stderr(if stderr { Stdio::piped() } else { Stdio::null() });
    let child = command.spawn().unwrap_or_else(|e| panic!("spawn {cmd}: {e}"));
    Arc::new(LeafProcess::wrap_child(child))
}

/// `sh -c` leaf with stdin, stdout and stderr all piped.
pub fn shell(script: &str) -> Arc<dyn VirtualProcess> {
    leaf("/bin/sh", &["-c", script], true, true, true)
}

/// Fail fast instead of hanging when a topology is miswired.
pub async fn within_timeout<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("test timed out")
}

/// Poll until `path` holds exactly `expected`; file sinks run on their own
/// tasks, so content lands shortly after the stream ends.
pub async fn wait_for_file(path: &Path, expected: &[u8]) {
    for _ in 0..200 {
        if std::fs::read(path).ok().as_deref() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "file {} never reached expected content {:?}",
        path.display(),
        String::from_utf8_lossy(expected)
    );
}
