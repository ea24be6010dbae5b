// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! End-to-end topologies over real processes.

mod helpers;

use helpers::{leaf, shell, wait_for_file, within_timeout};
use std::sync::Arc;
use vproc::{next_event, EventKind, ProcessEvent, ProcessGroup, Signal, VirtualProcess};

// ===========================================================================
// Group 1: Pipelines
// ===========================================================================

#[tokio::test]
async fn test_two_stage_pipeline() {
    let echo = leaf("/bin/echo", &["foo", "bar"], false, true, false);
    let grep = shell("grep foo");
    let mut reader = grep.stdout().expect("stdout").subscribe();

    echo.pipe(grep.as_ref());

    let out = within_timeout(reader.read_to_end()).await.unwrap();
    assert_eq!(out, b"foo bar\n");
}

#[tokio::test]
async fn test_three_stage_pipeline_through_group() {
    // echo 'b\na\nb' | sort | uniq
    let echo = shell("printf 'b\\na\\nb\\n'");
    let sort = shell("sort");
    let uniq = shell("uniq");

    let group = ProcessGroup::pipeline(vec![echo, sort, uniq]);
    let mut reader = group.stdout().expect("stdout").subscribe();

    let out = within_timeout(reader.read_to_end()).await.unwrap();
    assert_eq!(out, b"a\nb\n");
}

#[tokio::test]
async fn test_pipeline_of_pipelines() {
    // Closure property: a group is a valid pipeline member.
    let inner = ProcessGroup::pipeline(vec![
        leaf("/bin/echo", &["foo", "bar", "foo"], false, true, false),
        shell("tr ' ' '\\n'"),
    ]);
    let outer = ProcessGroup::pipeline(vec![Arc::new(inner), shell("grep -c foo")]);

    let mut reader = outer.stdout().expect("stdout").subscribe();
    let out = within_timeout(reader.read_to_end()).await.unwrap();
    assert_eq!(out, b"2\n");
}

#[tokio::test]
async fn test_pipe_both_merges_streams() {
    let src = shell("printf 'out\\n'; printf 'err\\n' >&2");
    let cat = leaf("/bin/cat", &[], true, true, false);
    let mut reader = cat.stdout().expect("stdout").subscribe();

    src.pipe_both(cat.as_ref());

    let merged = String::from_utf8(within_timeout(reader.read_to_end()).await.unwrap()).unwrap();
    assert!(merged.contains("out\n"));
    assert!(merged.contains("err\n"));
    assert_eq!(merged.len(), 8);
}

// ===========================================================================
// Group 2: Lifecycle events
// ===========================================================================

#[tokio::test]
async fn test_pipeline_close_reports_last_member_status() {
    let head = leaf("/bin/echo", &["data"], false, true, false);
    let tail = shell("cat >/dev/null; exit 5");

    let group = ProcessGroup::pipeline(vec![head, tail]);
    let mut evs = group.events();

    let ev = within_timeout(next_event(&mut evs, EventKind::Close))
        .await
        .expect("close event");
    let ProcessEvent::Close(info) = ev else {
        unreachable!()
    };
    assert_eq!(info.code, Some(5));
    assert!(!info.success());
}

#[tokio::test]
async fn test_group_kill_stops_every_member() {
    let a = leaf("/bin/sleep", &["300"], false, false, false);
    let b = leaf("/bin/sleep", &["300"], false, false, false);
    let mut evs_a = a.events();
    let mut evs_b = b.events();

    let group = ProcessGroup::pipeline(vec![a, b]);
    group.kill(Signal::SIGTERM);

    for evs in [&mut evs_a, &mut evs_b] {
        let ev = within_timeout(next_event(evs, EventKind::Exit))
            .await
            .expect("exit event");
        let ProcessEvent::Exit(info) = ev else {
            unreachable!()
        };
        assert_eq!(info.signal, Some(Signal::SIGTERM as i32));
    }
}

#[tokio::test]
async fn test_nested_group_kill_reaches_leaves() {
    let sleeper = leaf("/bin/sleep", &["300"], false, false, false);
    let mut evs = sleeper.events();

    let outer = ProcessGroup::new(Arc::new(ProcessGroup::new(sleeper)));
    outer.kill(Signal::SIGKILL);

    let ev = within_timeout(next_event(&mut evs, EventKind::Exit))
        .await
        .expect("exit event");
    let ProcessEvent::Exit(info) = ev else {
        unreachable!()
    };
    assert_eq!(info.signal, Some(Signal::SIGKILL as i32));
}

// ===========================================================================
// Group 3: Redirections
// ===========================================================================

#[tokio::test]
async fn test_file_in_filter_file_out() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    let output = dir.path().join("output.txt");
    std::fs::write(&input, "keep this\ndrop that\nkeep too\n").unwrap();
    std::fs::write(&output, "stale").unwrap();

    let grep = shell("grep keep");
    within_timeout(grep.redirect_output(&output).ready())
        .await
        .unwrap();
    within_timeout(grep.redirect_input(&input).ready())
        .await
        .unwrap();

    wait_for_file(&output, b"keep this\nkeep too\n").await;
}

#[tokio::test]
async fn test_append_redirect_preserves_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("run.log");
    std::fs::write(&log, "run 1\n").unwrap();

    let echo = leaf("/bin/echo", &["run 2"], false, true, false);
    within_timeout(echo.redirect_output_append(&log).ready())
        .await
        .unwrap();

    wait_for_file(&log, b"run 1\nrun 2\n").await;
}

#[tokio::test]
async fn test_output_fans_out_to_pipe_and_file() {
    let dir = tempfile::tempdir().unwrap();
    let copy = dir.path().join("copy.txt");

    let echo = leaf("/bin/echo", &["both ways"], false, true, false);
    let cat = leaf("/bin/cat", &[], true, true, false);
    let mut reader = cat.stdout().expect("stdout").subscribe();

    // Wire both sinks before anything runs, then wait for the truncate.
    let redirection = echo.redirect_output(&copy);
    echo.pipe(cat.as_ref());
    within_timeout(redirection.ready()).await.unwrap();

    let piped = within_timeout(reader.read_to_end()).await.unwrap();
    assert_eq!(piped, b"both ways\n");
    wait_for_file(&copy, b"both ways\n").await;
}

#[tokio::test]
async fn test_group_redirect_applies_to_exit_member() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");

    let group = ProcessGroup::pipeline(vec![
        leaf("/bin/echo", &["foo", "bar"], false, true, false),
        shell("grep foo"),
    ]);
    within_timeout(group.redirect_output(&out).ready())
        .await
        .unwrap();

    wait_for_file(&out, b"foo bar\n").await;
}
