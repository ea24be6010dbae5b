// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! File redirections for stdio slots.
//!
//! All redirections are fire-and-forget: the connection work happens on a
//! background task and the caller is never blocked. Output redirection is a
//! two-stage operation (truncate/open, then connect); the [`Redirection`]
//! returned by every operation resolves once the first stage has completed,
//! so a caller that must sequence against the truncation can await it.
//! Failures resolve the [`Redirection`] with the error and are additionally
//! delivered in-band on the affected slot, so dropping the handle never
//! swallows a failure.

use crate::stream::{StreamError, StreamHandle};
use bytes::BytesMut;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

const READ_CHUNK: usize = 8192;

/// Completion signal for the setup stage of a redirection: the source file
/// has been opened, or the destination file has been created/truncated and
/// opened. Dropping it is allowed; the redirection proceeds regardless.
pub struct Redirection {
    rx: oneshot::Receiver<Result<(), StreamError>>,
}

impl Redirection {
    /// Wait until the redirection's setup stage has completed or failed.
    pub async fn ready(self) -> Result<(), StreamError> {
        self.rx.await.unwrap_or(Err(StreamError::Closed))
    }

    fn settled(result: Result<(), StreamError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

/// Open `path` for reading and register it as one more producer on the slot.
/// The producer ends at file EOF, never closing the slot while other
/// producers remain.
pub(crate) fn file_into_slot(slot: Option<&StreamHandle>, path: &Path) -> Redirection {
    let Some(slot) = slot else {
        return Redirection::settled(Err(StreamError::Closed));
    };
    // Register the producer before handing off, so the slot cannot end while
    // the open is still in flight.
    let writer = slot.writer();
    let path: PathBuf = path.to_owned();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut file = match File::open(&path).await {
            Ok(file) => {
                let _ = tx.send(Ok(()));
                file
            }
            Err(err) => {
                warn!("redirect input: opening {} failed: {err}", path.display());
                let err = StreamError::from(err);
                writer.error(err.clone()).await;
                writer.end().await;
                let _ = tx.send(Err(err));
                return;
            }
        };

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            match file.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if writer.send(buf.split().freeze()).await.is_err() {
                        debug!("redirect input: slot closed, stopping");
                        return;
                    }
                }
                Err(err) => {
                    warn!("redirect input: reading {} failed: {err}", path.display());
                    writer.error(err.into()).await;
                    break;
                }
            }
        }
        writer.end().await;
    });

    Redirection { rx }
}

/// Subscribe to the slot and stream every chunk into `path`. With `append`
/// unset the file is created/truncated first; the subscription is taken
/// before the open, so no byte can reach the file ahead of the truncation.
pub(crate) fn slot_into_file(
    slot: Option<&StreamHandle>,
    path: &Path,
    append: bool,
) -> Redirection {
    let Some(slot) = slot else {
        return Redirection::settled(Err(StreamError::Closed));
    };
    let mut reader = slot.subscribe();
    let slot = slot.clone();
    let path: PathBuf = path.to_owned();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }

        let mut file = match options.open(&path).await {
            Ok(file) => {
                let _ = tx.send(Ok(()));
                file
            }
            Err(err) => {
                warn!("redirect output: opening {} failed: {err}", path.display());
                let err = StreamError::from(err);
                report_on_slot(&slot, err.clone()).await;
                let _ = tx.send(Err(err));
                return;
            }
        };

        while let Some(chunk) = reader.recv().await {
            match chunk {
                Ok(data) => {
                    if let Err(err) = file.write_all(&data).await {
                        warn!("redirect output: writing {} failed: {err}", path.display());
                        report_on_slot(&slot, err.into()).await;
                        return;
                    }
                }
                Err(err) => debug!("redirect output: skipping in-band error: {err}"),
            }
        }
        if let Err(err) = file.flush().await {
            warn!("redirect output: flushing {} failed: {err}", path.display());
        }
    });

    Redirection { rx }
}

/// Make a redirection failure observable to every consumer of the slot.
async fn report_on_slot(slot: &StreamHandle, err: StreamError) {
    let writer = slot.writer();
    writer.error(err).await;
    writer.end().await;
}
