// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background worker writing gzipped snapshots of the staged logs to
//! caller-chosen paths.

use crate::compress::{Compressor, GzipCompressor};
use crate::error::{GatewayError, LogError};
use crate::group::MAX_PATH_LEN;
use crate::store::LogStore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Collections allowed in flight when the configuration does not say.
pub const DEFAULT_MAX_PENDING: usize = 10;

pub type CollectOutcome = Result<u64, LogError>;

#[derive(Debug)]
pub enum CollectCommand {
    Collect {
        path: PathBuf,
        response_tx: oneshot::Sender<CollectOutcome>,
    },
    Shutdown,
}

/// Checks a collection target: a non-empty absolute path whose parent is an
/// existing writable directory.
pub fn validate_path(raw: &str) -> Result<PathBuf, GatewayError> {
    if raw.is_empty() {
        return Err(GatewayError::InvalidInput("empty collection path".to_string()));
    }
    if raw.len() > MAX_PATH_LEN {
        return Err(GatewayError::InvalidInput(format!(
            "collection path is {} bytes, limit is {MAX_PATH_LEN}",
            raw.len()
        )));
    }
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(GatewayError::InvalidInput(format!(
            "collection path {raw} is not absolute"
        )));
    }
    let parent = match path.parent() {
        Some(parent) if path.file_name().is_some() => parent,
        _ => {
            return Err(GatewayError::InvalidInput(format!(
                "collection path {raw} names no file"
            )))
        }
    };
    match fs::metadata(parent) {
        Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Ok(path),
        Ok(_) => Err(GatewayError::InvalidInput(format!(
            "{} is not a writable directory",
            parent.display()
        ))),
        Err(e) => Err(GatewayError::InvalidInput(format!(
            "{}: {e}",
            parent.display()
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct CollectHandle {
    tx: mpsc::UnboundedSender<CollectCommand>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl CollectHandle {
    /// Collections accepted and not yet written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queues a collection. Refused with `Busy` when `max_pending` are
    /// already in flight.
    pub fn submit(&self, path: PathBuf) -> Result<oneshot::Receiver<CollectOutcome>, GatewayError> {
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_pending).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(GatewayError::Busy(self.max_pending));
        }
        let (response_tx, response_rx) = oneshot::channel();
        if let Err(e) = self.tx.send(CollectCommand::Collect { path, response_tx }) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(GatewayError::Failed(format!(
                "Failed to send collect command: {e}"
            )));
        }
        Ok(response_rx)
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<CollectCommand>> {
        self.tx.send(CollectCommand::Shutdown)
    }
}

pub struct CollectService {
    store: Arc<LogStore>,
    rx: mpsc::UnboundedReceiver<CollectCommand>,
    pending: Arc<AtomicUsize>,
    snapshot_len: usize,
}

impl CollectService {
    pub fn new(
        store: Arc<LogStore>,
        max_pending: usize,
        snapshot_len: usize,
    ) -> (Self, CollectHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let service = Self {
            store,
            rx,
            pending: Arc::clone(&pending),
            snapshot_len,
        };
        let handle = CollectHandle {
            tx,
            pending,
            max_pending,
        };
        (service, handle)
    }

    /// Serves requests in arrival order until `Shutdown`; requests queued
    /// before it are still written.
    pub async fn run(mut self) {
        debug!("Collect service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                CollectCommand::Collect { path, response_tx } => {
                    let store = Arc::clone(&self.store);
                    let snapshot_len = self.snapshot_len;
                    let target = path.clone();
                    let outcome = tokio::task::spawn_blocking(move || {
                        write_snapshot(&store, &target, snapshot_len)
                    })
                    .await
                    .unwrap_or_else(|e| Err(LogError::io(&path, std::io::Error::other(e))));
                    self.pending.fetch_sub(1, Ordering::AcqRel);

                    match &outcome {
                        Ok(bytes) => debug!(path = %path.display(), bytes, "collection written"),
                        Err(e) => warn!(path = %path.display(), "collection failed: {e}"),
                    }
                    if response_tx.send(outcome).is_err() {
                        debug!("collect requester went away before completion");
                    }
                }
                CollectCommand::Shutdown => {
                    debug!("Collect service shutting down");
                    break;
                }
            }
        }

        let abandoned = self.pending.swap(0, Ordering::AcqRel);
        if abandoned > 0 {
            error!(abandoned, "collect service stopped with requests in flight");
        }
        debug!("Collect service stopped");
    }
}

/// Gzips the newest staged bytes of every buffer into `path`, replacing
/// whatever it held. Returns the compressed size.
fn write_snapshot(store: &LogStore, path: &Path, snapshot_len: usize) -> Result<u64, LogError> {
    let snapshot = store.collect_snapshot(snapshot_len);
    let packed = GzipCompressor::default()
        .compress(&snapshot)
        .map_err(LogError::Compress)?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| LogError::io(path, e))?;
    file.write_all(&packed).map_err(|e| LogError::io(path, e))?;
    file.sync_all().map_err(|e| LogError::io(path, e))?;
    Ok(packed.len() as u64)
}
