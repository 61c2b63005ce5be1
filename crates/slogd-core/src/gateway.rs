// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control plane: the only way external commands reach the store.
//!
//! A failing command is answered with a coded [`GatewayError`]; the gateway
//! keeps serving afterwards.

use crate::collect::{self, CollectHandle, CollectService};
use crate::config::CollectConfig;
use crate::error::GatewayError;
use crate::group::{FlushSummary, MAX_FILE_NAME_LEN};
use crate::level::LevelReport;
use crate::store::{FlushTarget, LogPatterns, LogStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands accepted over the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drain and sync every stream, or only those of one application.
    Flush { app_pid: Option<u32> },
    GetLevel,
    /// Write a gzipped snapshot of the staged logs to `path`.
    Collect { path: String },
    CollectPattern { filter: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Done(FlushSummary),
    Level(LevelReport),
    Patterns(LogPatterns),
    /// The collection was queued; `pending` counts it.
    Collecting { pending: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Stopped,
    Started,
}

#[derive(Debug)]
struct Collector {
    handle: CollectHandle,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct Inner {
    state: GatewayState,
    collector: Option<Collector>,
}

#[derive(Debug)]
pub struct CollectionGateway {
    store: Arc<LogStore>,
    collect: CollectConfig,
    inner: Mutex<Inner>,
    shutting_down: AtomicBool,
}

/// Checks a `COLLECT_PATTERN` filter: a plain name prefix.
pub fn validate_filter(filter: &str) -> Result<(), GatewayError> {
    if filter.len() > MAX_FILE_NAME_LEN {
        return Err(GatewayError::InvalidInput(format!(
            "pattern filter is {} bytes, limit is {MAX_FILE_NAME_LEN}",
            filter.len()
        )));
    }
    if filter.contains('/') || filter.contains("..") {
        return Err(GatewayError::InvalidInput(format!(
            "pattern filter {filter:?} must not name a path"
        )));
    }
    Ok(())
}

impl CollectionGateway {
    pub fn new(store: Arc<LogStore>, collect: CollectConfig) -> Self {
        Self {
            store,
            collect,
            inner: Mutex::new(Inner {
                state: GatewayState::Stopped,
                collector: None,
            }),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock poisoned")
    }

    pub fn state(&self) -> GatewayState {
        self.inner().state
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// From then on flush commands are refused.
    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Stopped → Started: spawns the collection worker. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner();
        if inner.state == GatewayState::Started {
            return Err(GatewayError::AlreadyStarted);
        }
        let snapshot_len =
            usize::try_from(self.collect.snapshot_kb.saturating_mul(1024)).unwrap_or(usize::MAX);
        let (service, handle) =
            CollectService::new(Arc::clone(&self.store), self.collect.max_pending, snapshot_len);
        let task = tokio::spawn(service.run());
        inner.collector = Some(Collector { handle, task });
        inner.state = GatewayState::Started;
        info!("collection gateway started");
        Ok(())
    }

    /// Started → Stopped: the collection worker finishes what it has queued
    /// and exits. Stopping a stopped gateway is a no-op.
    pub async fn stop(&self) {
        let collector = {
            let mut inner = self.inner();
            inner.state = GatewayState::Stopped;
            inner.collector.take()
        };
        let Some(collector) = collector else {
            return;
        };
        if collector.handle.shutdown().is_err() {
            debug!("collect service already gone");
        }
        if let Err(e) = collector.task.await {
            warn!("collect service task failed: {e}");
        }
        info!("collection gateway stopped");
    }

    pub async fn dispatch(&self, command: Command) -> Result<CommandReply, GatewayError> {
        debug!(?command, "dispatching command");
        let reply = match command {
            Command::GetLevel => Ok(CommandReply::Level(self.store.levels().report())),
            Command::CollectPattern { filter } => {
                validate_filter(&filter)?;
                Ok(CommandReply::Patterns(self.store.patterns(&filter)))
            }
            Command::Flush { app_pid } => self.flush(app_pid).await,
            Command::Collect { path } => self.collect(&path),
        };
        if let Err(e) = &reply {
            debug!(code = e.code(), "command refused: {e}");
        }
        reply
    }

    fn collector(&self) -> Result<CollectHandle, GatewayError> {
        let inner = self.inner();
        match (&inner.state, &inner.collector) {
            (GatewayState::Started, Some(collector)) => Ok(collector.handle.clone()),
            _ => Err(GatewayError::NotStarted),
        }
    }

    async fn flush(&self, app_pid: Option<u32>) -> Result<CommandReply, GatewayError> {
        if self.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }
        if self.state() != GatewayState::Started {
            return Err(GatewayError::NotStarted);
        }
        let target = app_pid.map_or(FlushTarget::All, FlushTarget::App);
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.flush(target))
            .await
            .map_err(|e| GatewayError::Failed(e.to_string()))?
            .map(CommandReply::Done)
            .map_err(|e| GatewayError::Failed(e.to_string()))
    }

    fn collect(&self, path: &str) -> Result<CommandReply, GatewayError> {
        let handle = self.collector()?;
        let path = collect::validate_path(path)?;
        // the outcome is logged by the worker
        drop(handle.submit(path)?);
        Ok(CommandReply::Collecting {
            pending: handle.pending(),
        })
    }
}
