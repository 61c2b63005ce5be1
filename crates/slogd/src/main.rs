// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use slogd_core::{
    config, flusher::PeriodicFlusher, gateway::CollectionGateway, logger::Formatter,
    store::LogStore,
};

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("could not listen for SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("could not listen for Ctrl-C: {e}");
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let loaded = config::load();
    let log_level = loaded
        .as_ref()
        .map_or_else(|_| "info".to_string(), |c| c.log_level.clone());
    init_logging(&log_level);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match LogStore::new(&config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("could not initialize the log store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let gateway = CollectionGateway::new(Arc::clone(&store), config.collect.clone());
    if let Err(e) = gateway.start() {
        error!("could not start the collection gateway: {e}");
        return ExitCode::FAILURE;
    }

    let cancel = CancellationToken::new();
    let flusher = tokio::spawn(
        PeriodicFlusher::new(Arc::clone(&store), config.flush_interval(), cancel.clone()).run(),
    );
    info!(root = %config.root_dir.display(), "slogd started");

    wait_for_shutdown().await;
    info!("slogd shutting down");

    gateway.mark_shutting_down();
    cancel.cancel();
    if let Err(e) = flusher.await {
        warn!("periodic flusher ended abnormally: {e}");
    }
    gateway.stop().await;

    match tokio::task::spawn_blocking(move || store.shutdown()).await {
        Ok(Ok(summary)) => {
            info!(streams = summary.flushed, bytes = summary.bytes, "final flush done");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("final flush incomplete: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("final flush task failed: {e}");
            ExitCode::FAILURE
        }
    }
}
