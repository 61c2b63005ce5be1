// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # slogd core
//!
//! Local durable buffering of categorized log records with a bounded disk
//! footprint.
//!
//! - [`store`]: routes records to host, application and group streams
//! - [`stream`] and [`ring_buffer`]: in-memory staging and the drain to disk
//! - [`file_set`]: active file, rotation, aging and eviction of one stream
//! - [`quota`]: time-windowed byte budget
//! - [`group`]: module groups sharing a stream, optionally per device
//! - [`gateway`] and [`collect`]: control-plane commands
//! - [`flusher`]: periodic drain worker

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod category;
pub mod collect;
pub mod compress;
pub mod config;
pub mod diag;
pub mod error;
pub mod file_set;
pub mod flusher;
pub mod gateway;
pub mod group;
pub mod level;
pub mod logger;
pub mod naming;
pub mod quota;
pub mod record;
pub mod ring_buffer;
pub mod store;
pub mod stream;
