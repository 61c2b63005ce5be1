// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::category::{LogCategory, LogLevel};

/// Identifier of the producing module.
pub type ModuleId = u32;

/// One serialized log record as delivered by the transport.
///
/// The payload is already formatted; the store copies it verbatim into a
/// ring buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub category: LogCategory,
    pub level: LogLevel,
    pub module: ModuleId,
    /// Set for records produced by an application process.
    pub app_pid: Option<u32>,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(
        category: LogCategory,
        level: LogLevel,
        module: ModuleId,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            category,
            level,
            module,
            app_pid: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn from_app(mut self, pid: u32) -> Self {
        self.app_pid = Some(pid);
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bytes to persist. App transports prefix the message with a single
    /// level digit which is not part of the log line.
    pub fn persisted_bytes(&self) -> &[u8] {
        match (self.app_pid, self.payload.first()) {
            (Some(_), Some(first)) if first.is_ascii_digit() => &self.payload[1..],
            _ => &self.payload,
        }
    }
}
