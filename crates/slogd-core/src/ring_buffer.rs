// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity byte staging area between producers and the file path.
//!
//! The buffer is owned by its stream. Callers work through [`BufferHandle`]s,
//! which borrow the buffer and only track how many views are open. No I/O
//! happens while the ring lock is held; draining to disk is delegated to a
//! [`Drain`] implementation.

use crate::error::LogError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Smallest read a flusher may request by default.
pub const DEFAULT_READ_UNIT: usize = 1024;

const MAX_DRAIN_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Producers and the flusher: write, read, reset.
    ReadWrite,
    /// Collectors: non-destructive inspection only.
    Snapshot,
}

/// Moves the staged bytes of a buffer somewhere durable.
pub trait Drain {
    /// Empties `buffer`, returning the number of bytes moved.
    fn drain(&self, buffer: &RingBuffer) -> Result<usize, LogError>;

    /// Drains until `data` fits, then stages it. Used once plain drains keep
    /// losing the freed space to other producers; implementations that can
    /// keep competing drains out should loop until the write lands.
    fn drain_and_stage(&self, buffer: &RingBuffer, data: &[u8]) -> Result<(), LogError> {
        self.drain(buffer)?;
        if buffer.try_stage(data) {
            Ok(())
        } else {
            Err(LogError::ResourceExhausted(format!(
                "buffer {} stayed full after draining",
                buffer.name
            )))
        }
    }
}

#[derive(Debug)]
struct Ring {
    bytes: Box<[u8]>,
    head: usize,
    len: usize,
    written: u64,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn tail(&self) -> usize {
        (self.head + self.len) % self.capacity()
    }

    fn push(&mut self, data: &[u8]) {
        let capacity = self.capacity();
        let tail = self.tail();
        let first = data.len().min(capacity - tail);
        self.bytes[tail..tail + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.bytes[..rest].copy_from_slice(&data[first..]);
        self.len += data.len();
        self.written += data.len() as u64;
    }

    fn pop(&mut self, max_len: usize) -> Vec<u8> {
        let count = max_len.min(self.len);
        let out = self.copy_from(self.head, count);
        self.head = (self.head + count) % self.capacity();
        self.len -= count;
        out
    }

    fn copy_from(&self, start: usize, count: usize) -> Vec<u8> {
        let capacity = self.capacity();
        let first = count.min(capacity - start);
        let mut out = Vec::with_capacity(count);
        out.extend_from_slice(&self.bytes[start..start + first]);
        out.extend_from_slice(&self.bytes[..count - first]);
        out
    }

    /// Newest `max_len` bytes ever written that are still physically in the
    /// ring, whether or not they were already drained.
    fn newest(&self, max_len: usize) -> (Vec<u8>, bool) {
        let capacity = self.capacity();
        let history = usize::try_from(self.written).map_or(capacity, |w| w.min(capacity));
        let count = max_len.min(history);
        let start = (self.tail() + capacity - count) % capacity;
        let truncated = (count as u64) < self.written;
        (self.copy_from(start, count), truncated)
    }
}

#[derive(Debug)]
pub struct RingBuffer {
    name: String,
    read_unit: usize,
    ring: Mutex<Ring>,
    open_handles: AtomicUsize,
}

impl RingBuffer {
    pub fn new(name: impl Into<String>, capacity: usize, read_unit: usize) -> Result<Self, LogError> {
        let name = name.into();
        if capacity == 0 {
            return Err(LogError::InputInvalid(format!(
                "buffer {name} needs a positive capacity"
            )));
        }
        Ok(Self {
            read_unit: read_unit.clamp(1, capacity),
            ring: Mutex::new(Ring {
                bytes: vec![0; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
                written: 0,
            }),
            open_handles: AtomicUsize::new(0),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_unit(&self) -> usize {
        self.read_unit
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.lock().len == 0
    }

    pub fn open(&self, mode: AccessMode) -> BufferHandle<'_> {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
        BufferHandle { buffer: self, mode }
    }

    /// Stages `data` if it fits the free space, without draining.
    pub fn try_stage(&self, data: &[u8]) -> bool {
        let mut ring = self.lock();
        if ring.len + data.len() > ring.capacity() {
            return false;
        }
        ring.push(data);
        true
    }

    /// Number of handles currently borrowing this buffer.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ring> {
        #[allow(clippy::expect_used)]
        self.ring.lock().expect("lock poisoned")
    }
}

/// A borrowed view on a [`RingBuffer`]. Dropping it closes the view; the
/// buffer itself lives as long as its owner.
#[derive(Debug)]
pub struct BufferHandle<'a> {
    buffer: &'a RingBuffer,
    mode: AccessMode,
}

impl BufferHandle<'_> {
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn require_read_write(&self, op: &str) -> Result<(), LogError> {
        match self.mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::Snapshot => Err(LogError::InputInvalid(format!(
                "{op} on snapshot handle of {}",
                self.buffer.name
            ))),
        }
    }

    /// Appends `data`. Staged bytes are drained first when `data` does not fit
    /// the free space; a record larger than the whole buffer is refused.
    ///
    /// Other producers may refill the buffer between a drain and the retry.
    /// After a few lost races the write is handed to
    /// [`Drain::drain_and_stage`].
    pub fn write(&self, data: &[u8], drain: &dyn Drain) -> Result<(), LogError> {
        self.require_read_write("write")?;
        let capacity = self.buffer.capacity();
        if data.len() > capacity {
            return Err(LogError::ResourceExhausted(format!(
                "record of {} bytes exceeds buffer {} capacity {capacity}",
                data.len(),
                self.buffer.name
            )));
        }
        for _ in 0..MAX_DRAIN_ATTEMPTS {
            if self.buffer.try_stage(data) {
                return Ok(());
            }
            if let Err(e) = drain.drain(self.buffer) {
                warn!(buffer = %self.buffer.name, "drain failed, discarding staged bytes: {e}");
                self.reset()?;
            }
        }
        drain.drain_and_stage(self.buffer, data)
    }

    /// True when `incoming` bytes would not fit the free space.
    pub fn check_full(&self, incoming: usize) -> bool {
        let ring = self.buffer.lock();
        ring.len + incoming > ring.capacity()
    }

    pub fn check_empty(&self) -> bool {
        self.buffer.lock().len == 0
    }

    /// Consumes up to `max_len` bytes in write order. An empty result means
    /// the buffer was empty.
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>, LogError> {
        self.require_read_write("read")?;
        if max_len < self.buffer.read_unit {
            return Err(LogError::InputInvalid(format!(
                "read of {max_len} bytes is below unit size {}",
                self.buffer.read_unit
            )));
        }
        Ok(self.buffer.lock().pop(max_len))
    }

    /// Drops every staged byte.
    pub fn reset(&self) -> Result<(), LogError> {
        self.require_read_write("reset")?;
        let mut ring = self.buffer.lock();
        ring.head = ring.tail();
        ring.len = 0;
        Ok(())
    }

    /// Copies the newest bytes without consuming them. When older history is
    /// cut off, the copy starts after the first newline so it begins on a
    /// record boundary.
    pub fn collect_newest(&self, max_len: usize) -> Vec<u8> {
        let (bytes, truncated) = self.buffer.lock().newest(max_len);
        if !truncated {
            return bytes;
        }
        match bytes.iter().position(|b| *b == b'\n') {
            Some(at) => bytes[at + 1..].to_vec(),
            None => bytes,
        }
    }
}

impl Drop for BufferHandle<'_> {
    fn drop(&mut self) {
        self.buffer.open_handles.fetch_sub(1, Ordering::AcqRel);
    }
}
