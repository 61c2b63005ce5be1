// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use flate2::{write::GzEncoder, Compression};
use std::fmt::Debug;
use std::io::Write;

/// Codec applied to payloads before they are appended.
pub trait Compressor: Debug + Send + Sync {
    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Each call produces an independent gzip member; members appended to one
/// file decode as a single stream.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: Compression,
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl GzipCompressor {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    #[test]
    fn test_members_concatenate() {
        let gzip = GzipCompressor::default();
        let mut joined = gzip.compress(b"first line\n").unwrap();
        joined.extend(gzip.compress(b"second line\n").unwrap());

        let mut out = String::new();
        MultiGzDecoder::new(joined.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "first line\nsecond line\n");
    }

    #[test]
    fn test_level_is_clamped() {
        let gzip = GzipCompressor::with_level(42);
        assert_eq!(gzip.level.level(), 9);
    }
}
