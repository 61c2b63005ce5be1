// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk file naming: `<head><YYYYMMDDHHMMSSmmm><suffix>`.

use chrono::{DateTime, Duration, Local};

pub const PLAIN_SUFFIX: &str = ".log";
pub const COMPRESSED_SUFFIX: &str = ".log.gz";
pub const ACTIVE_COMPRESSED_SUFFIX: &str = ".active.log.gz";

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const TIMESTAMP_LEN: usize = 17;

/// Format of the file currently being appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveFormat {
    Plain,
    Compressed,
}

impl ActiveFormat {
    pub fn suffix(self) -> &'static str {
        match self {
            ActiveFormat::Plain => PLAIN_SUFFIX,
            ActiveFormat::Compressed => ACTIVE_COMPRESSED_SUFFIX,
        }
    }
}

pub fn timestamp(at: &DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// True for names belonging to the stream with this head.
pub fn matches_stream(name: &str, head: &str) -> bool {
    name_timestamp(name, head).is_some()
        && [PLAIN_SUFFIX, COMPRESSED_SUFFIX, ACTIVE_COMPRESSED_SUFFIX]
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

pub fn is_active_compressed(name: &str) -> bool {
    name.ends_with(ACTIVE_COMPRESSED_SUFFIX)
}

pub fn is_plain(name: &str) -> bool {
    name.ends_with(PLAIN_SUFFIX)
}

/// Name an active compressed file takes once it is closed.
pub fn rotated_name(active: &str) -> Option<String> {
    active
        .strip_suffix(ACTIVE_COMPRESSED_SUFFIX)
        .map(|stem| format!("{stem}{COMPRESSED_SUFFIX}"))
}

/// Name a plain file takes once compressed in place.
pub fn compressed_name(plain: &str) -> Option<String> {
    plain
        .strip_suffix(PLAIN_SUFFIX)
        .map(|stem| format!("{stem}{COMPRESSED_SUFFIX}"))
}

/// Issues strictly increasing names for one stream.
#[derive(Debug, Default)]
pub struct NameClock {
    last: Option<DateTime<Local>>,
}

impl NameClock {
    pub fn next_name(&mut self, head: &str, format: ActiveFormat) -> String {
        self.next_name_at(head, format, Local::now())
    }

    pub fn next_name_at(&mut self, head: &str, format: ActiveFormat, now: DateTime<Local>) -> String {
        let mut at = now;
        if let Some(last) = self.last {
            if timestamp(&at) <= timestamp(&last) {
                at = last + Duration::milliseconds(1);
            }
        }
        self.last = Some(at);
        format!("{head}{}{}", timestamp(&at), format.suffix())
    }
}

/// Extracts the timestamp part of a stream file name.
pub fn name_timestamp<'a>(name: &'a str, head: &str) -> Option<&'a str> {
    let rest = name.strip_prefix(head)?;
    let stamp = rest.get(..TIMESTAMP_LEN)?;
    stamp.bytes().all(|b| b.is_ascii_digit()).then_some(stamp)
}
