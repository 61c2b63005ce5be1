// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use flate2::read::MultiGzDecoder;
use slogd_core::category::{LogCategory, LogLevel};
use slogd_core::config::{ChannelRoute, SlogdConfig, StreamConfig};
use slogd_core::file_set::AppendOutcome;
use slogd_core::group::GroupSpec;
use slogd_core::record::LogRecord;
use slogd_core::store::{FlushTarget, LogStore};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn config(root: &TempDir) -> SlogdConfig {
    SlogdConfig {
        root_dir: root.path().to_path_buf(),
        ..SlogdConfig::default()
    }
}

fn group(id: u32, name: &str, file_size_kb: u64) -> GroupSpec {
    GroupSpec {
        id,
        name: name.to_string(),
        total_max_file_size_kb: 10 * 1024,
        file_size_kb,
        buffer_size_kb: 64,
        modules: vec![id],
        devices: 0,
        passthrough: false,
    }
}

/// Stream files in name order, which is creation order.
fn stream_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .collect();
    files.sort();
    files
}

fn concat(dir: &Path) -> Vec<u8> {
    stream_files(dir)
        .into_iter()
        .flat_map(|p| fs::read(p).unwrap())
        .collect()
}

fn records(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("record {i:08} {}\n", "p".repeat(83)))
        .collect()
}

fn write_group_records(file_size_kb: u64) -> (TempDir, Vec<u8>) {
    let root = TempDir::new().unwrap();
    let mut config = config(&root);
    config.groups = vec![Some(group(1, "drv", file_size_kb))];
    let store = LogStore::new(&config).unwrap();

    let mut expected = Vec::new();
    for line in records(2000) {
        assert_eq!(line.len(), 100);
        store
            .write(&LogRecord::new(LogCategory::Debug, LogLevel::Info, 1, line.as_bytes()))
            .unwrap();
        expected.extend_from_slice(line.as_bytes());
    }
    store.flush(FlushTarget::All).unwrap();
    (root, expected)
}

#[test]
fn group_records_persist_exactly_once() {
    let (root, expected) = write_group_records(1024);
    let dir = root.path().join("debug/drv");
    assert_eq!(expected.len(), 200_000);
    assert_eq!(concat(&dir), expected);
}

#[test]
fn group_records_survive_rotation() {
    let (root, expected) = write_group_records(16);
    let dir = root.path().join("debug/drv");
    let files = stream_files(&dir);
    assert!(files.len() > 10, "expected rotations, got {} files", files.len());
    for file in &files {
        assert!(fs::metadata(file).unwrap().len() <= 16 * 1024);
    }
    assert_eq!(concat(&dir), expected);
}

#[test]
fn quota_admits_ten_records_per_window() {
    let root = TempDir::new().unwrap();
    let mut config = config(&root);
    config.quota.enabled = true;
    config.quota.window_secs = 3600;
    // 24 KiB a day is 1 KiB per one-hour window
    config.quota.budgets.debug_kb = 24;
    let mut firmware = group(2, "fw", 1024);
    firmware.devices = 1;
    firmware.passthrough = true;
    config.groups = vec![Some(firmware)];
    config.channels = vec![ChannelRoute { channel: 3, module: 2 }];
    let store = LogStore::new(&config).unwrap();

    let mut persisted = 0;
    for line in records(2000) {
        if let AppendOutcome::Written { .. } = store.write_device(3, 0, line.as_bytes()).unwrap() {
            persisted += 1;
        }
    }
    assert_eq!(persisted, 1024 / 100);
    assert_eq!(concat(&root.path().join("debug/fw-0")).len(), 1000);
    assert_eq!(store.stats().drops.quota, 1990);
}

#[test]
fn buffered_quota_admits_ten_records_per_window() {
    let root = TempDir::new().unwrap();
    let mut config = config(&root);
    config.quota.enabled = true;
    config.quota.window_secs = 3600;
    config.quota.budgets.run_kb = 24;
    let store = LogStore::new(&config).unwrap();

    let lines = records(2000);
    for line in &lines {
        store
            .write(&LogRecord::new(LogCategory::Run, LogLevel::Info, 0, line.as_bytes()))
            .unwrap();
    }
    store.flush(FlushTarget::All).unwrap();

    let persisted = concat(&root.path().join("run/device-os"));
    assert_eq!(persisted, lines[..10].concat().into_bytes());
    assert_eq!(store.stats().drops.quota, 1990);
}

#[test]
fn startup_scan_evicts_oldest_and_adopts_newest() {
    let root = TempDir::new().unwrap();
    let dir = root.path().join("run/device-os");
    fs::create_dir_all(&dir).unwrap();
    let names: Vec<String> = (1..=5)
        .map(|i| format!("device-os_2024010100000{i}000.log"))
        .collect();
    for name in &names {
        fs::write(dir.join(name), vec![b'o'; 700]).unwrap();
    }

    let mut config = config(&root);
    // 1 KiB files, 2 KiB retained besides the active one
    config.categories.run = StreamConfig {
        file_size_kb: 1,
        file_num: 3,
        ..StreamConfig::default()
    };
    let store = LogStore::new(&config).unwrap();
    let left: Vec<String> = stream_files(&dir)
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(left, names[2..].to_vec());
    let footprint: u64 = stream_files(&dir)
        .iter()
        .map(|p| fs::metadata(p).unwrap().len())
        .sum();
    assert!(footprint <= 2048 + 1024);

    store
        .write(&LogRecord::new(LogCategory::Run, LogLevel::Info, 0, "resumed\n"))
        .unwrap();
    store.flush(FlushTarget::All).unwrap();
    let newest = fs::read(dir.join(&names[4])).unwrap();
    assert_eq!(newest.len(), 708);
    assert!(newest.ends_with(b"resumed\n"));
}

#[test]
fn compressed_streams_decode_and_settle_on_restart() {
    let root = TempDir::new().unwrap();
    let mut config = config(&root);
    config.compress = true;
    let dir = root.path().join("run/device-os");
    {
        let store = LogStore::new(&config).unwrap();
        for line in ["first\n", "second\n", "third\n"] {
            store
                .write(&LogRecord::new(LogCategory::Run, LogLevel::Info, 0, line))
                .unwrap();
            store.flush(FlushTarget::All).unwrap();
        }
        store.shutdown().unwrap();
    }
    let files = stream_files(&dir);
    assert_eq!(files.len(), 1);
    assert!(files[0].to_string_lossy().ends_with(".active.log.gz"));

    // the next run closes what the previous one left active
    drop(LogStore::new(&config).unwrap());
    let files = stream_files(&dir);
    assert_eq!(files.len(), 1);
    let name = files[0].to_string_lossy().into_owned();
    assert!(name.ends_with(".log.gz") && !name.contains("active"), "{name}");

    let mut text = String::new();
    MultiGzDecoder::new(fs::File::open(&files[0]).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    assert_eq!(text, "first\nsecond\nthird\n");
}

#[test]
fn new_app_stream_purges_older_app_dirs() {
    let root = TempDir::new().unwrap();
    let debug = root.path().join("debug");
    for pid in [1, 2] {
        let dir = debug.join(format!("device-app-{pid}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(format!("device-app-{pid}_20240101000000000.log")),
            vec![b'a'; 800],
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }

    let mut config = config(&root);
    config.app = StreamConfig {
        file_size_kb: 1,
        file_num: 2,
        ..StreamConfig::default()
    };
    let store = LogStore::new(&config).unwrap();
    store
        .write(&LogRecord::new(LogCategory::Debug, LogLevel::Info, 0, "1hello\n").from_app(3))
        .unwrap();
    store.flush(FlushTarget::App(3)).unwrap();

    assert!(!debug.join("device-app-1").exists());
    assert!(debug.join("device-app-2").exists());
    assert_eq!(concat(&debug.join("device-app-3")), b"hello\n");
}
