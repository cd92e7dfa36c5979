//! Shared helpers for integration tests

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use sqlkv::backend::LogRow;
use sqlkv::{Engine, MemoryBackend, Options};

/// Default table name used by `Options::default()`
pub const TABLE: &str = "kv_log";

/// Open an engine on a fresh in-memory backend, keeping a handle to the
/// backend for inspection
pub fn open_memory(options: Options) -> (MemoryBackend, Engine) {
    let backend = MemoryBackend::new();
    let engine = Engine::open(backend.clone(), options).unwrap();
    (backend, engine)
}

/// Buffered options with the flush timer disabled
pub fn buffered(capacity: usize) -> Options {
    Options::builder()
        .write_buffer_size(capacity)
        .max_delay(Duration::ZERO)
        .build()
}

/// Unbuffered options with a given compaction frequency
pub fn unbuffered(compact_frequency: u64) -> Options {
    Options::builder().compact_frequency(compact_frequency).build()
}

pub fn rows(backend: &MemoryBackend) -> Vec<LogRow> {
    backend.rows(TABLE).unwrap()
}

pub fn rows_for(backend: &MemoryBackend, key: &[u8]) -> Vec<LogRow> {
    rows(backend).into_iter().filter(|r| r.key == key).collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
