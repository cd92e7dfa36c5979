//! Write buffer and flush tests
//!
//! Size and timer triggers, single-flight flushing, read-your-writes and
//! failure handling of buffered writes.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sqlkv::{BatchOp, Engine, MemoryBackend, Options, StoreError, WriteOptions};

use common::{buffered, open_memory, rows, wait_until};

// =============================================================================
// Triggers
// =============================================================================

#[test]
fn test_buffered_writes_wait_for_flush() {
    let (backend, engine) = open_memory(buffered(10));

    engine.put("a", "1").unwrap();

    assert_eq!(engine.buffered_len(), 1);
    assert!(rows(&backend).is_empty());
    assert_eq!(backend.stats().transactions, 0);
}

#[test]
fn test_size_trigger_flushes_full_buffer() {
    let (backend, engine) = open_memory(buffered(3));

    engine.put("k1", "v").unwrap();
    engine.put("k2", "v").unwrap();
    assert!(rows(&backend).is_empty());

    engine.put("k3", "v").unwrap();
    assert_eq!(rows(&backend).len(), 3);
    assert_eq!(engine.buffered_len(), 0);
    assert_eq!(backend.stats().transactions, 1);

    engine.put("k4", "v").unwrap();
    assert_eq!(rows(&backend).len(), 3);
    assert_eq!(engine.buffered_len(), 1);
}

#[test]
fn test_batch_counts_every_op_toward_size() {
    let (backend, engine) = open_memory(buffered(3));

    engine
        .batch(vec![
            BatchOp::put("a", "1"),
            BatchOp::put("b", "2"),
            BatchOp::del("a"),
        ])
        .unwrap();

    assert_eq!(engine.buffered_len(), 0);
    assert_eq!(backend.stats().transactions, 1);
    assert_eq!(rows(&backend).len(), 1);
}

#[test]
fn test_sync_write_flushes_immediately() {
    let (backend, engine) = open_memory(buffered(100));

    engine
        .write(vec![BatchOp::put("a", "1")], &WriteOptions { sync: true })
        .unwrap();

    assert_eq!(engine.buffered_len(), 0);
    assert_eq!(rows(&backend).len(), 1);
}

#[test]
fn test_timer_flushes_buffered_writes() {
    let options = Options::builder()
        .write_buffer_size(100)
        .max_delay(Duration::from_millis(50))
        .build();
    let (backend, engine) = open_memory(options);

    engine.put("a", "1").unwrap();
    engine.put("b", "2").unwrap();
    engine.put("c", "3").unwrap();

    assert!(wait_until(Duration::from_secs(5), || engine.buffered_len() == 0));
    assert_eq!(rows(&backend).len(), 3);

    // Armed once for the three writes, and not re-armed by the flush
    thread::sleep(Duration::from_millis(200));
    assert_eq!(backend.stats().transactions, 1);
}

#[test]
fn test_timer_rearms_after_flush() {
    let options = Options::builder()
        .write_buffer_size(100)
        .max_delay(Duration::from_millis(30))
        .build();
    let (backend, engine) = open_memory(options);

    engine.put("a", "1").unwrap();
    assert!(wait_until(Duration::from_secs(5), || rows(&backend).len() == 1));

    engine.put("b", "2").unwrap();
    assert!(wait_until(Duration::from_secs(5), || rows(&backend).len() == 2));
    assert_eq!(backend.stats().transactions, 2);
}

#[test]
fn test_zero_delay_disables_timer() {
    let (backend, engine) = open_memory(buffered(100));

    engine.put("a", "1").unwrap();
    thread::sleep(Duration::from_millis(150));

    assert!(rows(&backend).is_empty());
    assert_eq!(engine.buffered_len(), 1);
}

#[test]
fn test_flush_empty_buffer_is_noop() {
    let (backend, engine) = open_memory(buffered(10));

    engine.flush().unwrap();
    engine.flush().unwrap();

    assert_eq!(backend.stats().transactions, 0);
    assert_eq!(engine.stats().flushes, 0);
}

#[test]
fn test_buffers_are_per_engine() {
    let backend = MemoryBackend::new();
    let first = Engine::open(backend.clone(), buffered(100)).unwrap();
    let second = Engine::open(backend.clone(), buffered(100)).unwrap();

    first.put("a", "1").unwrap();

    assert_eq!(first.buffered_len(), 1);
    assert_eq!(second.buffered_len(), 0);
    // The second engine has nothing to flush, so it cannot see the write yet
    assert!(second.get("a").unwrap_err().is_not_found());

    first.flush().unwrap();
    assert_eq!(second.get("a").unwrap(), b"1".to_vec());
}

// =============================================================================
// Read Your Writes
// =============================================================================

#[test]
fn test_get_flushes_pending_writes() {
    let (backend, engine) = open_memory(buffered(100));

    engine.put("a", "1").unwrap();
    assert_eq!(engine.get("a").unwrap(), b"1".to_vec());

    assert_eq!(rows(&backend).len(), 1);
    assert_eq!(backend.stats().transactions, 1);
}

#[test]
fn test_buffered_overwrite_and_delete() {
    let (_backend, engine) = open_memory(buffered(100));

    engine.put("a", "1").unwrap();
    engine.put("a", "2").unwrap();
    engine.put("b", "x").unwrap();
    engine.delete("b").unwrap();

    assert_eq!(engine.get("a").unwrap(), b"2".to_vec());
    assert!(engine.get("b").unwrap_err().is_not_found());
}

#[test]
fn test_buffered_batch_preserves_order() {
    let (backend, engine) = open_memory(buffered(100));

    engine
        .batch(vec![
            BatchOp::put("a", "1"),
            BatchOp::del("a"),
            BatchOp::put("a", "3"),
            BatchOp::put("b", "2"),
        ])
        .unwrap();

    assert_eq!(engine.get("a").unwrap(), b"3".to_vec());
    assert_eq!(engine.get("b").unwrap(), b"2".to_vec());
    assert_eq!(rows(&backend).len(), 2);
}

// =============================================================================
// Single Flight
// =============================================================================

#[test]
fn test_concurrent_reads_share_one_flush() {
    let (backend, engine) = open_memory(buffered(100));
    for i in 0..10 {
        engine.put(format!("k{}", i), format!("v{}", i)).unwrap();
    }
    backend.set_transaction_delay(Duration::from_millis(100));

    thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = &engine;
                s.spawn(move || engine.get(format!("k{}", i)))
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.join().unwrap().unwrap();
            assert_eq!(value, format!("v{}", i).into_bytes());
        }
    });

    let stats = backend.stats();
    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.max_concurrent_transactions, 1);
}

#[test]
fn test_writers_wait_for_in_flight_flush() {
    let (backend, engine) = open_memory(buffered(100));
    engine.put("a", "1").unwrap();
    backend.set_transaction_delay(Duration::from_millis(100));

    thread::scope(|s| {
        s.spawn(|| engine.flush().unwrap());
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            engine.put("a", "2").unwrap();
        });
    });

    backend.set_transaction_delay(Duration::ZERO);
    assert_eq!(engine.get("a").unwrap(), b"2".to_vec());
    assert_eq!(backend.stats().max_concurrent_transactions, 1);
}

#[test]
fn test_many_threads_write_and_read() {
    let backend = MemoryBackend::new();
    let engine = Arc::new(Engine::open(backend.clone(), buffered(8)).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..25 {
                    let key = format!("t{}-k{}", t, i);
                    engine.put(&key, format!("{}", i)).unwrap();
                    if i % 5 == 0 {
                        assert_eq!(engine.get(&key).unwrap(), format!("{}", i).into_bytes());
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    engine.flush().unwrap();
    for t in 0..4 {
        for i in 0..25 {
            let key = format!("t{}-k{}", t, i);
            assert_eq!(engine.get(&key).unwrap(), format!("{}", i).into_bytes());
        }
    }
    assert_eq!(backend.stats().max_concurrent_transactions, 1);
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_failed_flush_keeps_batch() {
    let (backend, engine) = open_memory(buffered(2));
    backend.fail_next_transactions(1);

    engine.put("a", "1").unwrap();
    let err = engine.put("b", "2").unwrap_err();

    assert!(matches!(err, StoreError::Transaction(_)));
    assert_eq!(engine.buffered_len(), 2);
    assert!(rows(&backend).is_empty());
    assert_eq!(engine.stats().failed_flushes, 1);

    engine.flush().unwrap();
    assert_eq!(rows(&backend).len(), 2);
    assert_eq!(engine.get("a").unwrap(), b"1".to_vec());
    assert_eq!(engine.get("b").unwrap(), b"2".to_vec());
}

#[test]
fn test_get_surfaces_flush_failure() {
    let (backend, engine) = open_memory(buffered(100));
    engine.put("a", "1").unwrap();
    backend.fail_next_transactions(1);

    let err = engine.get("a").unwrap_err();
    assert!(matches!(err, StoreError::Transaction(_)));
    assert!(!err.is_not_found());

    // The next read retries the flush
    assert_eq!(engine.get("a").unwrap(), b"1".to_vec());
}

#[test]
fn test_failed_flush_retried_by_timer() {
    let options = Options::builder()
        .write_buffer_size(100)
        .max_delay(Duration::from_millis(30))
        .build();
    let (backend, engine) = open_memory(options);
    backend.fail_next_transactions(1);

    engine.put("a", "1").unwrap();

    assert!(wait_until(Duration::from_secs(5), || rows(&backend).len() == 1));
    assert_eq!(engine.stats().failed_flushes, 1);
    assert_eq!(engine.buffered_len(), 0);
}

// =============================================================================
// Close
// =============================================================================

#[test]
fn test_close_flushes_pending_writes() {
    let (backend, engine) = open_memory(buffered(100));

    engine.put("a", "1").unwrap();
    engine.put("b", "2").unwrap();
    engine.close().unwrap();

    assert_eq!(rows(&backend).len(), 2);
}

#[test]
fn test_close_failure_keeps_store_open() {
    let (backend, engine) = open_memory(buffered(100));
    engine.put("a", "1").unwrap();
    backend.fail_next_transactions(1);

    let err = engine.close().unwrap_err();
    assert!(matches!(err, StoreError::Transaction(_)));
    assert_eq!(engine.buffered_len(), 1);

    assert_eq!(engine.get("a").unwrap(), b"1".to_vec());
    engine.close().unwrap();
    assert!(matches!(engine.put("b", "2"), Err(StoreError::NotOpen)));
}

#[test]
fn test_close_completes_when_compaction_fails() {
    let options = Options::builder()
        .write_buffer_size(100)
        .max_delay(Duration::from_secs(60))
        .compact_frequency(1)
        .build();
    let (backend, engine) = open_memory(options);
    engine.put("a", "1").unwrap();
    backend.fail_next_compactions(1);

    let err = engine.close().unwrap_err();

    assert!(matches!(err, StoreError::Compaction(_)));
    assert_eq!(engine.buffered_len(), 0);
    assert_eq!(rows(&backend).len(), 1);
    assert!(matches!(engine.put("b", "2"), Err(StoreError::NotOpen)));
    engine.close().unwrap();
}

#[test]
fn test_drop_flushes_pending_writes() {
    let backend = MemoryBackend::new();
    {
        let engine = Engine::open(backend.clone(), buffered(100)).unwrap();
        engine.put("a", "1").unwrap();
    }

    assert_eq!(rows(&backend).len(), 1);
}

#[test]
fn test_close_with_armed_timer() {
    let options = Options::builder()
        .write_buffer_size(100)
        .max_delay(Duration::from_secs(60))
        .build();
    let (backend, engine) = open_memory(options);

    engine.put("a", "1").unwrap();
    engine.close().unwrap();

    assert_eq!(rows(&backend).len(), 1);
    assert_eq!(backend.stats().transactions, 1);
}
