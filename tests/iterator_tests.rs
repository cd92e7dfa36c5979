//! Iterator tests
//!
//! Range bounds, direction, limits and paging over the current value of
//! each key.

mod common;

use serde_json::json;
use sqlkv::backend::Statement;
use sqlkv::{Backend, Engine, IterOptions, Options, ReadOptions, Value};

use common::{buffered, open_memory, TABLE};

fn seeded(options: Options) -> (sqlkv::MemoryBackend, Engine) {
    let (backend, engine) = open_memory(options);
    for key in ["a", "b", "c", "d", "e"] {
        engine.put(key, format!("{}-old", key)).unwrap();
        engine.put(key, format!("{}-val", key)).unwrap();
    }
    (backend, engine)
}

fn collect(engine: &Engine, options: IterOptions) -> Vec<(String, String)> {
    engine
        .iter(options)
        .unwrap()
        .map(|entry| {
            let (key, value) = entry.unwrap();
            let value = match value {
                Value::Bytes(bytes) => String::from_utf8(bytes).unwrap(),
                Value::Json(json) => json.to_string(),
            };
            (String::from_utf8(key).unwrap(), value)
        })
        .collect()
}

fn keys(entries: &[(String, String)]) -> Vec<&str> {
    entries.iter().map(|(k, _)| k.as_str()).collect()
}

fn key(s: &str) -> Option<Vec<u8>> {
    Some(s.as_bytes().to_vec())
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_iterate_all_in_key_order() {
    let (_backend, engine) = seeded(Options::default());

    let entries = collect(&engine, IterOptions::default());

    assert_eq!(keys(&entries), vec!["a", "b", "c", "d", "e"]);
    // One entry per key, holding the latest value
    assert!(entries.iter().all(|(k, v)| *v == format!("{}-val", k)));
}

#[test]
fn test_iterate_reverse() {
    let (_backend, engine) = seeded(Options::default());

    let entries = collect(
        &engine,
        IterOptions {
            reverse: true,
            ..IterOptions::default()
        },
    );

    assert_eq!(keys(&entries), vec!["e", "d", "c", "b", "a"]);
}

#[test]
fn test_iterate_empty_store() {
    let (_backend, engine) = open_memory(Options::default());
    assert!(collect(&engine, IterOptions::default()).is_empty());
}

// =============================================================================
// Bounds
// =============================================================================

#[test]
fn test_inclusive_lower_exclusive_upper() {
    let (_backend, engine) = seeded(Options::default());

    let entries = collect(
        &engine,
        IterOptions {
            gte: key("b"),
            lt: key("d"),
            ..IterOptions::default()
        },
    );

    assert_eq!(keys(&entries), vec!["b", "c"]);
}

#[test]
fn test_exclusive_lower_inclusive_upper() {
    let (_backend, engine) = seeded(Options::default());

    let entries = collect(
        &engine,
        IterOptions {
            gt: key("b"),
            lte: key("d"),
            ..IterOptions::default()
        },
    );

    assert_eq!(keys(&entries), vec!["c", "d"]);
}

#[test]
fn test_bounds_in_reverse() {
    let (_backend, engine) = seeded(Options::default());

    let entries = collect(
        &engine,
        IterOptions {
            gte: key("b"),
            lte: key("d"),
            reverse: true,
            ..IterOptions::default()
        },
    );

    assert_eq!(keys(&entries), vec!["d", "c", "b"]);
}

#[test]
fn test_bounds_between_keys() {
    let (_backend, engine) = seeded(Options::default());

    let entries = collect(
        &engine,
        IterOptions {
            gt: key("bb"),
            lt: key("dd"),
            ..IterOptions::default()
        },
    );

    assert_eq!(keys(&entries), vec!["c", "d"]);
}

// =============================================================================
// Limits and Paging
// =============================================================================

#[test]
fn test_limit() {
    let (_backend, engine) = seeded(Options::default());

    let forward = collect(
        &engine,
        IterOptions {
            limit: Some(2),
            ..IterOptions::default()
        },
    );
    let backward = collect(
        &engine,
        IterOptions {
            limit: Some(2),
            reverse: true,
            ..IterOptions::default()
        },
    );

    assert_eq!(keys(&forward), vec!["a", "b"]);
    assert_eq!(keys(&backward), vec!["e", "d"]);
}

#[test]
fn test_limit_zero() {
    let (_backend, engine) = seeded(Options::default());

    let entries = collect(
        &engine,
        IterOptions {
            limit: Some(0),
            ..IterOptions::default()
        },
    );

    assert!(entries.is_empty());
}

#[test]
fn test_small_pages() {
    let (_backend, engine) = seeded(Options::default());

    for page_size in [1, 2, 3, 5, 10] {
        let forward = collect(
            &engine,
            IterOptions {
                page_size,
                ..IterOptions::default()
            },
        );
        let backward = collect(
            &engine,
            IterOptions {
                page_size,
                reverse: true,
                ..IterOptions::default()
            },
        );

        assert_eq!(keys(&forward), vec!["a", "b", "c", "d", "e"], "page_size {}", page_size);
        assert_eq!(keys(&backward), vec!["e", "d", "c", "b", "a"], "page_size {}", page_size);
    }
}

#[test]
fn test_limit_across_pages() {
    let (_backend, engine) = seeded(Options::default());

    let entries = collect(
        &engine,
        IterOptions {
            gt: key("a"),
            limit: Some(3),
            page_size: 2,
            ..IterOptions::default()
        },
    );

    assert_eq!(keys(&entries), vec!["b", "c", "d"]);
}

// =============================================================================
// Contents
// =============================================================================

#[test]
fn test_iterator_sees_buffered_writes() {
    let (_backend, engine) = open_memory(buffered(100));
    engine.put("x", "1").unwrap();
    engine.put("y", "2").unwrap();
    engine.delete("x").unwrap();

    let entries = collect(&engine, IterOptions::default());

    assert_eq!(entries, vec![("y".to_string(), "2".to_string())]);
    assert_eq!(engine.buffered_len(), 0);
}

#[test]
fn test_iterate_json_shape() {
    let (_backend, engine) = open_memory(Options::default());
    engine.put("doc", json!({"n": 1})).unwrap();
    engine.put("text", "hi").unwrap();

    let entries: Vec<_> = engine
        .iter(IterOptions {
            read: ReadOptions::json(),
            ..IterOptions::default()
        })
        .unwrap()
        .collect::<sqlkv::Result<_>>()
        .unwrap();

    assert_eq!(
        entries,
        vec![
            (b"doc".to_vec(), Value::Json(json!({"n": 1}))),
            (b"text".to_vec(), Value::Json(json!("hi"))),
        ]
    );
}

#[test]
fn test_iterator_skips_undecodable_rows() {
    let (backend, engine) = seeded(Options::default());
    backend
        .execute(&Statement::Insert {
            table: TABLE,
            key: b"c",
            value: "{broken",
        })
        .unwrap();

    let entries = collect(&engine, IterOptions::default());

    assert_eq!(keys(&entries), vec!["a", "b", "d", "e"]);
    assert_eq!(engine.stats().decode_failures, 1);
}

#[test]
fn test_iterator_after_close_fails() {
    let (_backend, engine) = seeded(Options::default());
    engine.close().unwrap();

    assert!(engine.iter(IterOptions::default()).is_err());
}
