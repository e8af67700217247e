//! Streaming queries through a live connection.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use columnar_bridge::error::{Error, ErrorKind};
use columnar_bridge::memory::{UNAMBIGUOUS_TIMEOUT, UNKNOWN_STATEMENT};
use columnar_bridge::prelude::*;
use pretty_assertions::assert_eq;

fn numbered(n: usize) -> Dataset {
    Dataset::new().rows((0..n).map(|i| format!("row{}", i)))
}

fn connect(engine: &MemoryEngine) -> Connection {
    Connector::new(Arc::new(engine.clone()))
        .io_threads(2)
        .open("couchbases://localhost")
        .expect("open")
}

fn drain(cursor: &mut Cursor) -> Vec<String> {
    let mut rows = Vec::new();
    while let Pull::Row(row) = cursor.next_row().expect("next_row") {
        rows.push(String::from_utf8(row).unwrap());
    }
    rows
}

#[test]
fn test_rows_arrive_in_order() {
    let engine = MemoryEngine::new().dataset("SELECT n", numbered(100));
    let conn = connect(&engine);

    let mut cursor = conn.query(QueryOptions::new("SELECT n")).unwrap();
    let rows = drain(&mut cursor);
    let expected: Vec<String> = (0..100).map(|i| format!("row{}", i)).collect();
    assert_eq!(rows, expected);
    assert_eq!(cursor.rows_delivered(), 100);
    assert!(cursor.is_finished());
    assert_eq!(cursor.next_row().unwrap(), Pull::End);
}

#[test]
fn test_callback_mode_delivers_one_end() {
    let engine = MemoryEngine::new().dataset("SELECT n", numbered(5));
    let lock = GlobalLock::new();
    let conn = Connector::new(Arc::new(engine))
        .host(lock.clone())
        .open("couchbases://localhost")
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let held = lock.clone();
    let mut cursor = conn
        .query_with_rows(QueryOptions::new("SELECT n"), move |event| {
            tx.send((event.map_err(|e| e.to_string()), held.is_held()))?;
            Ok(())
        })
        .unwrap();

    let mut rows = Vec::new();
    let mut ends = 0;
    while cursor.next_row().unwrap() == Pull::Pending {
        let (event, in_lock) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(in_lock, "row callback ran without the host lock");
        match event.unwrap() {
            RowEvent::Row(row) => rows.push(row),
            RowEvent::End => ends += 1,
        }
    }

    assert_eq!(rows.len(), 5);
    assert_eq!(rows[4], b"row4".to_vec());
    assert_eq!(ends, 1);
    assert!(rx.try_recv().is_err());
    assert!(cursor.metadata().is_some());
}

#[test]
fn test_close_ends_pending_callback_pull() {
    let engine = MemoryEngine::new().dataset(
        "SELECT slow",
        numbered(3).row_delay(Duration::from_secs(10)),
    );
    let conn = connect(&engine);

    let (tx, rx) = mpsc::channel();
    let mut cursor = conn
        .query_with_rows(QueryOptions::new("SELECT slow"), move |event| {
            tx.send(event.map_err(|e| e.internal_kind()))?;
            Ok(())
        })
        .unwrap();
    assert_eq!(cursor.next_row().unwrap(), Pull::Pending);

    conn.close().unwrap();

    let event = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("row callback runs after close");
    assert_eq!(event, Err(Some(InternalKind::CompletionDropped)));
    assert!(cursor.is_finished());
    assert_eq!(cursor.next_row().unwrap(), Pull::End);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_cancel_after_k_rows() {
    let engine = MemoryEngine::new().dataset("SELECT n", numbered(10));
    let conn = connect(&engine);

    let mut cursor = conn.query(QueryOptions::new("SELECT n")).unwrap();
    for i in 0..3 {
        assert_eq!(cursor.next_row().unwrap(), Pull::Row(format!("row{}", i).into_bytes()));
    }
    cursor.cancel();

    assert_eq!(cursor.next_row().unwrap(), Pull::End);
    assert_eq!(cursor.next_row().unwrap(), Pull::End);
    assert!(cursor.is_cancelled());
    assert_eq!(cursor.rows_delivered(), 3);
    assert_eq!(engine.stats().cancels, 1);
    assert!(cursor.metadata().is_none());
}

#[test]
fn test_metadata_after_end_only() {
    let engine = MemoryEngine::new().dataset(
        "SELECT n",
        numbered(2).warning(1100, "index not used"),
    );
    let conn = connect(&engine);

    let mut cursor = conn.query(QueryOptions::new("SELECT n")).unwrap();
    assert!(cursor.metadata().is_none());
    cursor.next_row().unwrap();
    cursor.next_row().unwrap();
    assert!(cursor.metadata().is_none());
    assert_eq!(cursor.next_row().unwrap(), Pull::End);

    let meta = cursor.metadata().expect("metadata after end");
    assert!(meta.request_id.starts_with("mem-"));
    assert_eq!(meta.metrics.result_count, 2);
    assert_eq!(meta.warnings.len(), 1);
    assert_eq!(meta.warnings[0].code, 1100);
}

#[test]
fn test_cancel_from_another_thread_unblocks_pull() {
    let engine = MemoryEngine::new().dataset(
        "SELECT slow",
        numbered(3).row_delay(Duration::from_secs(10)),
    );
    let conn = connect(&engine);

    let mut cursor = conn.query(QueryOptions::new("SELECT slow")).unwrap();
    let handle = cursor.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.cancel();
    });

    assert_eq!(cursor.next_row().unwrap(), Pull::End);
    canceller.join().unwrap();
    assert_eq!(cursor.rows_delivered(), 0);
}

#[test]
fn test_engine_error_mid_stream() {
    let engine = MemoryEngine::new().dataset(
        "SELECT n",
        numbered(5).fail_at(2, EngineError::new(23007, "service overloaded")),
    );
    let conn = connect(&engine);

    let mut cursor = conn.query(QueryOptions::new("SELECT n")).unwrap();
    cursor.next_row().unwrap();
    cursor.next_row().unwrap();
    let err = cursor.next_row().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert_eq!(err.code(), Some(23007));
    assert_eq!(cursor.next_row().unwrap(), Pull::End);
}

#[test]
fn test_query_timeout() {
    let engine = MemoryEngine::new().dataset(
        "SELECT slow",
        numbered(3).row_delay(Duration::from_millis(30)),
    );
    let conn = connect(&engine);

    let mut cursor = conn
        .query(QueryOptions::new("SELECT slow").timeout(Duration::from_millis(1)))
        .unwrap();
    let err = cursor.next_row().unwrap_err();
    assert_eq!(err.code(), Some(UNAMBIGUOUS_TIMEOUT));
}

#[test]
fn test_unknown_statement() {
    let engine = MemoryEngine::new();
    let conn = connect(&engine);
    let err = conn.query(QueryOptions::new("SELECT missing")).unwrap_err();
    assert_eq!(err.code(), Some(UNKNOWN_STATEMENT));
}

#[test]
fn test_invalid_options_never_reach_engine() {
    let engine = MemoryEngine::new().dataset("SELECT n", numbered(1));
    let conn = connect(&engine);

    let err = conn.query(QueryOptions::new("  ")).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = conn
        .query(QueryOptions::new("SELECT n").positional_json("{not json"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Submission);

    let mut opts = QueryOptions::new("SELECT n");
    opts.database_name = Some("travel".into());
    assert!(conn.query(opts).is_err());

    assert_eq!(engine.stats().queries, 0);
}

#[test]
fn test_parameters_and_scope_accepted() {
    let engine = MemoryEngine::new().dataset("SELECT $1", numbered(1));
    let conn = connect(&engine);

    let opts = QueryOptions::new("SELECT $1")
        .scope("travel", "inventory")
        .positional(serde_json::json!("LAX"))
        .named("limit", serde_json::json!(10))
        .read_only(true)
        .scan_consistency(ScanConsistency::RequestPlus);
    let rows: Vec<Vec<u8>> = conn.query(opts).unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(rows, vec![b"row0".to_vec()]);
}
