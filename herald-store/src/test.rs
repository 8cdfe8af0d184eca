use crate::{Store, WriteGateway, WriteOp, SYNC_TIMEOUT};
use herald_base::Format;
use std::sync::mpsc;
use test_log::test;

fn insert(topic: &str, body: &str) -> WriteOp {
    WriteOp::InsertMessage {
        topic: topic.to_owned(),
        format: Format::Raw,
        body: body.to_owned(),
        timestamp: herald_base::now_iso8601(),
    }
}

#[test]
fn test_append_and_scan() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = WriteGateway::start(&store).unwrap();

    let (ok, id) = gateway.write_sync(insert("t", "a"), SYNC_TIMEOUT);
    assert!(ok);
    assert_eq!(id, Some(1));
    let (ok, id) = gateway.write_sync(insert("t", "b"), SYNC_TIMEOUT);
    assert!(ok);
    assert_eq!(id, Some(2));
    let (ok, id) = gateway.write_sync(insert("other", "c"), SYNC_TIMEOUT);
    assert!(ok);
    assert_eq!(id, Some(3));

    let reader = store.reader().unwrap();
    assert_eq!(reader.count().unwrap(), 3);

    // recent is newest-first.
    let recent = reader.recent(2).unwrap();
    assert_eq!(
        recent.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![3, 2]
    );

    // by_topic is id-ascending and filtered.
    let t = reader.by_topic("t").unwrap();
    assert_eq!(
        t.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );

    // The `all` sentinel disables the filter.
    let all = reader.by_topic("all").unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].id, 1);

    assert_eq!(reader.topics().unwrap(), vec!["other", "t"]);
    gateway.shutdown();
}

#[test]
fn test_async_write_and_flush() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = WriteGateway::start(&store).unwrap();

    let (tx, rx) = mpsc::channel();
    gateway
        .write_async(
            insert("t", "x"),
            Some(Box::new(move |ok, id| {
                let _ = tx.send((ok, id));
            })),
        )
        .unwrap();
    let (ok, id) = rx.recv_timeout(SYNC_TIMEOUT).unwrap();
    assert!(ok);
    assert_eq!(id, Some(1));

    // A flush fences every previously enqueued write.
    for i in 0..10 {
        gateway
            .write_async(insert("t", &format!("m{}", i)), None)
            .unwrap();
    }
    assert!(gateway.flush(SYNC_TIMEOUT));
    assert_eq!(store.reader().unwrap().count().unwrap(), 11);
    gateway.shutdown();
}

#[test]
fn test_write_error_reported_and_worker_survives() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = WriteGateway::start(&store).unwrap();

    // Sabotage the schema behind the worker's back so the next insert
    // fails.
    let saboteur = rusqlite::Connection::open(store.path()).unwrap();
    saboteur
        .execute("ALTER TABLE queue RENAME TO queue_gone", [])
        .unwrap();

    let (ok, id) = gateway.write_sync(insert("t", "a"), SYNC_TIMEOUT);
    assert!(!ok);
    assert_eq!(id, None);

    // The worker keeps processing after a failed write.
    saboteur
        .execute("ALTER TABLE queue_gone RENAME TO queue", [])
        .unwrap();
    drop(saboteur);
    let (ok, id) = gateway.write_sync(insert("t", "b"), SYNC_TIMEOUT);
    assert!(ok);
    assert_eq!(id, Some(1));
    gateway.shutdown();
}

#[test]
fn test_shutdown_rejects_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = WriteGateway::start(&store).unwrap();
    gateway.shutdown();

    assert!(gateway.write_async(insert("t", "late"), None).is_err());
    let (ok, id) = gateway.write_sync(insert("t", "late"), SYNC_TIMEOUT);
    assert!(!ok);
    assert_eq!(id, None);
}

#[test]
fn test_reopen_preserves_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages.db");
    {
        let store = Store::open(&path).unwrap();
        let gateway = WriteGateway::start(&store).unwrap();
        let (ok, _) = gateway.write_sync(insert("t", "persisted"), SYNC_TIMEOUT);
        assert!(ok);
        gateway.shutdown();
    }
    let store = Store::open(&path).unwrap();
    let rows = store.reader().unwrap().by_topic("t").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].body, "persisted");
    assert_eq!(rows[0].format, Format::Raw);
}
