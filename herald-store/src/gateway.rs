// All writes to the store flow through one worker thread that owns the
// sole write connection, fed by a bounded job queue. Submitters never
// touch the database; they enqueue an operation and, optionally, a
// completion callback that is invoked exactly once with
// (success, assigned-row-id).
//
// A write error is reported through the callback and the worker moves on
// to the next job; the queue is only ever stopped by the poison sentinel.

use crate::Store;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use herald_base::{err, Format, Locate, Result, Site};
use rusqlite::{params, Connection};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

/// Default timeout for `write_sync`. The write may still complete after a
/// timeout; the caller just stops waiting for it.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

const QUEUE_DEPTH: usize = 1024;

pub enum WriteOp {
    InsertMessage {
        topic: String,
        format: Format,
        body: String,
        timestamp: String,
    },
    /// No-op marker: completes once every job enqueued before it has
    /// executed. Used to fence reads against pending writes.
    Flush,
}

pub type WriteCallback = Box<dyn FnOnce(bool, Option<i64>) + Send + 'static>;

enum Job {
    Write {
        op: WriteOp,
        callback: Option<WriteCallback>,
    },
    Poison,
}

pub struct WriteGateway {
    jobs: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteGateway {
    /// Claim the store's write connection and start the worker.
    pub fn start(store: &Store) -> Result<WriteGateway> {
        let conn = store.writer()?;
        let (jobs, queue) = bounded(QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("store-writer".to_owned())
            .spawn(move || worker_loop(conn, queue))
            .at(Site::Store)?;
        Ok(WriteGateway {
            jobs,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a write and return immediately. When the queue is full this
    /// blocks the submitter (backpressure); after `shutdown` it fails.
    pub fn write_async(&self, op: WriteOp, callback: Option<WriteCallback>) -> Result<()> {
        self.jobs
            .send(Job::Write { op, callback })
            .map_err(|_| err(Site::Store, "write queue closed"))
    }

    /// Enqueue a write and block until it completes or `timeout` passes.
    /// On timeout returns `(false, None)`; the write itself may still land.
    pub fn write_sync(&self, op: WriteOp, timeout: Duration) -> (bool, Option<i64>) {
        let (done, wait) = bounded(1);
        let callback: WriteCallback = Box::new(move |ok, id| {
            let _ = done.send((ok, id));
        });
        if self.write_async(op, Some(callback)).is_err() {
            return (false, None);
        }
        match wait.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => (false, None),
        }
    }

    /// Wait until every write enqueued before this call has executed.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.write_sync(WriteOp::Flush, timeout).0
    }

    /// Poison the queue and join the worker. Jobs already enqueued are
    /// drained first; submissions made after this fail.
    pub fn shutdown(&self) {
        let _ = self.jobs.send(Job::Poison);
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(conn: Connection, queue: Receiver<Job>) {
    while let Ok(job) = queue.recv() {
        match job {
            Job::Poison => break,
            Job::Write { op, callback } => {
                let outcome = execute(&conn, &op);
                let (ok, id) = match outcome {
                    Ok(id) => (true, id),
                    Err(e) => {
                        error!("store write failed: {}", e);
                        (false, None)
                    }
                };
                if let Some(callback) = callback {
                    callback(ok, id);
                }
            }
        }
    }
    debug!("store writer exiting");
}

fn execute(conn: &Connection, op: &WriteOp) -> Result<Option<i64>> {
    match op {
        WriteOp::InsertMessage {
            topic,
            format,
            body,
            timestamp,
        } => {
            conn.execute(
                "INSERT INTO queue (topic, format, body, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![topic, format.as_str(), body, timestamp],
            )
            .at(Site::Store)?;
            Ok(Some(conn.last_insert_rowid()))
        }
        WriteOp::Flush => Ok(None),
    }
}
