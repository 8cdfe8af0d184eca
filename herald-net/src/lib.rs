// The broker's data plane: the TCP ingest listener and the subscriber
// dispatch engine, glued to consensus by BrokerSink -- the state machine
// every replica applies committed entries through.
//
// Ownership lines: the Dispatcher exclusively owns the subscriber
// registration table; BrokerStats owns the counters; durable writes only
// ever leave through the store's write gateway.

use chrono::{DateTime, SecondsFormat, Utc};
use herald_raft::{Command, LogEntry, StateMachine};
use herald_store::{WriteGateway, WriteOp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

mod dispatch;
mod ingest;

#[cfg(test)]
mod test;

pub use dispatch::{
    Dispatcher, SubscriberInfo, HEARTBEAT_TIMEOUT, MAX_MISSED_HEARTBEATS, SWEEP_INTERVAL,
};
pub use ingest::{Broker, Ingest, HANDSHAKE_TIMEOUT};

/// Node-local counters for the admin surface.
pub struct BrokerStats {
    started_at: DateTime<Utc>,
    started: Instant,
    total_messages: AtomicU64,
}

impl Default for BrokerStats {
    fn default() -> Self {
        BrokerStats {
            started_at: Utc::now(),
            started: Instant::now(),
            total_messages: AtomicU64::new(0),
        }
    }
}

impl BrokerStats {
    pub fn new() -> BrokerStats {
        BrokerStats::default()
    }

    pub fn bump_messages(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> String {
        self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// The replicated state machine: every committed `message` entry becomes a
/// durable row, and -- on the leader only -- a fan-out to live
/// subscribers. Runs on the consensus applier thread, so entries arrive
/// here in index order on every replica.
pub struct BrokerSink {
    gateway: Arc<WriteGateway>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<BrokerStats>,
}

impl BrokerSink {
    pub fn new(
        gateway: Arc<WriteGateway>,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<BrokerStats>,
    ) -> BrokerSink {
        BrokerSink {
            gateway,
            dispatcher,
            stats,
        }
    }
}

impl StateMachine for BrokerSink {
    fn apply(&self, entry: &LogEntry, leader: bool) {
        let Command::Message {
            topic,
            format,
            body,
            timestamp,
        } = &entry.command;
        let write = self.gateway.write_async(
            WriteOp::InsertMessage {
                topic: topic.clone(),
                format: *format,
                body: body.clone(),
                timestamp: timestamp.clone(),
            },
            None,
        );
        if let Err(e) = write {
            // Publishers are not informed of storage loss; the write
            // gateway has already logged the cause.
            warn!("dropped durable write for entry {}: {}", entry.index, e);
        }
        self.stats.bump_messages();
        if leader {
            self.dispatcher.dispatch(topic, *format, body);
        }
    }
}
