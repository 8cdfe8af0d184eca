// The subscriber table and everything that touches it: subscription
// commands, historical replay, committed-message fan-out, and the
// liveness sweep. One mutex guards the whole table; replay runs under it,
// which is what makes "replay strictly precedes live dispatch for the
// same subscription" true without any further machinery.

use herald_base::{Format, Locate, Result, Site, TOPIC_ALL};
use herald_store::{Store, StoreReader, WriteGateway, SYNC_TIMEOUT};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A registration is idle after this long without any inbound byte.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Idle strikes before the sweeper drops the connection.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// How often the sweeper wakes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

// A stalled peer must surface as a send error (and eviction) rather than
// wedging fan-out under the table lock.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

struct Registration {
    stream: TcpStream,
    topics: HashSet<String>,
    last_activity: Instant,
    missed_beats: u32,
}

/// What the admin surface sees of a live registration.
#[derive(Clone, Debug, Serialize)]
pub struct SubscriberInfo {
    pub id: u64,
    pub topics: Vec<String>,
    pub idle_secs: u64,
    pub role: String,
}

pub struct Dispatcher {
    subs: Mutex<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    reader: Mutex<StoreReader>,
    gateway: Arc<WriteGateway>,
    heartbeat_timeout: Duration,
    max_missed: u32,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(store: &Store, gateway: Arc<WriteGateway>) -> Result<Dispatcher> {
        Dispatcher::with_liveness(store, gateway, HEARTBEAT_TIMEOUT, MAX_MISSED_HEARTBEATS)
    }

    pub fn with_liveness(
        store: &Store,
        gateway: Arc<WriteGateway>,
        heartbeat_timeout: Duration,
        max_missed: u32,
    ) -> Result<Dispatcher> {
        Ok(Dispatcher {
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reader: Mutex::new(store.reader()?),
            gateway,
            heartbeat_timeout,
            max_missed,
            running: AtomicBool::new(true),
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, Registration>> {
        self.subs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admit a freshly handshaken subscriber connection.
    pub fn register(&self, stream: TcpStream) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let _ = stream.set_write_timeout(Some(SEND_TIMEOUT));
        self.table().insert(
            id,
            Registration {
                stream,
                topics: HashSet::new(),
                last_activity: Instant::now(),
                missed_beats: 0,
            },
        );
        info!("subscriber {} connected", id);
        id
    }

    pub fn deregister(&self, id: u64) {
        remove(&mut self.table(), id);
    }

    /// One inbound command line. Anything received -- recognized or not --
    /// counts as liveness.
    pub fn handle_line(&self, id: u64, line: &str) {
        let mut subs = self.table();
        let Some(reg) = subs.get_mut(&id) else {
            return;
        };
        reg.last_activity = Instant::now();
        reg.missed_beats = 0;

        if line == "PING" {
            if send(&reg.stream, b"PONG\n").is_err() {
                remove(&mut subs, id);
            }
        } else if let Some(topic) = line.strip_prefix("SUBSCRIBE:") {
            let topic = topic.trim().to_owned();
            debug!("subscriber {} subscribed to '{}'", id, topic);
            reg.topics.insert(topic.clone());
            self.replay(&mut subs, id, &topic);
        } else if let Some(topic) = line.strip_prefix("UNSUBSCRIBE:") {
            let topic = topic.trim();
            debug!("subscriber {} unsubscribed from '{}'", id, topic);
            reg.topics.remove(topic);
        }
    }

    // Send the stored history for `topic` (everything, for the `all`
    // sentinel) in id-ascending order. The flush barrier first fences any
    // writes the applier has already handed to the gateway, so the scan
    // sees every entry applied before this subscribe. Holding the table
    // lock throughout keeps live dispatch strictly after replay.
    fn replay(&self, subs: &mut HashMap<u64, Registration>, id: u64, topic: &str) {
        if !self.gateway.flush(SYNC_TIMEOUT) {
            warn!("replay for subscriber {} proceeding without flush", id);
        }
        let history = {
            let reader = self.reader.lock().unwrap_or_else(|p| p.into_inner());
            reader.by_topic(topic)
        };
        let history = match history {
            Ok(history) => history,
            Err(e) => {
                warn!("history scan for '{}' failed: {}", topic, e);
                return;
            }
        };
        let Some(reg) = subs.get_mut(&id) else {
            return;
        };
        debug!(
            "replaying {} stored message(s) on '{}' to subscriber {}",
            history.len(),
            topic,
            id
        );
        for message in &history {
            if send(&reg.stream, message.wire_line().as_bytes()).is_err() {
                remove(subs, id);
                return;
            }
        }
    }

    /// Fan a committed message out to every registration whose interest
    /// set contains its topic or the `all` sentinel. Broken connections
    /// are removed on the spot.
    pub fn dispatch(&self, topic: &str, format: Format, body: &str) {
        let line = format!("FORMAT:{}|{}\n", format, body);
        let mut subs = self.table();
        let mut dead = Vec::new();
        let mut delivered = 0_usize;
        for (id, reg) in subs.iter() {
            if reg.topics.contains(topic) || reg.topics.contains(TOPIC_ALL) {
                if send(&reg.stream, line.as_bytes()).is_err() {
                    dead.push(*id);
                } else {
                    delivered += 1;
                }
            }
        }
        for id in dead {
            remove(&mut subs, id);
        }
        debug!("dispatched '{}' to {} subscriber(s)", topic, delivered);
    }

    /// One liveness pass: expired registrations collect a strike, and
    /// enough strikes close the connection.
    pub fn sweep(&self) {
        let mut subs = self.table();
        let mut dead = Vec::new();
        for (id, reg) in subs.iter_mut() {
            if reg.last_activity.elapsed() > self.heartbeat_timeout {
                reg.missed_beats += 1;
                if reg.missed_beats >= self.max_missed {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            info!("evicting subscriber {} after missed heartbeats", id);
            remove(&mut subs, id);
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let dispatcher = self.clone();
        std::thread::Builder::new()
            .name("liveness-sweeper".to_owned())
            .spawn(move || {
                while dispatcher.running.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    dispatcher.sweep();
                }
            })
            .at(Site::Net)?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.table().len()
    }

    /// Registrations with activity inside the heartbeat window.
    pub fn healthy_count(&self) -> usize {
        self.table()
            .values()
            .filter(|reg| reg.last_activity.elapsed() <= self.heartbeat_timeout)
            .count()
    }

    pub fn subscriber_info(&self) -> Vec<SubscriberInfo> {
        let subs = self.table();
        let mut out: Vec<SubscriberInfo> = subs
            .iter()
            .map(|(id, reg)| {
                let mut topics: Vec<String> = reg.topics.iter().cloned().collect();
                topics.sort();
                SubscriberInfo {
                    id: *id,
                    topics,
                    idle_secs: reg.last_activity.elapsed().as_secs(),
                    role: "subscriber".to_owned(),
                }
            })
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }
}

fn send(stream: &TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    let mut stream = stream;
    stream.write_all(bytes)
}

fn remove(subs: &mut HashMap<u64, Registration>, id: u64) {
    if let Some(reg) = subs.remove(&id) {
        let _ = reg.stream.shutdown(Shutdown::Both);
        info!("subscriber {} removed", id);
    }
}
