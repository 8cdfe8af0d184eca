// The consensus state machine. One RaftNode per process, shared behind an
// Arc; all mutable state lives in a single Mutex<RaftState> so that every
// reader snapshots a consistent view and no worker depends on scheduling
// order.
//
// Long-lived workers (spawned by `run`):
//
//   election timer -- polls every 10ms; no valid leader contact within the
//                     randomized 2-4s timeout turns a non-leader into a
//                     candidate.
//   applier        -- whenever last_applied < commit_index, applies the gap
//                     to the StateMachine in index order, exactly once.
//
// Leadership additionally spawns a heartbeat emitter pinned to the term it
// was elected in; it exits as soon as role or term move on. Every
// AppendEntries fan-out and vote solicitation runs on its own short-lived
// thread so one slow peer never delays the others.

use crate::log::{Command, Log, LogEntry};
use crate::rpc::{
    self, AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};
use herald_base::{Locate, Result, Site, RPC_PORT_OFFSET};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

// The timer wakes often; candidacy is decided by the sampled timeout, not
// by this granularity.
const TIMER_TICK: Duration = Duration::from_millis(10);

// How long a candidate waits for vote responses before conceding the
// round. Five heartbeat intervals: comfortably more than one RPC
// round-trip, comfortably less than the minimum election timeout.
const VOTE_COLLECT_WINDOW: Duration = Duration::from_millis(500);

fn sample_election_timeout() -> Duration {
    // Strictly wider than a heartbeat round-trip, randomized so two
    // candidates rarely collide twice.
    Duration::from_secs_f64(rand::thread_rng().gen_range(2.0..4.0))
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Where committed entries go. Called on every replica, in strictly
/// increasing index order, exactly once per index; `leader` reports this
/// node's role at apply time so the implementation can restrict fan-out
/// to the leader.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, entry: &LogEntry, leader: bool);
}

struct RaftState {
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    log: Log,
    commit_index: i64,
    last_applied: i64,
    // Leader-only bookkeeping, reinitialized on every election win.
    next_index: HashMap<String, i64>,
    match_index: HashMap<String, i64>,
    last_contact: Instant,
    election_timeout: Duration,
    leader_hint: Option<String>,
}

/// Snapshot for the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct RaftStatus {
    pub node_id: String,
    pub state: Role,
    pub current_term: u64,
    pub log_length: i64,
    pub commit_index: i64,
    pub last_applied: i64,
    pub cluster_size: usize,
}

pub struct RaftNode {
    node_id: String,
    cluster: Vec<(String, u16)>,
    peers: Vec<(String, u16)>,
    state: Mutex<RaftState>,
    commit_signal: Condvar,
    sink: Arc<dyn StateMachine>,
    running: AtomicBool,
}

fn peer_id(peer: &(String, u16)) -> String {
    format!("{}:{}", peer.0, peer.1)
}

fn rpc_addr(peer: &(String, u16)) -> SocketAddr {
    let ip = peer
        .0
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, peer.1 + RPC_PORT_OFFSET)
}

impl RaftNode {
    /// `cluster` is the full, fixed cluster view (self included) as
    /// produced by discovery; `node_id` is this node's "host:port" entry
    /// in it.
    pub fn new(
        node_id: String,
        cluster: Vec<(String, u16)>,
        sink: Arc<dyn StateMachine>,
    ) -> Arc<RaftNode> {
        let peers = cluster
            .iter()
            .filter(|p| peer_id(p) != node_id)
            .cloned()
            .collect();
        Arc::new(RaftNode {
            node_id,
            cluster,
            peers,
            state: Mutex::new(RaftState {
                role: Role::Follower,
                current_term: 0,
                voted_for: None,
                log: Log::new(),
                commit_index: -1,
                last_applied: -1,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                last_contact: Instant::now(),
                election_timeout: sample_election_timeout(),
                leader_hint: None,
            }),
            commit_signal: Condvar::new(),
            sink,
            running: AtomicBool::new(true),
        })
    }

    /// Start the election timer and the applier.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let node = self.clone();
        std::thread::Builder::new()
            .name("raft-election".to_owned())
            .spawn(move || node.election_timer())
            .at(Site::Consensus)?;
        let node = self.clone();
        std::thread::Builder::new()
            .name("raft-applier".to_owned())
            .spawn(move || node.applier())
            .at(Site::Consensus)?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.commit_signal.notify_all();
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn majority(&self) -> usize {
        self.cluster.len() / 2 + 1
    }

    // A poisoned lock means some worker panicked mid-update; the state is
    // still the best information we have, so recover it rather than
    // cascading the panic through every thread.
    fn state(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_leader(&self) -> bool {
        self.state().role == Role::Leader
    }

    pub fn leader_hint(&self) -> Option<String> {
        self.state().leader_hint.clone()
    }

    pub fn commit_index(&self) -> i64 {
        self.state().commit_index
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.state();
        RaftStatus {
            node_id: self.node_id.clone(),
            state: st.role,
            current_term: st.current_term,
            log_length: st.log.len(),
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            cluster_size: self.cluster.len(),
        }
    }

    /// Leader-only client append. Acknowledges as soon as the entry is in
    /// the local log; commit follows replication. Non-leaders reject with
    /// a hint naming the last-known leader.
    pub fn append_command(self: &Arc<Self>, command: Command) -> (bool, String) {
        let term = {
            let mut st = self.state();
            if st.role != Role::Leader {
                let hint = st
                    .leader_hint
                    .clone()
                    .unwrap_or_else(|| "unknown".to_owned());
                return (false, format!("not leader; current leader hint: {}", hint));
            }
            let entry = LogEntry {
                term: st.current_term,
                index: st.log.len(),
                command,
                timestamp: unix_now(),
            };
            debug!("appending entry {} to local log", entry.index);
            st.log.append(entry);
            // A single-node cluster commits right here; anyone else
            // commits when a majority acknowledges.
            self.advance_commit(&mut st);
            st.current_term
        };
        self.replicate_round(term);
        (true, "entry appended".to_owned())
    }

    // ---- workers ----

    fn election_timer(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(TIMER_TICK);
            let due = {
                let st = self.state();
                st.role != Role::Leader && st.last_contact.elapsed() > st.election_timeout
            };
            if due {
                self.start_election();
            }
        }
        debug!("election timer exiting");
    }

    fn start_election(self: &Arc<Self>) {
        let request = {
            let mut st = self.state();
            st.role = Role::Candidate;
            st.current_term += 1;
            st.voted_for = Some(self.node_id.clone());
            st.last_contact = Instant::now();
            st.election_timeout = sample_election_timeout();
            info!("starting election for term {}", st.current_term);
            let (last_log_index, last_log_term) = st.log.last();
            VoteRequest {
                term: st.current_term,
                candidate_id: self.node_id.clone(),
                last_log_index,
                last_log_term,
            }
        };
        let term = request.term;

        let (votes_tx, votes_rx) = mpsc::channel();
        for peer in &self.peers {
            let votes_tx = votes_tx.clone();
            let addr = rpc_addr(peer);
            let request = request.clone();
            std::thread::spawn(move || {
                let _ = votes_tx.send(rpc::request_vote(addr, &request));
            });
        }
        drop(votes_tx);

        let mut votes = 1; // our own
        let majority = self.majority();
        let deadline = Instant::now() + VOTE_COLLECT_WINDOW;
        while votes < majority {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match votes_rx.recv_timeout(deadline - now) {
                Ok(Some(resp)) if resp.term > term => {
                    self.observe_term(resp.term);
                    return;
                }
                Ok(Some(resp)) => {
                    if resp.vote_granted && resp.term == term {
                        votes += 1;
                    }
                }
                Ok(None) => {} // no answer; not a vote against
                Err(_) => break, // every peer answered or window closed
            }
        }

        let mut st = self.state();
        if st.role == Role::Candidate && st.current_term == term && votes >= majority {
            self.become_leader(&mut st);
        } else if st.role == Role::Candidate && st.current_term == term {
            debug!(
                "election for term {} got {}/{} votes, standing down",
                term, votes, majority
            );
            st.role = Role::Follower;
        }
    }

    fn observe_term(&self, term: u64) {
        let mut st = self.state();
        if term > st.current_term {
            debug!(
                "observed term {} above our {}, becoming follower",
                term, st.current_term
            );
            st.current_term = term;
            st.voted_for = None;
            st.role = Role::Follower;
        }
    }

    fn become_leader(self: &Arc<Self>, st: &mut RaftState) {
        info!("became leader for term {}", st.current_term);
        st.role = Role::Leader;
        st.leader_hint = Some(self.node_id.clone());
        st.next_index.clear();
        st.match_index.clear();
        let next = st.log.len();
        for peer in &self.peers {
            let id = peer_id(peer);
            st.next_index.insert(id.clone(), next);
            st.match_index.insert(id, -1);
        }
        let term = st.current_term;
        let node = self.clone();
        let spawned = std::thread::Builder::new()
            .name("raft-heartbeat".to_owned())
            .spawn(move || node.heartbeat_loop(term));
        if let Err(e) = spawned {
            warn!("could not spawn heartbeat emitter: {}", e);
            st.role = Role::Follower;
        }
    }

    fn heartbeat_loop(self: Arc<Self>, term: u64) {
        while self.running.load(Ordering::SeqCst) {
            {
                let st = self.state();
                if st.role != Role::Leader || st.current_term != term {
                    break;
                }
            }
            self.replicate_round(term);
            std::thread::sleep(HEARTBEAT_INTERVAL);
        }
        debug!("heartbeat emitter for term {} exiting", term);
    }

    /// One AppendEntries to every peer, each on its own thread.
    fn replicate_round(self: &Arc<Self>, term: u64) {
        for peer in self.peers.clone() {
            let node = self.clone();
            std::thread::spawn(move || node.replicate_peer(&peer, term));
        }
    }

    fn replicate_peer(&self, peer: &(String, u16), term: u64) {
        let id = peer_id(peer);
        let request = {
            let st = self.state();
            if st.role != Role::Leader || st.current_term != term {
                return;
            }
            let next = st.next_index.get(&id).copied().unwrap_or(st.log.len());
            let prev_log_index = next - 1;
            let prev_log_term = if prev_log_index >= 0 {
                st.log.term_at(prev_log_index).unwrap_or(0)
            } else {
                0
            };
            AppendEntriesRequest {
                term,
                leader_id: self.node_id.clone(),
                prev_log_index,
                prev_log_term,
                entries: st.log.tail(next),
                leader_commit: st.commit_index,
            }
        };
        let prev_index = request.prev_log_index;
        let sent = request.entries.len() as i64;
        if let Some(resp) = rpc::append_entries(rpc_addr(peer), &request) {
            self.handle_append_response(&id, term, prev_index, sent, &resp);
        }
    }

    pub(crate) fn handle_append_response(
        &self,
        peer: &str,
        term: u64,
        prev_index: i64,
        sent: i64,
        resp: &AppendEntriesResponse,
    ) {
        let mut st = self.state();
        if resp.term > st.current_term {
            debug!(
                "peer {} answered with term {} above our {}, stepping down",
                peer, resp.term, st.current_term
            );
            st.current_term = resp.term;
            st.voted_for = None;
            st.role = Role::Follower;
            return;
        }
        if st.role != Role::Leader || st.current_term != term || resp.term != term {
            return;
        }
        if resp.success {
            let matched = prev_index + sent;
            let entry = st.match_index.entry(peer.to_owned()).or_insert(-1);
            if matched > *entry {
                *entry = matched;
            }
            st.next_index.insert(peer.to_owned(), matched + 1);
            self.advance_commit(&mut st);
        } else {
            // Consistency check failed; walk back one entry and let the
            // next tick retry.
            let next = st.next_index.entry(peer.to_owned()).or_insert(0);
            *next = (*next - 1).max(0);
        }
    }

    /// Raise commit_index to the highest N above it that a majority
    /// (counting ourselves) has matched, provided log[N] is from the
    /// current term.
    fn advance_commit(&self, st: &mut RaftState) {
        if st.role != Role::Leader {
            return;
        }
        let (last, _) = st.log.last();
        let majority = self.majority();
        let mut n = last;
        while n > st.commit_index {
            if st.log.term_at(n) == Some(st.current_term) {
                let replicas = 1 + st.match_index.values().filter(|&&m| m >= n).count();
                if replicas >= majority {
                    debug!("commit index advanced to {}", n);
                    st.commit_index = n;
                    self.commit_signal.notify_all();
                    break;
                }
            }
            n -= 1;
        }
    }

    // ---- inbound RPC ----

    pub fn handle_vote_request(&self, req: &VoteRequest) -> VoteResponse {
        let mut st = self.state();
        if req.term > st.current_term {
            st.current_term = req.term;
            st.voted_for = None;
            st.role = Role::Follower;
        }
        let mut granted = false;
        if req.term == st.current_term
            && st
                .voted_for
                .as_deref()
                .map_or(true, |v| v == req.candidate_id)
        {
            let (our_index, our_term) = st.log.last();
            let up_to_date = req.last_log_term > our_term
                || (req.last_log_term == our_term && req.last_log_index >= our_index);
            if up_to_date {
                granted = true;
                st.voted_for = Some(req.candidate_id.clone());
                st.last_contact = Instant::now();
            }
        }
        debug!(
            "vote request from {} for term {}: granted={}",
            req.candidate_id, req.term, granted
        );
        VoteResponse {
            term: st.current_term,
            vote_granted: granted,
        }
    }

    pub fn handle_append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        let mut st = self.state();
        if req.term < st.current_term {
            return AppendEntriesResponse {
                term: st.current_term,
                success: false,
            };
        }
        if req.term > st.current_term {
            st.current_term = req.term;
            st.voted_for = None;
        }
        st.role = Role::Follower;
        st.last_contact = Instant::now();
        st.leader_hint = Some(req.leader_id.clone());

        let consistent = req.prev_log_index == -1
            || st.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
        if !consistent {
            return AppendEntriesResponse {
                term: st.current_term,
                success: false,
            };
        }

        if !req.entries.is_empty() {
            // Anything after the agreed prefix is a conflicting
            // uncommitted tail; replace it with the leader's entries.
            st.log.truncate_after(req.prev_log_index);
            for entry in &req.entries {
                st.log.append(entry.clone());
            }
        }

        let (last, _) = st.log.last();
        let new_commit = req.leader_commit.min(last);
        if new_commit > st.commit_index {
            st.commit_index = new_commit;
            self.commit_signal.notify_all();
        }
        AppendEntriesResponse {
            term: st.current_term,
            success: true,
        }
    }

    // ---- applier ----

    fn applier(self: Arc<Self>) {
        loop {
            let (entries, leader) = {
                let mut st = self.state();
                while st.last_applied >= st.commit_index && self.running.load(Ordering::SeqCst)
                {
                    let waited = self
                        .commit_signal
                        .wait_timeout(st, HEARTBEAT_INTERVAL)
                        .unwrap_or_else(|p| p.into_inner());
                    st = waited.0;
                }
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                let from = st.last_applied + 1;
                let to = st.commit_index;
                let entries: Vec<LogEntry> =
                    (from..=to).filter_map(|i| st.log.get(i).cloned()).collect();
                // Advance before applying: the applier is the only writer
                // of last_applied and an index must never be applied twice.
                st.last_applied = to;
                (entries, st.role == Role::Leader)
            };
            for entry in &entries {
                self.sink.apply(entry, leader);
            }
        }
        debug!("applier exiting");
    }
}
