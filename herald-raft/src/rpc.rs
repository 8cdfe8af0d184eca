// Peer RPC: one request per connection, a single JSON object terminated
// by a newline in each direction. Callers treat a timeout, a refused
// connection or a malformed response identically -- as "no answer" -- and
// simply retry on their next tick, so every failure path here collapses
// to None after a debug-level log line.

use crate::log::LogEntry;
use crate::node::RaftNode;
use herald_base::{Locate, Result, Site};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-call budget: connect, write and read each get this long.
pub const RPC_TIMEOUT: Duration = Duration::from_millis(100);

// Inbound connections get a looser read deadline; a peer that connected
// but never sends must not pin a handler thread forever.
const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: i64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: i64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

/// The request envelope: `{"method": ..., "request": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "request", rename_all = "snake_case")]
pub enum Request {
    VoteRequest(VoteRequest),
    AppendEntries(AppendEntriesRequest),
}

pub fn request_vote(addr: SocketAddr, req: &VoteRequest) -> Option<VoteResponse> {
    round_trip(addr, &Request::VoteRequest(req.clone()))
}

pub fn append_entries(
    addr: SocketAddr,
    req: &AppendEntriesRequest,
) -> Option<AppendEntriesResponse> {
    round_trip(addr, &Request::AppendEntries(req.clone()))
}

fn round_trip<R: DeserializeOwned>(addr: SocketAddr, req: &Request) -> Option<R> {
    match try_round_trip(addr, req) {
        Ok(resp) => Some(resp),
        Err(e) => {
            debug!("rpc to {} got no answer: {}", addr, e);
            None
        }
    }
}

// io::Result internally: these failures are routine cluster weather and
// must not pass through the error type that logs at error level.
fn try_round_trip<R: DeserializeOwned>(addr: SocketAddr, req: &Request) -> io::Result<R> {
    let stream = TcpStream::connect_timeout(&addr, RPC_TIMEOUT)?;
    stream.set_read_timeout(Some(RPC_TIMEOUT))?;
    stream.set_write_timeout(Some(RPC_TIMEOUT))?;
    let mut line = serde_json::to_string(req).map_err(invalid_data)?;
    line.push('\n');
    (&stream).write_all(line.as_bytes())?;

    let mut reader = BufReader::new(&stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;
    serde_json::from_str(response.trim()).map_err(invalid_data)
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// The accept loop serving this node's consensus endpoint, one handler
/// thread per inbound connection.
pub struct RpcServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl RpcServer {
    pub fn serve(node: Arc<RaftNode>, bind: SocketAddr) -> Result<RpcServer> {
        let listener = TcpListener::bind(bind).at(Site::Consensus)?;
        let addr = listener.local_addr().at(Site::Consensus)?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let acceptor = std::thread::Builder::new()
            .name("raft-rpc".to_owned())
            .spawn(move || accept_loop(listener, node, flag))
            .at(Site::Consensus)?;
        debug!("raft rpc listening on {}", addr);
        Ok(RpcServer {
            addr,
            running,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Unblock the acceptor with one last connection.
        let _ = TcpStream::connect_timeout(&self.addr, RPC_TIMEOUT);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, node: Arc<RaftNode>, running: Arc<AtomicBool>) {
    for conn in listener.incoming() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match conn {
            Ok(stream) => {
                let node = node.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_conn(stream, &node) {
                        debug!("rpc handler error: {}", e);
                    }
                });
            }
            Err(e) => warn!("rpc accept error: {}", e),
        }
    }
}

fn handle_conn(stream: TcpStream, node: &RaftNode) -> io::Result<()> {
    stream.set_read_timeout(Some(SERVER_READ_TIMEOUT))?;
    let mut reader = BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let body = match serde_json::from_str::<Request>(line.trim()) {
        Ok(Request::VoteRequest(req)) => {
            serde_json::to_string(&node.handle_vote_request(&req)).map_err(invalid_data)?
        }
        Ok(Request::AppendEntries(req)) => {
            serde_json::to_string(&node.handle_append_entries(&req)).map_err(invalid_data)?
        }
        Err(e) => serde_json::to_string(&serde_json::json!({ "error": e.to_string() }))
            .map_err(invalid_data)?,
    };
    let mut stream = stream;
    stream.write_all(body.as_bytes())?;
    stream.write_all(b"\n")?;
    Ok(())
}
