// The data-port listener. Every accepted connection declares its role in
// its first seven bytes -- "PUBLISH" or "SUBSCRI" -- under a ten-second
// deadline, then gets its own handler thread for the rest of the session.
//
// Publishers send one `FORMAT:<FMT>|<BODY>` frame per read; the frame is
// parsed (downgrading to RAW when malformed), the topic extracted, and
// the result submitted to consensus. Publishes on a non-leader are
// rejected with a leader hint and dropped; the publisher protocol has no
// response channel, so the rejection surfaces only in the log.

use crate::dispatch::Dispatcher;
use crate::BrokerStats;
use herald_base::{
    extract_topic, now_iso8601, parse_frame, Frame, Locate, Result, Site, MAX_FRAME,
};
use herald_raft::{Command, RaftNode};
use std::io::{BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The pieces a connection handler (or the admin surface) needs to turn a
/// frame into a replicated, fanned-out message.
pub struct Broker {
    pub raft: Arc<RaftNode>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: Arc<BrokerStats>,
}

impl Broker {
    /// Submit an already-parsed frame: extract the topic and hand the
    /// command to consensus. Succeeds once the entry is in the leader's
    /// local log.
    pub fn publish(&self, frame: Frame) -> (bool, String) {
        let topic = extract_topic(frame.format, &frame.body);
        debug!("publish topic='{}' format={}", topic, frame.format);
        let command = Command::Message {
            topic,
            format: frame.format,
            body: frame.body,
            timestamp: now_iso8601(),
        };
        let (ok, reason) = self.raft.append_command(command);
        if !ok {
            warn!("publish rejected: {}", reason);
        }
        (ok, reason)
    }
}

pub struct Ingest {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl Ingest {
    pub fn serve(broker: Arc<Broker>, bind: &str) -> Result<Ingest> {
        let listener = TcpListener::bind(bind).at(Site::Net)?;
        let addr = listener.local_addr().at(Site::Net)?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let acceptor = std::thread::Builder::new()
            .name("ingest".to_owned())
            .spawn(move || accept_loop(listener, broker, flag))
            .at(Site::Net)?;
        info!("broker listening on {}", addr);
        Ok(Ingest {
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
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_millis(100));
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, broker: Arc<Broker>, running: Arc<AtomicBool>) {
    for conn in listener.incoming() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match conn {
            Ok(stream) => {
                let broker = broker.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_conn(&broker, stream) {
                        debug!("connection handler finished with error: {}", e);
                    }
                });
            }
            Err(e) => warn!("accept error: {}", e),
        }
    }
    debug!("ingest acceptor exiting");
}

fn handle_conn(broker: &Broker, stream: TcpStream) -> std::io::Result<()> {
    // Role classification reads exactly seven bytes under a deadline; the
    // deadline is lifted for the rest of the session.
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let mut role = [0_u8; 7];
    (&stream).read_exact(&mut role)?;
    stream.set_read_timeout(None)?;

    match &role {
        b"PUBLISH" => handle_publisher(broker, stream),
        b"SUBSCRI" => handle_subscriber(broker, stream),
        other => {
            debug!(
                "unknown role header {:?}, closing",
                String::from_utf8_lossy(other)
            );
            Ok(())
        }
    }
}

fn handle_publisher(broker: &Broker, stream: TcpStream) -> std::io::Result<()> {
    info!("publisher connected");
    let mut buf = [0_u8; MAX_FRAME];
    loop {
        let n = (&stream).read(&mut buf)?;
        if n == 0 {
            break;
        }
        let raw = match std::str::from_utf8(&buf[..n]) {
            Ok(raw) => raw,
            Err(_) => {
                warn!("publisher sent non-UTF-8 frame, closing");
                break;
            }
        };
        broker.publish(parse_frame(raw));
    }
    info!("publisher disconnected");
    Ok(())
}

fn handle_subscriber(broker: &Broker, stream: TcpStream) -> std::io::Result<()> {
    let id = broker.dispatcher.register(stream.try_clone()?);
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => broker.dispatcher.handle_line(id, line.trim()),
            Err(e) => {
                debug!("subscriber {} read error: {}", id, e);
                break;
            }
        }
    }
    broker.dispatcher.deregister(id);
    info!("subscriber {} disconnected", id);
    Ok(())
}
