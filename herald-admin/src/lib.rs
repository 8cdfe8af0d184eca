// Read-only administrative surface plus POST /publish, serving JSON over
// plain HTTP/1.1. The broker is thread-based end to end, so rather than
// dragging in an async web stack this speaks the few lines of HTTP it
// needs directly over the listener, the same way the data port speaks its
// own line protocols. Every response closes the connection.
//
//   GET  /status       liveness, connection counts, consensus status
//   GET  /raft         consensus status alone
//   GET  /stats        message and topic counters
//   GET  /messages     the 20 most recent records
//   GET  /topics       distinct topics, sorted
//   GET  /subscribers  live registrations
//   POST /publish      validate, wrap if invalid, feed a synthetic frame
//                      through the normal publisher path

use herald_base::{parse_frame, validate_format, Format, Locate, Result, Site};
use herald_net::Broker;
use herald_store::{Store, StoreReader};
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};


const RECENT_LIMIT: u32 = 20;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AdminServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

struct Ctx {
    broker: Arc<Broker>,
    reader: Mutex<StoreReader>,
    data_port: u16,
}

impl AdminServer {
    pub fn serve(broker: Arc<Broker>, store: &Store, data_port: u16, bind: &str) -> Result<AdminServer> {
        let listener = TcpListener::bind(bind).at(Site::Admin)?;
        let addr = listener.local_addr().at(Site::Admin)?;
        let ctx = Arc::new(Ctx {
            broker,
            reader: Mutex::new(store.reader()?),
            data_port,
        });
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let acceptor = std::thread::Builder::new()
            .name("admin-http".to_owned())
            .spawn(move || accept_loop(listener, ctx, flag))
            .at(Site::Admin)?;
        info!("admin http listening on {}", addr);
        Ok(AdminServer {
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

fn accept_loop(listener: TcpListener, ctx: Arc<Ctx>, running: Arc<AtomicBool>) {
    for conn in listener.incoming() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match conn {
            Ok(stream) => {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_conn(&ctx, stream) {
                        debug!("admin request failed: {}", e);
                    }
                });
            }
            Err(e) => warn!("admin accept error: {}", e),
        }
    }
}

fn handle_conn(ctx: &Ctx, stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_owned();
    let target = parts.next().unwrap_or("/").to_owned();
    let path = target.split('?').next().unwrap_or("/").to_owned();

    let mut content_length = 0_usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let header = header.trim();
        if header.is_empty() {
            break;
        }
        if let Some(value) = header
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = value.parse().unwrap_or(0);
        }
    }

    match (method.as_str(), path.as_str()) {
        ("OPTIONS", _) => respond(&stream, 200, None),
        ("GET", path) => {
            let body = get_route(ctx, path);
            respond(&stream, 200, Some(&body))
        }
        ("POST", "/publish") => {
            let mut body = vec![0_u8; content_length];
            reader.read_exact(&mut body)?;
            match publish(ctx, &body) {
                Ok(response) => respond(&stream, 200, Some(&response)),
                Err(e) => respond(&stream, 500, Some(&json!({ "error": e.to_string() }))),
            }
        }
        ("POST", _) => respond(&stream, 404, None),
        _ => respond(&stream, 404, None),
    }
}

fn respond(stream: &TcpStream, status: u32, body: Option<&serde_json::Value>) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let body = body.map(|b| b.to_string()).unwrap_or_default();
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        status,
        reason,
        body.len()
    );
    let mut stream = stream;
    stream.write_all(head.as_bytes())?;
    stream.write_all(body.as_bytes())
}

fn get_route(ctx: &Ctx, path: &str) -> serde_json::Value {
    match path {
        "/status" => json!({
            "status": "online",
            "port": ctx.data_port,
            "subscribers": ctx.broker.dispatcher.healthy_count(),
            "current_connections": ctx.broker.dispatcher.connection_count(),
            "started_at": ctx.broker.stats.started_at(),
            "uptime_secs": ctx.broker.stats.uptime_secs(),
            "raft_status": status_value(ctx),
        }),
        "/raft" => status_value(ctx),
        "/stats" => {
            let topics_count = ctx
                .reader
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .topics()
                .map(|t| t.len())
                .unwrap_or(0);
            json!({
                "total_messages": ctx.broker.stats.total_messages(),
                "active_subscribers": ctx.broker.dispatcher.healthy_count(),
                "current_connections": ctx.broker.dispatcher.connection_count(),
                "topics_count": topics_count,
            })
        }
        "/messages" => {
            let recent = ctx
                .reader
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .recent(RECENT_LIMIT)
                .unwrap_or_default();
            let messages: Vec<serde_json::Value> = recent
                .iter()
                .map(|m| {
                    json!({
                        "topic": m.topic,
                        "format": m.format.as_str(),
                        "content": m.body,
                        "timestamp": m.timestamp,
                    })
                })
                .collect();
            json!({ "messages": messages })
        }
        "/topics" => {
            let topics = ctx
                .reader
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .topics()
                .unwrap_or_default();
            json!({ "topics": topics })
        }
        "/subscribers" => {
            let subscribers = ctx.broker.dispatcher.subscriber_info();
            json!({ "subscribers": subscribers })
        }
        _ => json!({ "error": "Not found" }),
    }
}

fn status_value(ctx: &Ctx) -> serde_json::Value {
    serde_json::to_value(ctx.broker.raft.status()).unwrap_or_else(|_| json!({}))
}

// POST /publish body: {"topic": ..., "content": ..., "format": ...}.
// Content that fails validation under the declared format is wrapped into
// a valid envelope of that format (carrying the topic) rather than
// rejected, then fed through the ordinary publisher framing path.
fn publish(ctx: &Ctx, body: &[u8]) -> Result<serde_json::Value> {
    let request: serde_json::Value = serde_json::from_slice(body).at(Site::Admin)?;
    let topic = request
        .get("topic")
        .and_then(|v| v.as_str())
        .unwrap_or(herald_base::DEFAULT_TOPIC)
        .to_owned();
    let content = request
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned();
    let format = request
        .get("format")
        .and_then(|v| v.as_str())
        .and_then(Format::parse)
        .unwrap_or(Format::Raw);

    let body = if validate_format(format, &content) {
        content
    } else {
        wrap_invalid(format, &topic, &content)
    };

    let frame = parse_frame(&format!("FORMAT:{}|{}", format, body));
    let (ok, detail) = ctx.broker.publish(frame);
    Ok(json!({ "success": ok, "detail": detail }))
}

fn wrap_invalid(format: Format, topic: &str, content: &str) -> String {
    let id = chrono::Utc::now().timestamp_millis();
    match format {
        Format::Json => json!({
            "Id": id,
            "EventName": "PublisherMessage",
            "Value": content,
            "Topic": topic,
        })
        .to_string(),
        Format::Xml => format!(
            "<Message><Id>{}</Id><EventName>PublisherMessage</EventName>\
             <Value>{}</Value><Topic>{}</Topic></Message>",
            id,
            escape_xml(content),
            escape_xml(topic)
        ),
        Format::Raw => content.to_owned(),
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
