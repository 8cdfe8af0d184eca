use crate::{Broker, BrokerSink, BrokerStats, Dispatcher, Ingest};
use herald_base::Format;
use herald_raft::RaftNode;
use herald_store::{Store, WriteGateway, WriteOp, SYNC_TIMEOUT};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_log::test;

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn insert(topic: &str, body: &str) -> WriteOp {
    WriteOp::InsertMessage {
        topic: topic.to_owned(),
        format: Format::Raw,
        body: body.to_owned(),
        timestamp: herald_base::now_iso8601(),
    }
}

struct Harness {
    store: Store,
    gateway: Arc<WriteGateway>,
    dispatcher: Arc<Dispatcher>,
    broker: Arc<Broker>,
    ingest: Ingest,
    _dir: tempfile::TempDir,
}

// A complete single-node broker on ephemeral ports: store, gateway,
// dispatcher, consensus (which a lone node wins within one election
// timeout), and the ingest listener.
fn start_broker() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = Arc::new(WriteGateway::start(&store).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(&store, gateway.clone()).unwrap());
    let stats = Arc::new(BrokerStats::new());
    let sink = Arc::new(BrokerSink::new(
        gateway.clone(),
        dispatcher.clone(),
        stats.clone(),
    ));
    let raft = RaftNode::new(
        "127.0.0.1:0".to_owned(),
        vec![("127.0.0.1".to_owned(), 0)],
        sink,
    );
    raft.run().unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || raft.is_leader()),
        "single node should elect itself"
    );
    let broker = Arc::new(Broker {
        raft,
        dispatcher: dispatcher.clone(),
        stats,
    });
    let ingest = Ingest::serve(broker.clone(), "127.0.0.1:0").unwrap();
    Harness {
        store,
        gateway,
        dispatcher,
        broker,
        ingest,
        _dir: dir,
    }
}

fn connect_subscriber(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"SUBSCRI").unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn connect_publisher(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"PUBLISH").unwrap();
    stream
}

fn read_line(reader: &mut impl BufRead) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line
}

#[test]
fn test_json_publish_reaches_live_subscriber_and_store() {
    let h = start_broker();
    let addr = h.ingest.local_addr();

    let mut sub = connect_subscriber(addr);
    sub.write_all(b"SUBSCRIBE:weather\n").unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        h.dispatcher
            .subscriber_info()
            .iter()
            .any(|info| info.topics.iter().any(|t| t == "weather"))
    }));

    let body = r#"{"Topic":"weather","Value":42}"#;
    let mut publisher = connect_publisher(addr);
    publisher
        .write_all(format!("FORMAT:JSON|{}", body).as_bytes())
        .unwrap();

    let mut reader = BufReader::new(&sub);
    assert_eq!(read_line(&mut reader), format!("FORMAT:JSON|{}\n", body));

    // The committed entry lands in the store with the extracted topic.
    assert!(h.gateway.flush(SYNC_TIMEOUT));
    let rows = h.store.reader().unwrap().by_topic("weather").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 1);
    assert_eq!(rows[0].format, Format::Json);
    assert_eq!(rows[0].body, body);
    assert_eq!(h.broker.stats.total_messages(), 1);
}

#[test]
fn test_xml_publish_without_subscribers_is_stored() {
    let h = start_broker();
    let addr = h.ingest.local_addr();

    let body = "<Message><Topic>alerts</Topic></Message>";
    let mut publisher = connect_publisher(addr);
    publisher
        .write_all(format!("FORMAT:XML|{}", body).as_bytes())
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        h.gateway.flush(SYNC_TIMEOUT);
        h.store
            .reader()
            .unwrap()
            .by_topic("alerts")
            .map(|rows| rows.len() == 1)
            .unwrap_or(false)
    }));
    let rows = h.store.reader().unwrap().by_topic("alerts").unwrap();
    assert_eq!(rows[0].format, Format::Xml);
    assert_eq!(rows[0].body, body);
}

#[test]
fn test_invalid_json_is_stored_raw_with_original_buffer() {
    let h = start_broker();
    let addr = h.ingest.local_addr();

    let raw = "FORMAT:JSON|not json";
    let mut publisher = connect_publisher(addr);
    publisher.write_all(raw.as_bytes()).unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        h.gateway.flush(SYNC_TIMEOUT);
        h.store
            .reader()
            .unwrap()
            .by_topic("default")
            .map(|rows| rows.len() == 1)
            .unwrap_or(false)
    }));
    let rows = h.store.reader().unwrap().by_topic("default").unwrap();
    assert_eq!(rows[0].format, Format::Raw);
    assert_eq!(rows[0].body, raw);
}

#[test]
fn test_historical_replay_precedes_live_messages() {
    let h = start_broker();
    let addr = h.ingest.local_addr();

    // Two messages are already on disk before the subscriber appears.
    let (ok, _) = h.gateway.write_sync(insert("t", "a"), SYNC_TIMEOUT);
    assert!(ok);
    let (ok, _) = h.gateway.write_sync(insert("t", "b"), SYNC_TIMEOUT);
    assert!(ok);

    let mut sub = connect_subscriber(addr);
    sub.write_all(b"SUBSCRIBE:t\n").unwrap();

    let mut reader = BufReader::new(&sub);
    assert_eq!(read_line(&mut reader), "FORMAT:RAW|a\n");
    assert_eq!(read_line(&mut reader), "FORMAT:RAW|b\n");

    // A live publish arrives strictly after the replayed history.
    let mut publisher = connect_publisher(addr);
    publisher
        .write_all(br#"FORMAT:JSON|{"Topic":"t","Value":1}"#)
        .unwrap();
    assert_eq!(
        read_line(&mut reader),
        "FORMAT:JSON|{\"Topic\":\"t\",\"Value\":1}\n"
    );
}

#[test]
fn test_replay_all_sentinel_gets_everything() {
    let h = start_broker();
    let addr = h.ingest.local_addr();

    h.gateway.write_sync(insert("t1", "a"), SYNC_TIMEOUT);
    h.gateway.write_sync(insert("t2", "b"), SYNC_TIMEOUT);

    let mut sub = connect_subscriber(addr);
    sub.write_all(b"SUBSCRIBE:all\n").unwrap();
    let mut reader = BufReader::new(&sub);
    assert_eq!(read_line(&mut reader), "FORMAT:RAW|a\n");
    assert_eq!(read_line(&mut reader), "FORMAT:RAW|b\n");
}

#[test]
fn test_unknown_role_header_closes_connection() {
    let h = start_broker();
    let addr = h.ingest.local_addr();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"NONSENS").unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0_u8; 1];
    // Server closes without a response.
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_ping_pong_and_unsubscribe() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = Arc::new(WriteGateway::start(&store).unwrap());
    let dispatcher = Dispatcher::new(&store, gateway.clone()).unwrap();

    let (client, server) = socket_pair();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let id = dispatcher.register(server);

    dispatcher.handle_line(id, "PING");
    let mut reader = BufReader::new(&client);
    assert_eq!(read_line(&mut reader), "PONG\n");

    dispatcher.handle_line(id, "SUBSCRIBE:t");
    dispatcher.dispatch("t", Format::Raw, "x");
    assert_eq!(read_line(&mut reader), "FORMAT:RAW|x\n");

    // After unsubscribing, the same observable state as never having
    // subscribed: nothing is delivered.
    dispatcher.handle_line(id, "UNSUBSCRIBE:t");
    dispatcher.dispatch("t", Format::Raw, "y");
    let mut buf = [0_u8; 1];
    let outcome = (&client).read(&mut buf);
    assert!(matches!(outcome, Err(ref e)
        if e.kind() == std::io::ErrorKind::WouldBlock
        || e.kind() == std::io::ErrorKind::TimedOut));
    gateway.shutdown();
}

#[test]
fn test_topic_matching_and_all_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = Arc::new(WriteGateway::start(&store).unwrap());
    let dispatcher = Dispatcher::new(&store, gateway.clone()).unwrap();

    let (t_client, t_server) = socket_pair();
    let (all_client, all_server) = socket_pair();
    let (other_client, other_server) = socket_pair();
    for c in [&t_client, &all_client, &other_client] {
        c.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    }
    let t_id = dispatcher.register(t_server);
    let all_id = dispatcher.register(all_server);
    let other_id = dispatcher.register(other_server);
    dispatcher.handle_line(t_id, "SUBSCRIBE:t");
    dispatcher.handle_line(all_id, "SUBSCRIBE:all");
    dispatcher.handle_line(other_id, "SUBSCRIBE:elsewhere");

    dispatcher.dispatch("t", Format::Raw, "m");

    let mut t_reader = BufReader::new(&t_client);
    let mut all_reader = BufReader::new(&all_client);
    assert_eq!(read_line(&mut t_reader), "FORMAT:RAW|m\n");
    assert_eq!(read_line(&mut all_reader), "FORMAT:RAW|m\n");
    let mut buf = [0_u8; 1];
    assert!((&other_client).read(&mut buf).is_err());
    gateway.shutdown();
}

#[test]
fn test_broken_subscriber_is_evicted_on_send_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = Arc::new(WriteGateway::start(&store).unwrap());
    let dispatcher = Dispatcher::new(&store, gateway.clone()).unwrap();

    let (client, server) = socket_pair();
    let id = dispatcher.register(server);
    dispatcher.handle_line(id, "SUBSCRIBE:all");
    assert_eq!(dispatcher.connection_count(), 1);

    drop(client);
    // The first send after the close may still land in the kernel
    // buffer; keep dispatching until the broken pipe surfaces.
    assert!(wait_until(Duration::from_secs(5), || {
        dispatcher.dispatch("t", Format::Raw, "m");
        dispatcher.connection_count() == 0
    }));
    gateway.shutdown();
}

#[test]
fn test_liveness_sweep_evicts_silent_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = Arc::new(WriteGateway::start(&store).unwrap());
    let dispatcher = Dispatcher::with_liveness(
        &store,
        gateway.clone(),
        Duration::from_millis(50),
        2,
    )
    .unwrap();

    let (client, server) = socket_pair();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let id = dispatcher.register(server);
    dispatcher.handle_line(id, "SUBSCRIBE:all");

    // First strike, second strike, gone.
    std::thread::sleep(Duration::from_millis(80));
    dispatcher.sweep();
    assert_eq!(dispatcher.connection_count(), 1);
    std::thread::sleep(Duration::from_millis(80));
    dispatcher.sweep();
    assert_eq!(dispatcher.connection_count(), 0);

    // The socket was closed; the client observes EOF.
    let mut buf = [0_u8; 1];
    assert_eq!((&client).read(&mut buf).unwrap(), 0);

    // Activity resets the strike counter.
    let (client2, server2) = socket_pair();
    let id2 = dispatcher.register(server2);
    std::thread::sleep(Duration::from_millis(80));
    dispatcher.sweep();
    dispatcher.handle_line(id2, "PING");
    std::thread::sleep(Duration::from_millis(80));
    dispatcher.sweep();
    assert_eq!(dispatcher.connection_count(), 1);
    drop(client2);
    gateway.shutdown();
}

#[test]
fn test_subscriber_info_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("messages.db")).unwrap();
    let gateway = Arc::new(WriteGateway::start(&store).unwrap());
    let dispatcher = Dispatcher::new(&store, gateway.clone()).unwrap();

    let (_client, server) = socket_pair();
    let id = dispatcher.register(server);
    dispatcher.handle_line(id, "SUBSCRIBE:b");
    dispatcher.handle_line(id, "SUBSCRIBE:a");

    let info = dispatcher.subscriber_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].id, id);
    assert_eq!(info[0].topics, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(info[0].role, "subscriber");
    assert_eq!(dispatcher.healthy_count(), 1);
    gateway.shutdown();
}
