// Bootstrap peer discovery: probe a port range with short TCP connects
// and call whatever answers the cluster. The view is fixed for the life
// of the process; there is no dynamic membership.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::info;

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const ROUNDS: u32 = 3;
const ROUND_GAP: Duration = Duration::from_secs(1);

/// Scan `base_port .. base_port + max_nodes` on localhost. Peers that are
/// still starting up may miss the first pass, so an empty result is
/// retried up to three times with one-second gaps. The local endpoint is
/// always part of the view, and the final list is sorted so every node
/// derives the same cluster identity.
pub fn discover_cluster(base_port: u16, max_nodes: u32, self_port: u16) -> Vec<(String, u16)> {
    let mut found: Vec<(String, u16)> = Vec::new();
    for round in 1..=ROUNDS {
        found.clear();
        for n in 0..max_nodes {
            let port = base_port.saturating_add(n as u16);
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            if TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok() {
                info!("discovered peer at 127.0.0.1:{}", port);
                found.push(("127.0.0.1".to_owned(), port));
            }
        }
        if !found.is_empty() || round == ROUNDS {
            break;
        }
        info!("discovery round {}/{} found no peers, retrying", round, ROUNDS);
        std::thread::sleep(ROUND_GAP);
    }

    if !found.iter().any(|(_, port)| *port == self_port) {
        found.push(("127.0.0.1".to_owned(), self_port));
    }
    found.sort();
    found.dedup();
    info!("cluster view: {} node(s)", found.len());
    found
}
