use std::env;
use std::path::PathBuf;
use tracing::warn;

/// The broker's data port range starts here; node N listens on
/// `BASE_PORT + N` by convention, which is what discovery scans.
pub const BASE_PORT: u16 = 5000;

/// The consensus RPC endpoint lives at a fixed offset above the data port.
pub const RPC_PORT_OFFSET: u16 = 1000;

// All configuration comes from the environment; the broker takes no CLI
// flags. Unset variables fall back to defaults, unparseable values fall
// back with a warning rather than killing the process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub node_id: u32,
    pub port: u16,
    pub http_port: u16,
    pub max_cluster_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: 0,
            port: BASE_PORT,
            http_port: 8080,
            max_cluster_size: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let default = Config::default();
        Config {
            node_id: env_parse("BROKER_NODE_ID", default.node_id),
            port: env_parse("BROKER_PORT", default.port),
            http_port: env_parse("HTTP_PORT", default.http_port),
            max_cluster_size: env_parse("MAX_CLUSTER_SIZE", default.max_cluster_size),
        }
    }

    /// Stable identity of this node within the cluster view.
    pub fn node_id_str(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn data_addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn rpc_port(&self) -> u16 {
        self.port + RPC_PORT_OFFSET
    }

    pub fn http_addr(&self) -> String {
        format!("127.0.0.1:{}", self.http_port)
    }

    /// Message stores are node-scoped so several brokers can share a
    /// working directory.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(format!("messages_node_{}.db", self.node_id))
    }

    pub fn pid_path(&self) -> PathBuf {
        PathBuf::from(format!("broker_node_{}.pid", self.node_id))
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("ignoring unparseable {}={:?}", key, val);
                default
            }
        },
        Err(_) => default,
    }
}
