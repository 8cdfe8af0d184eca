// Process housekeeping: the node's own pid file, and the leader-only
// janitor that clears pid/log files left behind by broker processes that
// died without cleaning up.

use herald_base::Result;
use herald_raft::RaftNode;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SWEEP_EVERY: Duration = Duration::from_secs(60);

pub fn write_pid_file(path: &Path) -> Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Every minute, and only while this node is the leader (so at most one
/// janitor runs per cluster), scan the working directory for stale
/// `broker_node_*.pid` files.
pub fn spawn_dead_node_sweeper(raft: Arc<RaftNode>) -> Result<()> {
    std::thread::Builder::new()
        .name("node-janitor".to_owned())
        .spawn(move || loop {
            std::thread::sleep(SWEEP_EVERY);
            if raft.is_leader() {
                if let Err(e) = sweep_dead_nodes(Path::new(".")) {
                    debug!("dead-node sweep failed: {}", e);
                }
            }
        })?;
    Ok(())
}

fn sweep_dead_nodes(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("broker_node_") || !name.ends_with(".pid") {
            continue;
        }
        let path = entry.path();
        // Unreadable or garbage pid files count as stale too.
        let alive = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(|pid| Path::new(&format!("/proc/{}", pid)).exists())
            .unwrap_or(false);
        if !alive {
            info!("removing stale {}", name);
            let _ = std::fs::remove_file(&path);
            let log = path.with_extension("log");
            if log.exists() {
                info!("removing stale {}", log.display());
                let _ = std::fs::remove_file(&log);
            }
        }
    }
    Ok(())
}
