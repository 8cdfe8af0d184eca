// Leader-based replicated log. One node per broker process; a fixed
// cluster view discovered at startup; a single-leader protocol with
// randomized election timeouts keeps every replica applying the same
// committed entries in the same order.
//
// The pieces:
//
//   log       -- the in-memory entry vector and the command model
//   node      -- roles, elections, replication, commit, the applier
//   rpc       -- one-shot JSON-over-TCP peer calls and the serving loop
//   discovery -- the startup port-range probe that builds the cluster view
//
// The applier hands committed entries to a StateMachine trait object; the
// broker's implementation lives in herald-net so this crate knows nothing
// about sockets, stores or subscribers.

mod discovery;
mod log;
mod node;
mod rpc;


pub use discovery::discover_cluster;
pub use log::{Command, Log, LogEntry};
pub use node::{RaftNode, RaftStatus, Role, StateMachine, HEARTBEAT_INTERVAL};
pub use rpc::{
    append_entries, request_vote, AppendEntriesRequest, AppendEntriesResponse, Request,
    RpcServer, VoteRequest, VoteResponse, RPC_TIMEOUT,
};
