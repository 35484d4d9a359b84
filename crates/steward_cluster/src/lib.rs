//! Steward Cluster
//!
//! Distributed supervision: replicated membership and child directory merged
//! by gossip, rendezvous placement, local supervision with restart policies,
//! failover of children whose member is gone, and graceful handoff on leave.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod failover;
pub mod membership;
pub mod merge;
pub mod node;
pub mod placement;
pub mod remote;
pub mod shutdown;
pub mod spec;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod table;

pub use config::NodeConfig;
pub use directory::{ChildDirectory, Claim, ClaimState};
pub use membership::{MemberEntry, MemberStatus, MemberTransition, MembershipView};
pub use node::{Lifecycle, Node};
pub use placement::{place, PlacementError, PlacementStrategy};
pub use remote::{
    RemoteClient, RemoteRequest, Request, RequestHandler, Response, StartReply, Transport,
    TransportError,
};
pub use shutdown::ShutdownReport;
pub use spec::{ChildKind, RestartPolicy, WorkerSpec};
pub use state::{ClusterState, StateChange};
pub use store::ClusterStore;
pub use supervisor::{LocalSupervisor, StartOutcome, SupervisorError};
pub use table::{ChildCounts, ChildReport, RestartIntensity};
