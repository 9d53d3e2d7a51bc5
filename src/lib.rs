//! # Antler
//!
//! A distributed network-testing harness. Antler executes a user-defined tree
//! of test actions (traffic generators, server processes, system commands,
//! data collectors) across a fleet of nodes: the controlling process itself,
//! subprocesses on the same host, subprocesses inside Linux network
//! namespaces, or remote processes reached over an ssh channel.
//!
//! The library coordinates concurrent and sequential execution across the
//! fleet, streams measurements back to the controller, and tears everything
//! down cleanly on success, failure, or interrupt.

pub mod cli;
pub mod conn;
pub mod control;
pub mod filter;
pub mod launcher;
pub mod logging;
pub mod message;
pub mod node;
pub mod record;
pub mod registry;
pub mod repo;
pub mod run;
pub mod runners;
pub mod transport;

pub use conn::Conn;
pub use control::{run, run_ctx, Outcome};
pub use filter::{FilterRule, StreamFilter};
pub use message::{Flags, Message};
pub use node::{Ctx, Node, NodeId};
pub use record::{Record, Recorder};
pub use run::{Feedback, Run};
pub use transport::Transport;

/// The current version of the harness
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Grace period after a node enters Cancel before unresponsive children
    /// are forcibly terminated
    pub const CANCEL_GRACE: Duration = Duration::from_secs(1);

    /// Maximum number of explicit KEY=VALUE environment entries per node
    /// descriptor, so descriptors stay bounded and hashable
    pub const ENV_MAX: usize = 16;

    /// Capacity of the bounded transmit channel between a Conn's buffer and
    /// send tasks
    pub const TRANSMIT_CAPACITY: usize = 64;

    /// Maximum encoded size of a single wire message
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Interval between samples emitted by the traffic runners
    pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

    /// Feedback key under which server runners publish their bound address
    pub const ADDR_KEY: &str = "addr";
}
