//! # Wire Message Taxonomy
//!
//! This module defines the typed messages exchanged between nodes, together
//! with the flag mask that controls how each message moves through a
//! connection: whether it may be buffered, must be pushed immediately, or is
//! forwarded upward by intermediary nodes.
//!
//! ## Message Flow
//!
//! ```text
//! controller ──run──▶ node ──run──▶ child node
//!            ◀─ran─── node ◀─ran─── child node
//!            ◀─records (Forward)────┘
//! ```
//!
//! The concrete codec is a length-delimited typed-value stream: each message
//! is encoded with its enum discriminant so the receiver recovers the dynamic
//! type. Encoding lives here; framing lives in [`crate::transport`].

use crate::record::Record;
use crate::run::{Feedback, Run};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

/// Flag mask carried (implicitly, per message kind) by every wire message.
///
/// - `FINAL`: last message in its direction; the sender's transmit side
///   closes after it, and any buffered backlog is flushed ahead of it.
/// - `PUSH`: bypass buffering and the stream filter; transmit now.
/// - `FORWARD`: an intermediary node forwards the message toward the
///   controller instead of handling it locally.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const FINAL: Flags = Flags(1);
    pub const PUSH: Flags = Flags(2);
    pub const FORWARD: Flags = Flags(4);

    /// Returns true if all bits of `other` are set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Flags::FINAL) {
            names.push("Final");
        }
        if self.contains(Flags::PUSH) {
            names.push("Push");
        }
        if self.contains(Flags::FORWARD) {
            names.push("Forward");
        }
        if names.is_empty() {
            names.push("None");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// A request to execute a run tree, submitted over a Conn as an RPC.
///
/// The id is allocated by the sending Conn and echoed back in the matching
/// [`RunReply`], reassociating replies that arrive out of order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// RPC id, unique per Conn direction
    pub id: u64,

    /// The run tree to execute
    pub run: Run,

    /// Feedback accumulated so far in the enclosing subtree
    pub feedback: Feedback,
}

/// The reply to a [`RunRequest`] ("ran").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReply {
    /// Echo of the request id
    pub id: u64,

    /// Feedback produced by the run subtree
    pub feedback: Feedback,

    /// Whether the run succeeded
    pub ok: bool,
}

impl RunReply {
    /// A failure reply, used when a request cannot be executed at all
    /// (canceled Conn, closed dispatch channel, drained RPC map).
    pub fn failed(id: u64) -> Self {
        Self {
            id,
            feedback: Feedback::new(),
            ok: false,
        }
    }
}

/// Node provisioning payload sent to a freshly launched child.
///
/// Carries executable images for the platforms the child may itself need to
/// launch, plus the process-global secret key the traffic runners use to
/// authenticate peers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    /// Platform tag to node-executable image
    pub exes: BTreeMap<String, Vec<u8>>,

    /// Secret key handed to set-keyer runners before first use
    pub key: Option<String>,
}

/// A single wire message.
///
/// The enum discriminant is the type tag on the wire; per-kind flags are
/// intrinsic and returned by [`Message::flags`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Submit a run tree for execution (RPC request)
    Run(RunRequest),

    /// Run completed (RPC reply)
    Ran(RunReply),

    /// Stop accepting work and drain; terminal in the sender's direction
    Cancel,

    /// Drained after Cancel; terminal in the sender's direction
    Canceled,

    /// Provision a freshly launched child node
    Setup(Setup),

    /// A tagged record (log entry, data point, file chunk, error, ...)
    /// flowing toward the controller
    Record(Record),
}

impl Message {
    /// The flag mask for this message kind.
    pub fn flags(&self) -> Flags {
        match self {
            Message::Run(_) | Message::Ran(_) | Message::Setup(_) => Flags::PUSH,
            Message::Cancel | Message::Canceled => Flags::FINAL | Flags::PUSH,
            Message::Record(r) => r.flags(),
        }
    }

    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Run(_) => "run",
            Message::Ran(_) => "ran",
            Message::Cancel => "cancel",
            Message::Canceled => "canceled",
            Message::Setup(_) => "setup",
            Message::Record(_) => "record",
        }
    }

    /// Encode to the typed-value wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the typed-value wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
