//! # Node Runtime
//!
//! A node is one process participating in a test: the controller itself, a
//! subprocess on the same host (optionally inside a network namespace), or a
//! remote process over ssh. This module holds the node *descriptor* (the
//! hashable identity used to key the child registry) and the node *runtime*:
//! a single-threaded event loop that accepts runs from the parent
//! connection, supervises children, and drains to a clean exit.
//!
//! ## Lifecycle
//!
//! States progress monotonically, never regressing or skipping:
//!
//! ```text
//! Run ──▶ Cancel ──▶ Canceled ──▶ Done
//! ```
//!
//! - `Run`: accept and dispatch runs.
//! - `Cancel`: entered on an unrecoverable error, a parent `cancel`, or
//!   context cancellation. Closes the run-dispatch channel, cancels all
//!   children, and waits for in-flight work to drain.
//! - `Canceled`: entered once the runs task has exited, the child registry
//!   is empty, and the context is done. Emits the terminal `canceled`
//!   message, flushing buffered records upward.
//! - `Done`: entered when the parent connection reports `ConnDone`.
//!
//! The event loop is the serialization point: every state change happens on
//! it, and handlers never send to their own event channel.

use crate::conn::Conn;
use crate::defaults;
use crate::launcher::Launch;
use crate::message::{RunRequest, Setup};
use crate::record::{ErrorRecord, Record, Recorder};
use crate::registry::Children;
use crate::run::{canceler_stack, execute, Arg, Feedback};
use crate::transport::Transport;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Network-namespace parameters for a node descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Netns {
    /// Namespace name
    pub name: String,

    /// Create the namespace at launch (and delete it at teardown) rather
    /// than using an existing one
    pub create: bool,
}

/// Environment specification for a launched node.
///
/// The explicit entry list is capped at [`defaults::ENV_MAX`] entries by
/// validation, keeping the whole descriptor bounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvSpec {
    /// Explicit KEY=VALUE entries
    #[serde(default)]
    pub vars: Vec<String>,

    /// Inherit the parent process environment
    #[serde(default)]
    pub inherit: bool,
}

impl EnvSpec {
    /// The effective environment: the parent environment when inheriting,
    /// with explicit entries layered on top (explicit wins).
    pub fn effective(
        &self,
        parent: impl Iterator<Item = (String, String)>,
    ) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = if self.inherit { parent.collect() } else { Vec::new() };
        for var in &self.vars {
            if let Some((k, v)) = var.split_once('=') {
                env.retain(|(ek, _)| ek != k);
                env.push((k.to_string(), v.to_string()));
            }
        }
        env
    }
}

/// Node descriptor: the stable identity of a node within a test.
///
/// Value-typed and bounded, so it can key the child registry map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Stable identifier; empty means "the parent"
    pub id: String,

    /// Platform tag of the node executable, e.g. `linux-x86_64`
    pub platform: String,

    /// How the node process is launched
    #[serde(default)]
    pub launch: Launch,

    /// Optional network namespace the process runs in
    #[serde(default)]
    pub netns: Option<Netns>,

    /// Environment specification
    #[serde(default)]
    pub env: EnvSpec,
}

impl NodeId {
    /// The descriptor denoting the parent direction.
    pub fn parent() -> Self {
        Self {
            id: String::new(),
            platform: String::new(),
            launch: Launch::default(),
            netns: None,
            env: EnvSpec::default(),
        }
    }

    /// A local node with the current platform and default launch.
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            platform: crate::repo::platform(),
            launch: Launch::default(),
            netns: None,
            env: EnvSpec::default(),
        }
    }

    pub fn is_parent(&self) -> bool {
        self.id.is_empty()
    }

    /// Reject descriptors that cannot be launched or would be unbounded.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(anyhow!("node id must not be empty"));
        }
        if self.platform.is_empty() {
            return Err(anyhow!("node {}: platform must not be empty", self.id));
        }
        if self.env.vars.len() > defaults::ENV_MAX {
            return Err(anyhow!(
                "node {}: at most {} environment entries allowed, got {}",
                self.id,
                defaults::ENV_MAX,
                self.env.vars.len()
            ));
        }
        for var in &self.env.vars {
            if !var.contains('=') {
                return Err(anyhow!(
                    "node {}: environment entry {:?} is not KEY=VALUE",
                    self.id,
                    var
                ));
            }
        }
        if let Some(ns) = &self.netns {
            if ns.name.is_empty() {
                return Err(anyhow!("node {}: netns name must not be empty", self.id));
            }
        }
        Ok(())
    }
}

// The empty root/parent id renders as "-", the same sentinel record dump
// lines use.
impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_parent() {
            write!(f, "-")
        } else {
            write!(f, "{}", self.id)
        }
    }
}

/// Cancellation context: a tree of watch channels rooted at the process
/// context. Cheap to clone; cancellation is observed promptly by every
/// blocking operation in the harness.
#[derive(Clone)]
pub struct Ctx {
    // Held only to keep the channel alive for late subscribers.
    _tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

/// Handle that cancels the [`Ctx`] it was created with.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Ctx {
    pub fn new() -> (CancelHandle, Ctx) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (CancelHandle { tx: tx.clone() }, Ctx { _tx: tx, rx })
    }

    /// A context that is never canceled.
    pub fn background() -> Ctx {
        Ctx::new().1
    }

    /// A child context, canceled when either its own handle cancels or the
    /// parent context does.
    pub fn child(&self) -> (CancelHandle, Ctx) {
        let (handle, ctx) = Ctx::new();
        let parent = self.clone();
        let h = handle.clone();
        tokio::spawn(async move {
            parent.canceled().await;
            h.cancel();
        });
        (handle, ctx)
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the context is canceled.
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Events drained by the node's single event-loop task.
#[derive(Debug)]
pub enum Event {
    /// Inbound run request from the parent
    Run(RunRequest),

    /// A record produced locally or received from a child for forwarding
    Record(Record),

    /// A recoverable error: stored as the node's first error and forwarded,
    /// but does not cancel the node
    Error(ErrorRecord),

    /// An unrecoverable I/O error on a connection: triggers Cancel
    Fatal { peer: NodeId, error: String },

    /// The parent sent `cancel`
    Cancel,

    /// The process context is done
    CtxDone,

    /// Node provisioning payload from the parent
    Setup(Setup),

    /// The runs task has exited and its canceler stack is drained
    RunsDone,

    /// A connection's I/O tasks have both terminated
    ConnDone(NodeId),

    /// The post-Cancel grace period elapsed with children still present
    GraceExpired,
}

/// Sender half of a node's event channel.
pub type EventTx = mpsc::UnboundedSender<Event>;

/// Node lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Run,
    Cancel,
    Canceled,
    Done,
}

/// The per-process node runtime.
pub struct Node {
    id: String,
    grace: Duration,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            grace: defaults::CANCEL_GRACE,
        }
    }

    /// Override the grace period between Cancel and forced child teardown.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Serve the parent connection until `Final` has been seen in both
    /// directions, then return the node's first error, if any.
    pub async fn serve(self, transport: Transport, ctx: Ctx) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let parent = Conn::start(transport, NodeId::parent(), events_tx.clone(), Vec::new());
        let children = Children::new(events_tx.clone());
        let (cancel, node_ctx) = ctx.child();

        let (runs_tx, runs_rx) = mpsc::unbounded_channel();
        tokio::spawn(runs_loop(
            runs_rx,
            self.id.clone(),
            parent.clone(),
            children.clone(),
            events_tx.clone(),
            node_ctx.clone(),
        ));

        // Observe the outer context only: entering Cancel cancels node_ctx,
        // which must not loop back as another context-done event.
        {
            let events = events_tx.clone();
            let outer = ctx.clone();
            tokio::spawn(async move {
                outer.canceled().await;
                let _ = events.send(Event::CtxDone);
            });
        }

        let mut s = Serving {
            id: self.id,
            grace: self.grace,
            state: NodeState::Run,
            parent,
            children,
            events_tx,
            runs_tx: Some(runs_tx),
            cancel,
            node_ctx,
            runs_done: false,
            parent_done: false,
            first_err: None,
        };

        while s.state != NodeState::Done {
            match events_rx.recv().await {
                Some(ev) => {
                    s.handle(ev).await;
                    s.maybe_advance().await;
                }
                None => break,
            }
        }

        debug!(node = %s.id, "serve done");
        match s.first_err {
            Some(e) => Err(anyhow!(e)),
            None => Ok(()),
        }
    }
}

struct Serving {
    id: String,
    grace: Duration,
    state: NodeState,
    parent: Conn,
    children: Children,
    events_tx: EventTx,
    runs_tx: Option<mpsc::UnboundedSender<RunRequest>>,
    cancel: CancelHandle,
    node_ctx: Ctx,
    runs_done: bool,
    parent_done: bool,
    first_err: Option<String>,
}

impl Serving {
    async fn handle(&mut self, ev: Event) {
        match ev {
            Event::Run(req) => {
                let accepted = match &self.runs_tx {
                    Some(tx) => tx.send(req.clone()).is_ok(),
                    None => false,
                };
                if !accepted {
                    self.parent.reply(req.id, Feedback::new(), false);
                }
            }
            Event::Record(r) => {
                if r.flags().contains(crate::message::Flags::FORWARD) {
                    self.parent.send(crate::message::Message::Record(r));
                }
            }
            Event::Error(rec) => {
                if self.state >= NodeState::Cancel {
                    // Post-cancel errors are logged only.
                    warn!(node = %self.id, "post-cancel error {}: {}", rec.tag, rec.message);
                } else if self.first_err.is_none() {
                    self.first_err = Some(format!("{}: {}", rec.tag, rec.message));
                }
                self.parent.send(crate::message::Message::Record(Record::Error(rec)));
            }
            Event::Fatal { peer, error } => {
                warn!(node = %self.id, peer = %peer, "connection error: {}", error);
                if self.state >= NodeState::Cancel {
                    // I/O errors while draining are expected; log only.
                    return;
                }
                if self.first_err.is_none() {
                    self.first_err = Some(format!("conn {}: {}", peer, error));
                }
                self.parent.send(crate::message::Message::Record(Record::Error(
                    ErrorRecord::new(&self.id, "io", format!("conn {}: {}", peer, error)),
                )));
                self.enter_cancel();
            }
            Event::Cancel => self.enter_cancel(),
            Event::CtxDone => {
                if self.state == NodeState::Run && self.first_err.is_none() {
                    self.first_err = Some("context canceled".to_string());
                }
                self.enter_cancel();
            }
            Event::Setup(setup) => {
                for (platform, bytes) in setup.exes {
                    crate::repo::register(&platform, crate::repo::Source::bytes(bytes));
                }
                if let Some(key) = setup.key {
                    crate::runners::set_key(key);
                }
            }
            Event::RunsDone => self.runs_done = true,
            Event::ConnDone(peer) => {
                if peer.is_parent() {
                    self.parent_done = true;
                } else {
                    self.children.delete(&peer).await;
                }
            }
            Event::GraceExpired => {
                if self.state == NodeState::Cancel && !self.children.is_empty().await {
                    warn!(node = %self.id, "grace period expired, forcing child teardown");
                    self.children.close_all().await;
                }
            }
        }
    }

    fn enter_cancel(&mut self) {
        if self.state != NodeState::Run {
            return;
        }
        debug!(node = %self.id, "entering cancel");
        self.state = NodeState::Cancel;
        self.runs_tx.take();
        self.cancel.cancel();
        let children = self.children.clone();
        let events = self.events_tx.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            children.cancel_all().await;
            tokio::time::sleep(grace).await;
            let _ = events.send(Event::GraceExpired);
        });
    }

    async fn maybe_advance(&mut self) {
        if self.state == NodeState::Cancel
            && self.runs_done
            && self.children.is_empty().await
            && self.node_ctx.is_canceled()
        {
            self.state = NodeState::Canceled;
            self.parent.canceled();
        }
        if self.state == NodeState::Canceled && self.parent_done {
            self.state = NodeState::Done;
        }
    }
}

/// Reads run requests from the dispatch channel, executing each on its own
/// task with panic recovery. When the channel closes, waits out in-flight
/// runs and then unwinds the canceler stack in LIFO order.
async fn runs_loop(
    mut runs_rx: mpsc::UnboundedReceiver<RunRequest>,
    node: String,
    parent: Conn,
    children: Children,
    events: EventTx,
    ctx: Ctx,
) {
    let rec = Recorder::new(node.clone(), parent.clone());
    let (cancelers, mut cancelers_rx) = canceler_stack();
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            req = runs_rx.recv() => {
                let req = match req {
                    Some(req) => req,
                    None => break,
                };
                let arg = Arg {
                    node: node.clone(),
                    children: children.clone(),
                    rec: rec.clone(),
                    cancelers: cancelers.clone(),
                    ctx: ctx.clone(),
                    feedback: req.feedback,
                    events: events.clone(),
                };
                let parent = parent.clone();
                tasks.spawn(async move {
                    let (feedback, ok) = execute(req.run, arg).await;
                    parent.reply(req.id, feedback, ok);
                });
            }
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                surface_panic(res, &events, &node);
            }
        }
    }

    while let Some(res) = tasks.join_next().await {
        surface_panic(res, &events, &node);
    }

    // Unwind the canceler stack: strict LIFO relative to successful pushes.
    cancelers_rx.close();
    let mut stack = Vec::new();
    while let Ok(c) = cancelers_rx.try_recv() {
        stack.push(c);
    }
    for c in stack.into_iter().rev() {
        let name = c.name().to_string();
        if let Err(e) = c.invoke() {
            let _ = events.send(Event::Error(ErrorRecord::new(
                &node,
                "canceler",
                format!("{}: {:#}", name, e),
            )));
        }
    }

    let _ = events.send(Event::RunsDone);
}

fn surface_panic(res: Result<(), tokio::task::JoinError>, events: &EventTx, node: &str) {
    if let Err(join) = res {
        if join.is_panic() {
            let payload = join.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let _ = events.send(Event::Error(ErrorRecord::new(
                node,
                "panic",
                format!("run panicked: {}", msg),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(NodeState::Run < NodeState::Cancel);
        assert!(NodeState::Cancel < NodeState::Canceled);
        assert!(NodeState::Canceled < NodeState::Done);
    }

    #[test]
    fn empty_env_without_inherit_is_empty() {
        let spec = EnvSpec::default();
        let parent = vec![("HOME".to_string(), "/root".to_string())];
        assert!(spec.effective(parent.into_iter()).is_empty());
    }

    #[test]
    fn explicit_env_overrides_inherited() {
        let spec = EnvSpec {
            vars: vec!["PATH=/opt/bin".to_string(), "EXTRA=1".to_string()],
            inherit: true,
        };
        let parent = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let env = spec.effective(parent.into_iter());
        assert!(env.contains(&("PATH".to_string(), "/opt/bin".to_string())));
        assert!(env.contains(&("HOME".to_string(), "/root".to_string())));
        assert!(env.contains(&("EXTRA".to_string(), "1".to_string())));
        assert_eq!(env.iter().filter(|(k, _)| k == "PATH").count(), 1);
    }

    #[test]
    fn descriptor_validation() {
        assert!(NodeId::named("a").validate().is_ok());
        assert!(NodeId::parent().validate().is_err());

        let mut n = NodeId::named("b");
        n.env.vars = vec!["NOEQUALS".to_string()];
        assert!(n.validate().is_err());

        let mut n = NodeId::named("c");
        n.env.vars = (0..=defaults::ENV_MAX).map(|i| format!("K{}=v", i)).collect();
        assert!(n.validate().is_err());

        let mut n = NodeId::named("d");
        n.netns = Some(Netns {
            name: String::new(),
            create: true,
        });
        assert!(n.validate().is_err());
    }

    #[test]
    fn parent_id_displays_with_the_record_sentinel() {
        assert_eq!(format!("{}", NodeId::parent()), "-");
        assert_eq!(format!("{}", NodeId::named("a")), "a");
    }

    #[test]
    fn descriptor_is_hashable_map_key() {
        use std::collections::HashMap;
        let mut m = HashMap::new();
        m.insert(NodeId::named("a"), 1);
        m.insert(NodeId::named("b"), 2);
        assert_eq!(m[&NodeId::named("a")], 1);
        assert_eq!(m.len(), 2);
    }

    #[tokio::test]
    async fn ctx_child_cancels_with_parent() {
        let (parent_handle, parent) = Ctx::new();
        let (_child_handle, child) = parent.child();
        assert!(!child.is_canceled());
        parent_handle.cancel();
        child.canceled().await;
        assert!(child.is_canceled());
    }

    #[tokio::test]
    async fn ctx_child_cancels_independently() {
        let (_parent_handle, parent) = Ctx::new();
        let (child_handle, child) = parent.child();
        child_handle.cancel();
        child.canceled().await;
        assert!(!parent.is_canceled());
    }
}
