//! # Inter-Node Connection
//!
//! A `Conn` is the managed, message-oriented bidirectional channel between
//! two nodes, layered on a [`crate::transport::Transport`]. It adds:
//!
//! - **Buffer vs stream semantics**: records are held in a backlog until end
//!   of test unless the installed stream filter (or a `Push` flag) releases
//!   them immediately. The backlog is flushed ahead of the terminal message
//!   so the controller always receives the complete record.
//! - **At-most-once RPC**: run requests get a per-connection id; replies are
//!   matched back to the waiting caller, out of order if need be. Every
//!   pending request receives exactly one reply, a failure if the connection
//!   cancels or closes first.
//! - **Cancel/close lifecycle**: cancellation is synchronous at the API
//!   boundary (a flag flip and an enqueued terminal message) and
//!   asynchronous in effect (the I/O tasks observe the terminal message and
//!   drain).
//!
//! ## Task structure
//!
//! Three tasks per connection: *buffer* (filter and order outbound
//! messages), *send* (write to the transport), *receive* (read and dispatch
//! inbound messages). A fourth waits for send and receive to finish, runs
//! the launcher's closers in LIFO order, and emits `ConnDone`.

use crate::defaults;
use crate::filter::StreamFilter;
use crate::launcher::Closer;
use crate::message::{Flags, Message, RunReply};
use crate::node::{Event, EventTx, NodeId};
use crate::record::Record;
use crate::run::{Feedback, Run};
use crate::transport::{MsgReceiver, MsgSender, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// The managed connection to a peer node. Cheap to clone; all clones share
/// the same state and I/O tasks.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

struct Inner {
    peer: NodeId,
    state: Mutex<State>,
    buf_tx: mpsc::UnboundedSender<BufItem>,
    shutdown: watch::Sender<bool>,
}

struct State {
    pending: HashMap<u64, mpsc::Sender<RunReply>>,
    next_id: u64,
    // Rejects new work. Set only by this side's cancel()/canceled()/close();
    // receiving the peer's terminal message does NOT set it, so a draining
    // node can keep forwarding buffered child output until it emits its own
    // terminal message.
    canceled: bool,
    // Our direction's terminal message has been enqueued.
    sent_final: bool,
    closed: bool,
}

enum BufItem {
    Msg(Message),
    Filter(StreamFilter),
}

impl Conn {
    /// Start a connection over `transport` to `peer`. Inbound messages and
    /// lifecycle events surface on `events`; `closers` run in LIFO order
    /// after both I/O tasks terminate.
    pub fn start(transport: Transport, peer: NodeId, events: EventTx, closers: Vec<Closer>) -> Conn {
        let (tx_half, rx_half) = transport.split();
        let (buf_tx, buf_rx) = mpsc::unbounded_channel();
        let (xmit_tx, xmit_rx) = mpsc::channel(defaults::TRANSMIT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            peer: peer.clone(),
            state: Mutex::new(State {
                pending: HashMap::new(),
                next_id: 1,
                canceled: false,
                sent_final: false,
                closed: false,
            }),
            buf_tx,
            shutdown,
        });

        let buffer = tokio::spawn(buffer_loop(buf_rx, xmit_tx, inner.shutdown.subscribe()));
        let send = tokio::spawn(send_loop(
            xmit_rx,
            tx_half,
            inner.shutdown.subscribe(),
            events.clone(),
            peer.clone(),
        ));
        let recv = tokio::spawn(recv_loop(
            rx_half,
            inner.clone(),
            events.clone(),
            inner.shutdown.subscribe(),
        ));

        // Lifetime watcher: both I/O tasks done -> closers (LIFO) -> ConnDone.
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                let _ = buffer.await;
                let _ = send.await;
                let _ = recv.await;
                fail_pending(&inner);
                if !closers.is_empty() {
                    let peer = inner.peer.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        for c in closers.into_iter().rev() {
                            if let Err(e) = c.close() {
                                debug!(peer = %peer, "closer failed: {:#}", e);
                            }
                        }
                    })
                    .await;
                }
                let _ = events.send(Event::ConnDone(inner.peer.clone()));
            });
        }

        Conn { inner }
    }

    /// The peer node descriptor.
    pub fn peer(&self) -> &NodeId {
        &self.inner.peer
    }

    /// Asynchronously submit a run. A matching [`RunReply`] arrives on
    /// `reply` exactly once. `reply` must have capacity of at least one so
    /// the canceled fail-path never blocks; if the connection is already
    /// canceled, the failure reply is emitted immediately and nothing goes
    /// on the wire.
    pub fn run(&self, run: Run, feedback: Feedback, reply: mpsc::Sender<RunReply>) {
        let id = {
            let mut st = self.inner.state.lock().unwrap();
            if st.canceled {
                drop(st);
                let _ = reply.try_send(RunReply::failed(0));
                return;
            }
            let id = st.next_id;
            st.next_id += 1;
            st.pending.insert(id, reply);
            id
        };
        trace!(peer = %self.inner.peer, id, "submit run");
        self.enqueue(Message::Run(crate::message::RunRequest { id, run, feedback }));
    }

    /// Enqueue a non-RPC message. Dropped silently if the connection is
    /// canceled.
    pub fn send(&self, m: Message) {
        if self.is_canceled() {
            trace!(peer = %self.inner.peer, kind = m.kind(), "dropping send on canceled conn");
            return;
        }
        self.enqueue(m);
    }

    /// Reply to a run request received from the peer.
    pub fn reply(&self, id: u64, feedback: Feedback, ok: bool) {
        self.send(Message::Ran(RunReply { id, feedback, ok }));
    }

    /// Mark canceled and emit the terminal `cancel` message. Idempotent.
    pub fn cancel(&self) {
        if self.flip_final() {
            debug!(peer = %self.inner.peer, "cancel");
            self.enqueue(Message::Cancel);
        }
    }

    /// Mark canceled and emit the terminal `canceled` message, flushing
    /// buffered output ahead of it. Idempotent.
    pub fn canceled(&self) {
        if self.flip_final() {
            debug!(peer = %self.inner.peer, "canceled");
            self.enqueue(Message::Canceled);
        }
    }

    /// Whether the connection rejects further work.
    pub fn is_canceled(&self) -> bool {
        self.inner.state.lock().unwrap().canceled
    }

    /// Install or replace the stream filter; the buffered backlog is
    /// re-evaluated against the new filter in original order.
    pub fn stream(&self, filter: StreamFilter) {
        if self.is_canceled() {
            return;
        }
        let _ = self.inner.buf_tx.send(BufItem::Filter(filter));
    }

    /// Tear down the transport and fail all outstanding RPCs. After this
    /// returns no new message is written to the transport.
    pub fn close(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            st.canceled = true;
        }
        fail_pending(&self.inner);
        let _ = self.inner.shutdown.send(true);
    }

    fn flip_final(&self) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        st.canceled = true;
        if st.sent_final {
            return false;
        }
        st.sent_final = true;
        true
    }

    // A late send racing the terminal message is dropped without error: the
    // buffer task is gone and the channel send just fails.
    fn enqueue(&self, m: Message) {
        let _ = self.inner.buf_tx.send(BufItem::Msg(m));
    }
}

fn fail_pending(inner: &Inner) {
    let pending: Vec<(u64, mpsc::Sender<RunReply>)> = {
        let mut st = inner.state.lock().unwrap();
        st.pending.drain().collect()
    };
    for (id, reply) in pending {
        let _ = reply.try_send(RunReply::failed(id));
    }
}

/// Orders outbound messages: `Push` and terminal messages go straight to the
/// transmit channel; records are streamed or buffered per the filter. On the
/// terminal message the backlog is flushed first, then the task stops
/// accepting work.
async fn buffer_loop(
    mut buf_rx: mpsc::UnboundedReceiver<BufItem>,
    xmit_tx: mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut filter: Option<StreamFilter> = None;
    let mut backlog: Vec<Record> = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            item = buf_rx.recv() => {
                let item = match item {
                    Some(item) => item,
                    None => return,
                };
                match item {
                    BufItem::Filter(f) => {
                        let mut keep = Vec::new();
                        for r in backlog.drain(..) {
                            if f.accepts(&r) {
                                if xmit_tx.send(Message::Record(r)).await.is_err() {
                                    return;
                                }
                            } else {
                                keep.push(r);
                            }
                        }
                        backlog = keep;
                        filter = Some(f);
                    }
                    BufItem::Msg(m) => {
                        let flags = m.flags();
                        if flags.contains(Flags::FINAL) {
                            for r in backlog.drain(..) {
                                if xmit_tx.send(Message::Record(r)).await.is_err() {
                                    return;
                                }
                            }
                            let _ = xmit_tx.send(m).await;
                            return;
                        }
                        if flags.contains(Flags::PUSH) {
                            if xmit_tx.send(m).await.is_err() {
                                return;
                            }
                            continue;
                        }
                        match m {
                            Message::Record(r) => match &filter {
                                Some(f) if f.accepts(&r) => {
                                    if xmit_tx.send(Message::Record(r)).await.is_err() {
                                        return;
                                    }
                                }
                                _ => backlog.push(r),
                            },
                            other => {
                                if xmit_tx.send(other).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Writes transmit-ready messages to the transport. On the first write
/// error the remaining channel is drained without writing and the error is
/// reported as an I/O event.
async fn send_loop(
    mut xmit_rx: mpsc::Receiver<Message>,
    mut tx: Box<dyn MsgSender>,
    mut shutdown: watch::Receiver<bool>,
    events: EventTx,
    peer: NodeId,
) {
    let mut failed = false;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            m = xmit_rx.recv() => {
                let m = match m {
                    Some(m) => m,
                    None => break,
                };
                if failed {
                    continue;
                }
                if let Err(e) = tx.send(&m).await {
                    failed = true;
                    let _ = events.send(Event::Fatal {
                        peer: peer.clone(),
                        error: format!("send {}: {}", m.kind(), e),
                    });
                }
            }
        }
    }
    let _ = tx.close().await;
}

/// Reads from the transport and dispatches by message kind. Exits cleanly
/// when the peer's terminal (`Final`) message is seen.
async fn recv_loop(
    mut rx: Box<dyn MsgReceiver>,
    inner: Arc<Inner>,
    events: EventTx,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            res = rx.receive() => match res {
                Ok(m) => {
                    let flags = m.flags();
                    match m {
                        Message::Ran(rep) => {
                            let reply = inner.state.lock().unwrap().pending.remove(&rep.id);
                            match reply {
                                Some(tx) => {
                                    let _ = tx.try_send(rep);
                                }
                                None => {
                                    trace!(peer = %inner.peer, id = rep.id, "reply with no pending request");
                                }
                            }
                        }
                        Message::Run(req) => {
                            let _ = events.send(Event::Run(req));
                        }
                        Message::Setup(s) => {
                            let _ = events.send(Event::Setup(s));
                        }
                        Message::Record(r) => {
                            let _ = events.send(Event::Record(r));
                        }
                        Message::Cancel => {
                            // The peer will not reply to anything pending.
                            fail_pending(&inner);
                            let _ = events.send(Event::Cancel);
                        }
                        Message::Canceled => {
                            fail_pending(&inner);
                        }
                    }
                    if flags.contains(Flags::FINAL) {
                        break;
                    }
                }
                Err(e) => {
                    let _ = events.send(Event::Fatal {
                        peer: inner.peer.clone(),
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }
    }
}
