//! # Controller
//!
//! The in-process root of a test. The controller serves the first-hop node
//! on a task over an in-memory channel pair, submits the run tree to it,
//! streams records back to the caller as they arrive, and tears the fleet
//! down by canceling the connection once the run replies (or the context is
//! canceled). Buffered records are flushed with the node's terminal message,
//! so the caller receives the complete record even on abort.

use crate::conn::Conn;
use crate::launcher::Launch;
use crate::message::{Message, Setup};
use crate::node::{Ctx, Event, Node, NodeId};
use crate::record::Record;
use crate::run::{collect_platforms, Feedback, Run};
use crate::transport::Transport;
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// The final result of a test run.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Feedback produced by the top-level run
    pub feedback: Feedback,

    /// Whether the run succeeded
    pub ok: bool,
}

/// Execute `run`, delivering records to `on_record` as they stream in.
pub async fn run(run: Run, on_record: impl FnMut(Record)) -> Result<Outcome> {
    run_ctx(Ctx::background(), run, on_record).await
}

/// Execute `run` under `ctx`. Canceling the context aborts the test: the
/// fleet drains, buffered records are flushed to `on_record`, and an error
/// is returned.
pub async fn run_ctx(ctx: Ctx, run: Run, mut on_record: impl FnMut(Record)) -> Result<Outcome> {
    run.validate()?;

    let (near, far) = Transport::pair();
    let node = tokio::spawn(Node::new("").serve(far, ctx.clone()));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let peer = NodeId {
        id: "root".to_string(),
        platform: crate::repo::platform(),
        launch: Launch::InProcess,
        netns: None,
        env: Default::default(),
    };
    let conn = Conn::start(near, peer, events_tx, Vec::new());

    // Provision the first hop: executable images for every platform the
    // tree reaches, plus the flow-authentication key.
    if crate::runners::key().is_none() {
        crate::runners::set_key(Uuid::new_v4().to_string());
    }
    let mut platforms = BTreeSet::new();
    collect_platforms(&run, &mut platforms);
    let mut exes = BTreeMap::new();
    for p in platforms {
        if let Ok(img) = crate::repo::image(&p) {
            exes.insert(p, img);
        }
    }
    conn.send(Message::Setup(Setup {
        exes,
        key: crate::runners::key(),
    }));

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    conn.run(run, Feedback::new(), reply_tx);

    let mut outcome: Option<Outcome> = None;
    let mut fatal: Option<String> = None;
    let mut cancel_requested = false;
    let mut done = false;
    while !done {
        tokio::select! {
            Some(rep) = reply_rx.recv(), if outcome.is_none() => {
                debug!(ok = rep.ok, "run replied");
                outcome = Some(Outcome {
                    feedback: rep.feedback,
                    ok: rep.ok,
                });
                conn.cancel();
            }
            ev = events_rx.recv() => match ev {
                None => break,
                Some(Event::Record(r)) => on_record(r),
                Some(Event::Fatal { peer, error }) => {
                    fatal.get_or_insert(format!("conn {}: {}", peer, error));
                    conn.cancel();
                }
                Some(Event::ConnDone(_)) => done = true,
                Some(_) => {}
            },
            _ = ctx.canceled(), if !cancel_requested => {
                cancel_requested = true;
                conn.cancel();
            }
        }
    }

    let serve = node.await;
    if ctx.is_canceled() {
        return Err(anyhow!("context canceled"));
    }
    if let Some(e) = fatal {
        return Err(anyhow!(e));
    }
    match outcome {
        Some(outcome) => Ok(outcome),
        None => match serve {
            Ok(Err(e)) => Err(e),
            _ => Err(anyhow!("connection closed before the run replied")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::Runners;

    #[tokio::test]
    async fn invalid_tree_is_rejected_before_launch() {
        let err = run(Run::default(), |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[tokio::test]
    async fn single_sleep_succeeds() {
        let out = run(Run::from(Runners::sleep("5ms")), |_| {}).await.unwrap();
        assert!(out.ok);
        assert!(out.feedback.is_empty());
    }
}
