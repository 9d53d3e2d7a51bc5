//! # Run Tree
//!
//! A `Run` is a composable tree describing what to execute: ordered
//! (`Serial`), concurrent (`Parallel`), timed (`Schedule`), delegated to a
//! child node (`Child`), or a leaf action (`Runners`). Exactly one of the
//! variants must be set; validation rejects anything else before a test
//! starts.
//!
//! The executor evaluates a tree recursively, threading a string-keyed
//! feedback map through it: a server publishes its bound address under a
//! known key, a subsequently started client looks it up. Feedback merging is
//! order-independent for disjoint keys; overlapping keys are a merge error
//! and fail the run.

use crate::node::{Ctx, EventTx, NodeId};
use crate::record::{ErrorRecord, Recorder};
use crate::registry::Children;
use crate::runners::Runners;
use anyhow::{anyhow, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// String-keyed map of serializable values threaded through a run subtree.
pub type Feedback = BTreeMap<String, serde_json::Value>;

/// Merge `from` into `into`. Any overlapping key is a merge error naming the
/// offending key.
pub fn merge_feedback(into: &mut Feedback, from: Feedback) -> Result<()> {
    for (k, v) in from {
        if into.contains_key(&k) {
            return Err(anyhow!("feedback key collision: {:?}", k));
        }
        into.insert(k, v);
    }
    Ok(())
}

/// Concurrent composition of runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parallel {
    pub runs: Vec<Run>,

    /// Cancel sibling runs when one fails. Off by default: failures are
    /// recorded but siblings run to completion.
    #[serde(default)]
    pub cancel_on_error: bool,
}

/// Timed composition: children are emitted at wait times drawn from `wait`,
/// cycling sequentially or sampled uniformly at random.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Inter-arrival waits, in human-readable form (`10ms`, `2s`)
    pub wait: Vec<String>,

    /// Sample waits uniformly at random instead of cycling
    #[serde(default)]
    pub rand: bool,

    /// Delay the first emission too
    #[serde(default)]
    pub wait_first: bool,

    /// Emit the next child only after the previous one has completed
    #[serde(default)]
    pub sequential: bool,

    pub runs: Vec<Run>,
}

impl Schedule {
    fn waits(&self) -> Result<Vec<Duration>> {
        if self.wait.is_empty() {
            return Err(anyhow!("schedule: wait list must not be empty"));
        }
        self.wait
            .iter()
            .map(|w| crate::cli::parse_duration(w).map_err(|e| anyhow!("schedule wait {:?}: {}", w, e)))
            .collect()
    }
}

/// A sub-run delegated to a child node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRun {
    pub node: NodeId,
    pub run: Box<Run>,
}

/// A tree node with exactly one variant set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Run {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<Vec<Run>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<Parallel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<ChildRun>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runners: Option<Runners>,
}

impl Run {
    pub fn serial(runs: Vec<Run>) -> Run {
        Run {
            serial: Some(runs),
            ..Default::default()
        }
    }

    pub fn parallel(runs: Vec<Run>) -> Run {
        Run {
            parallel: Some(Parallel {
                runs,
                cancel_on_error: false,
            }),
            ..Default::default()
        }
    }

    pub fn schedule(schedule: Schedule) -> Run {
        Run {
            schedule: Some(schedule),
            ..Default::default()
        }
    }

    pub fn child(node: NodeId, run: Run) -> Run {
        Run {
            child: Some(ChildRun {
                node,
                run: Box::new(run),
            }),
            ..Default::default()
        }
    }

    fn set_count(&self) -> usize {
        [
            self.serial.is_some(),
            self.parallel.is_some(),
            self.schedule.is_some(),
            self.child.is_some(),
            self.runners.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }

    /// Reject trees violating the exactly-one invariant, invalid node
    /// descriptors, and runner configurations that fail their self-check.
    pub fn validate(&self) -> Result<()> {
        if self.set_count() != 1 {
            return Err(anyhow!(
                "run: exactly one of serial, parallel, schedule, child, runners must be set"
            ));
        }
        if let Some(runs) = &self.serial {
            for r in runs {
                r.validate()?;
            }
        }
        if let Some(p) = &self.parallel {
            for r in &p.runs {
                r.validate()?;
            }
        }
        if let Some(s) = &self.schedule {
            s.waits()?;
            for r in &s.runs {
                r.validate()?;
            }
        }
        if let Some(c) = &self.child {
            c.node.validate()?;
            c.run.validate()?;
        }
        if let Some(r) = &self.runners {
            r.validate()?;
        }
        Ok(())
    }
}

impl From<Runners> for Run {
    fn from(runners: Runners) -> Run {
        Run {
            runners: Some(runners),
            ..Default::default()
        }
    }
}

/// A cleanup closure registered by a successfully started runner, executed
/// when the owning runs task tears down.
pub struct Canceler {
    name: String,
    f: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl Canceler {
    pub fn new(name: impl Into<String>, f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(self) -> Result<()> {
        (self.f)()
    }
}

/// Sender half of a node's canceler stack. The stack is drained and invoked
/// in reverse push order when the runs task shuts down.
pub type CancelerTx = mpsc::UnboundedSender<Canceler>;

pub fn canceler_stack() -> (CancelerTx, mpsc::UnboundedReceiver<Canceler>) {
    mpsc::unbounded_channel()
}

/// Everything a runner needs: the child registry, the incoming feedback, a
/// recorder tagged with the node id, the canceler stack, and a context it
/// must honor promptly.
#[derive(Clone)]
pub struct Arg {
    pub node: String,
    pub children: Children,
    pub rec: Recorder,
    pub cancelers: CancelerTx,
    pub ctx: Ctx,
    pub feedback: Feedback,
    pub(crate) events: EventTx,
}

impl Arg {
    fn with_feedback(mut self, feedback: Feedback) -> Self {
        self.feedback = feedback;
        self
    }

    fn error(&self, tag: &str, message: impl Into<String>) {
        let _ = self
            .events
            .send(crate::node::Event::Error(ErrorRecord::new(&self.node, tag, message)));
    }
}

type ExecFuture = Pin<Box<dyn Future<Output = (Feedback, bool)> + Send>>;

/// Recursively evaluate `run`, returning the feedback it produced and
/// whether it succeeded. Errors surface as error events on the owning node;
/// the boolean carries failure through the tree.
pub fn execute(run: Run, arg: Arg) -> ExecFuture {
    Box::pin(async move {
        if run.set_count() != 1 {
            arg.error(
                "run",
                "exactly one of serial, parallel, schedule, child, runners must be set",
            );
            return (Feedback::new(), false);
        }
        let Run {
            serial,
            parallel,
            schedule,
            child,
            runners,
        } = run;
        if let Some(runs) = serial {
            run_serial(runs, arg).await
        } else if let Some(p) = parallel {
            run_parallel(p, arg).await
        } else if let Some(s) = schedule {
            run_schedule(s, arg).await
        } else if let Some(c) = child {
            run_child(c, arg).await
        } else if let Some(r) = runners {
            run_leaf(r, arg).await
        } else {
            unreachable!()
        }
    })
}

/// Run children in order, feeding each one the feedback accumulated so far.
/// Stops at the first failure; later children are never started.
async fn run_serial(runs: Vec<Run>, arg: Arg) -> (Feedback, bool) {
    let mut seen = arg.feedback.clone();
    let mut out = Feedback::new();
    for r in runs {
        let (fb, ok) = execute(r, arg.clone().with_feedback(seen.clone())).await;
        if let Err(e) = merge_feedback(&mut out, fb.clone()) {
            arg.error("feedback", format!("{:#}", e));
            return (out, false);
        }
        // Disjoint with `out` implies disjoint with `seen` minus the
        // incoming keys; collisions with incoming feedback are also errors.
        if let Err(e) = merge_feedback(&mut seen, fb) {
            arg.error("feedback", format!("{:#}", e));
            return (out, false);
        }
        if !ok {
            return (out, false);
        }
    }
    (out, true)
}

/// Start all children concurrently and wait for every one. The overall
/// result is the conjunction of child results; a failure cancels siblings
/// only when `cancel_on_error` is set.
async fn run_parallel(p: Parallel, arg: Arg) -> (Feedback, bool) {
    let (cancel, ctx) = arg.ctx.child();
    let mut tasks: JoinSet<(Feedback, bool)> = JoinSet::new();
    for r in p.runs {
        let mut child_arg = arg.clone();
        child_arg.ctx = ctx.clone();
        tasks.spawn(execute(r, child_arg));
    }

    let mut out = Feedback::new();
    let mut ok = true;
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok((fb, child_ok)) => {
                if !child_ok {
                    ok = false;
                    if p.cancel_on_error {
                        cancel.cancel();
                    }
                }
                if let Err(e) = merge_feedback(&mut out, fb) {
                    arg.error("feedback", format!("{:#}", e));
                    ok = false;
                }
            }
            Err(join) => {
                ok = false;
                if join.is_panic() {
                    arg.error("panic", "parallel run panicked");
                }
            }
        }
    }
    (out, ok)
}

/// Emit children at configured wait times. Concurrent mode precomputes fire
/// times into a min-heap and services it with a single timer; sequential
/// mode starts the next child only after the previous one completed.
async fn run_schedule(s: Schedule, arg: Arg) -> (Feedback, bool) {
    let waits = match s.waits() {
        Ok(w) => w,
        Err(e) => {
            arg.error("schedule", format!("{:#}", e));
            return (Feedback::new(), false);
        }
    };
    let mut rng = StdRng::from_entropy();
    let wait_first = s.wait_first;
    let rand_wait = s.rand;
    let mut draw = move |i: usize| -> Duration {
        if rand_wait {
            waits[rng.gen_range(0..waits.len())]
        } else {
            waits[i % waits.len()]
        }
    };

    let mut out = Feedback::new();
    let mut ok = true;

    if s.sequential {
        for (i, r) in s.runs.into_iter().enumerate() {
            if i > 0 || wait_first {
                let d = draw(i);
                tokio::select! {
                    _ = tokio::time::sleep(d) => {}
                    _ = arg.ctx.canceled() => {
                        return (out, false);
                    }
                }
            }
            let (fb, child_ok) = execute(r, arg.clone()).await;
            ok &= child_ok;
            if let Err(e) = merge_feedback(&mut out, fb) {
                arg.error("feedback", format!("{:#}", e));
                ok = false;
            }
        }
        return (out, ok);
    }

    // Precompute fire times and service them from a min-heap.
    let start = Instant::now();
    let mut heap: BinaryHeap<Reverse<(Instant, usize)>> = BinaryHeap::new();
    let mut at = start;
    for i in 0..s.runs.len() {
        if i > 0 || wait_first {
            at += draw(i);
        }
        heap.push(Reverse((at, i)));
    }
    let mut runs: Vec<Option<Run>> = s.runs.into_iter().map(Some).collect();

    let mut tasks: JoinSet<(Feedback, bool)> = JoinSet::new();
    'emit: while let Some(Reverse((when, i))) = heap.pop() {
        tokio::select! {
            _ = tokio::time::sleep_until(when) => {
                if let Some(r) = runs[i].take() {
                    tasks.spawn(execute(r, arg.clone()));
                }
            }
            _ = arg.ctx.canceled() => {
                ok = false;
                break 'emit;
            }
        }
    }

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok((fb, child_ok)) => {
                ok &= child_ok;
                if let Err(e) = merge_feedback(&mut out, fb) {
                    arg.error("feedback", format!("{:#}", e));
                    ok = false;
                }
            }
            Err(join) => {
                ok = false;
                if join.is_panic() {
                    arg.error("panic", "scheduled run panicked");
                }
            }
        }
    }
    (out, ok)
}

/// Submit the inner run to the target child node as an RPC and await its
/// reply. Launches the child on first reference and ships it the executable
/// images its own subtree will need.
async fn run_child(c: ChildRun, arg: Arg) -> (Feedback, bool) {
    let conn = match arg.children.launch(&c.node).await {
        Ok(conn) => conn,
        Err(e) => {
            arg.error("launch", format!("node {}: {:#}", c.node, e));
            return (Feedback::new(), false);
        }
    };

    let mut platforms = BTreeSet::new();
    collect_platforms(&c.run, &mut platforms);
    let mut exes = BTreeMap::new();
    for p in platforms {
        if let Ok(img) = crate::repo::image(&p) {
            exes.insert(p, img);
        }
    }
    let key = crate::runners::key();
    if !exes.is_empty() || key.is_some() {
        conn.send(crate::message::Message::Setup(crate::message::Setup { exes, key }));
    }

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    conn.run(*c.run, arg.feedback.clone(), reply_tx);
    match reply_rx.recv().await {
        Some(rep) => (rep.feedback, rep.ok),
        None => (Feedback::new(), false),
    }
}

/// Invoke the single leaf action. Errors are tagged with the runner's name
/// and surfaced as error events.
async fn run_leaf(r: Runners, mut arg: Arg) -> (Feedback, bool) {
    let name = match r.which() {
        Ok(name) => name,
        Err(e) => {
            arg.error("runners", format!("{:#}", e));
            return (Feedback::new(), false);
        }
    };
    match r.run(&mut arg).await {
        Ok(fb) => (fb, true),
        Err(e) => {
            arg.error(name, format!("{:#}", e));
            (Feedback::new(), false)
        }
    }
}

pub(crate) fn collect_platforms(run: &Run, out: &mut BTreeSet<String>) {
    if let Some(runs) = &run.serial {
        for r in runs {
            collect_platforms(r, out);
        }
    }
    if let Some(p) = &run.parallel {
        for r in &p.runs {
            collect_platforms(r, out);
        }
    }
    if let Some(s) = &run.schedule {
        for r in &s.runs {
            collect_platforms(r, out);
        }
    }
    if let Some(c) = &run.child {
        out.insert(c.node.platform.clone());
        collect_platforms(&c.run, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_disjoint_is_order_independent() {
        let a = Feedback::from([("x".to_string(), json!(1))]);
        let b = Feedback::from([("y".to_string(), json!(2))]);

        let mut ab = a.clone();
        merge_feedback(&mut ab, b.clone()).unwrap();
        let mut ba = b.clone();
        merge_feedback(&mut ba, a.clone()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn merge_collision_names_key() {
        let mut a = Feedback::from([("addr".to_string(), json!("x"))]);
        let b = Feedback::from([("addr".to_string(), json!("y"))]);
        let err = merge_feedback(&mut a, b).unwrap_err();
        assert!(err.to_string().contains("addr"));
        // The original value survives a failed merge.
        assert_eq!(a["addr"], json!("x"));
    }

    #[test]
    fn validation_rejects_empty_union() {
        assert!(Run::default().validate().is_err());
    }

    #[test]
    fn validation_rejects_multiple_set_fields() {
        let mut r = Run::serial(vec![]);
        r.parallel = Some(Parallel::default());
        assert!(r.validate().is_err());
    }

    #[test]
    fn validation_recurses() {
        // A valid wrapper around an invalid leaf must be rejected.
        let r = Run::serial(vec![Run::default()]);
        assert!(r.validate().is_err());

        let r = Run::parallel(vec![Run::from(Runners::sleep("10ms"))]);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn schedule_requires_parsable_waits() {
        let s = Run::schedule(Schedule {
            wait: vec!["10ms".into(), "bogus".into()],
            runs: vec![Run::from(Runners::sleep("1ms"))],
            ..Default::default()
        });
        assert!(s.validate().is_err());

        let s = Run::schedule(Schedule {
            wait: vec![],
            runs: vec![],
            ..Default::default()
        });
        assert!(s.validate().is_err());
    }

    #[tokio::test]
    async fn canceler_stack_drains_in_reverse_order() {
        let (tx, mut rx) = canceler_stack();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            tx.send(Canceler::new(format!("c{}", i), move || {
                order.lock().unwrap().push(i);
                Ok(())
            }))
            .unwrap();
        }
        rx.close();
        let mut stack = Vec::new();
        while let Ok(c) = rx.try_recv() {
            stack.push(c);
        }
        for c in stack.into_iter().rev() {
            c.invoke().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1, 0]);
    }
}
