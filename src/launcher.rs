//! # Launcher
//!
//! Turns a node descriptor into a running peer and a transport to it.
//!
//! Variants:
//!
//! - **In-process**: the peer node runs on a task in this process, over an
//!   in-memory channel pair. Used for the controller's first hop and in
//!   tests.
//! - **Local**: a subprocess running the platform-matching node executable
//!   from the repository, optionally inside a named network namespace and
//!   optionally under `sudo`. The child's stdio is the transport; its stderr
//!   is forwarded line by line to the parent log.
//! - **Ssh**: the analogous command line over an ssh channel.
//!
//! Each launch accumulates a push-only stack of closers (release the
//! extracted executable, delete the created namespace, kill the child). The
//! connection's close path pops them in LIFO order; a launch that fails
//! partway unwinds the stack immediately.

use crate::node::{Ctx, Netns, Node, NodeId};
use crate::repo;
use crate::transport::Transport;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How a node process is brought up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Launch {
    /// Serve the node on a task in this process
    InProcess,

    /// Local subprocess, optionally under sudo
    Local {
        #[serde(default)]
        sudo: bool,
    },

    /// Remote process over an ssh channel
    Ssh { dest: String },
}

impl Default for Launch {
    fn default() -> Self {
        Launch::Local { sudo: false }
    }
}

/// A deferred cleanup registered during launch and executed by the
/// connection's close path.
pub struct Closer {
    name: &'static str,
    f: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl Closer {
    pub fn new(name: &'static str, f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Self { name, f: Box::new(f) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn close(self) -> Result<()> {
        let Closer { name, f } = self;
        f().with_context(|| name)
    }
}

/// Launch `node` and return the transport to it plus the closer stack, in
/// push order.
pub async fn launch(node: &NodeId) -> Result<(Transport, Vec<Closer>)> {
    match &node.launch {
        Launch::InProcess => launch_in_process(node),
        Launch::Local { sudo } => launch_local(node, *sudo).await,
        Launch::Ssh { dest } => launch_ssh(node, dest).await,
    }
}

fn launch_in_process(node: &NodeId) -> Result<(Transport, Vec<Closer>)> {
    let (near, far) = Transport::pair();
    let id = node.id.clone();
    tokio::spawn(async move {
        if let Err(e) = Node::new(&id).serve(far, Ctx::background()).await {
            debug!(node = %id, "in-process node exited: {:#}", e);
        }
    });
    Ok((near, Vec::new()))
}

async fn launch_local(node: &NodeId, sudo: bool) -> Result<(Transport, Vec<Closer>)> {
    let mut closers = Vec::new();

    let exe = match repo::acquire(&node.platform) {
        Ok(exe) => exe,
        Err(e) => return Err(e),
    };
    let exe_path = exe.path().to_path_buf();
    closers.push(Closer::new("release executable", move || exe.release()));

    if let Some(ns) = &node.netns {
        if let Err(e) = prepare_netns(ns, &mut closers).await {
            unwind(closers);
            return Err(e);
        }
    }

    let mut argv: Vec<String> = Vec::new();
    if sudo {
        argv.push("sudo".to_string());
    }
    if let Some(ns) = &node.netns {
        argv.extend(["ip", "netns", "exec"].iter().map(|s| s.to_string()));
        argv.push(ns.name.clone());
    }
    argv.push(exe_path.to_string_lossy().into_owned());
    argv.push(node.id.clone());

    match spawn_piped(node, &argv) {
        Ok((transport, kill)) => {
            closers.push(kill);
            Ok((transport, closers))
        }
        Err(e) => {
            unwind(closers);
            Err(e)
        }
    }
}

async fn launch_ssh(node: &NodeId, dest: &str) -> Result<(Transport, Vec<Closer>)> {
    let mut closers = Vec::new();
    if let Some(ns) = &node.netns {
        if ns.create {
            return Err(anyhow!(
                "node {}: namespace creation over ssh is not supported",
                node.id
            ));
        }
    }

    // The remote command mirrors the local one; the node executable named
    // for the remote platform must be on the remote PATH.
    let mut remote: Vec<String> = Vec::new();
    if !node.env.vars.is_empty() {
        remote.push("env".to_string());
        remote.extend(node.env.vars.iter().cloned());
    }
    if let Some(ns) = &node.netns {
        remote.extend(["ip", "netns", "exec"].iter().map(|s| s.to_string()));
        remote.push(ns.name.clone());
    }
    remote.push(format!("{}-{}", repo::NODE_PREFIX, node.platform));
    remote.push(node.id.clone());

    let argv = vec!["ssh".to_string(), dest.to_string(), remote.join(" ")];
    match spawn_piped(node, &argv) {
        Ok((transport, kill)) => {
            closers.push(kill);
            Ok((transport, closers))
        }
        Err(e) => {
            unwind(closers);
            Err(e)
        }
    }
}

async fn prepare_netns(ns: &Netns, closers: &mut Vec<Closer>) -> Result<()> {
    if !ns.create {
        return Ok(());
    }
    let status = Command::new("ip")
        .args(["netns", "add", &ns.name])
        .status()
        .await
        .with_context(|| format!("creating netns {}", ns.name))?;
    if !status.success() {
        return Err(anyhow!("ip netns add {} exited with {}", ns.name, status));
    }
    let name = ns.name.clone();
    closers.push(Closer::new("delete netns", move || {
        let status = std::process::Command::new("ip")
            .args(["netns", "del", &name])
            .status()
            .with_context(|| format!("deleting netns {}", name))?;
        if !status.success() {
            return Err(anyhow!("ip netns del {} exited with {}", name, status));
        }
        Ok(())
    }));
    Ok(())
}

/// Spawn `argv` with piped stdio: stdout/stdin become the transport, stderr
/// is forwarded line by line to the parent log, and the returned closer
/// kills the child if it is still running at teardown.
fn spawn_piped(node: &NodeId, argv: &[String]) -> Result<(Transport, Closer)> {
    let id = node.id.clone();
    debug!(node = %id, "exec {:?}", argv);

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Remote environments are shaped by the command line instead.
    if !matches!(node.launch, Launch::Ssh { .. }) {
        cmd.env_clear();
        cmd.envs(node.env.effective(std::env::vars()));
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning node {} via {:?}", id, argv[0]))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("node {}: no stdin handle", id))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("node {}: no stdout handle", id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("node {}: no stderr handle", id))?;

    // Forward the child's stderr into our log, line by line.
    {
        let id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(node = %id, "{}", line);
            }
        });
    }

    // Reap the child; the closer requests a kill if it is still running.
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    {
        let id = id.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(s) => debug!(node = %id, "child exited with {}", s),
                    Err(e) => warn!(node = %id, "child wait failed: {}", e),
                },
                _ = kill_rx => {
                    let _ = child.start_kill();
                    match child.wait().await {
                        Ok(s) => debug!(node = %id, "child killed, exited with {}", s),
                        Err(e) => warn!(node = %id, "child wait after kill failed: {}", e),
                    }
                }
            }
        });
    }
    let kill = Closer::new("kill child", move || {
        let _ = kill_tx.send(());
        Ok(())
    });

    Ok((Transport::from_io(stdout, stdin), kill))
}

fn unwind(closers: Vec<Closer>) {
    for c in closers.into_iter().rev() {
        let name = c.name();
        if let Err(e) = c.close() {
            warn!("unwind {}: {:#}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn closers_report_their_name_in_errors() {
        let c = Closer::new("delete netns", || Err(anyhow!("no such namespace")));
        let err = c.close().unwrap_err();
        assert!(format!("{:#}", err).contains("delete netns"));
    }

    #[test]
    fn unwind_runs_in_reverse_push_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut closers = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            let counter = counter.clone();
            closers.push(Closer::new("step", move || {
                order.lock().unwrap().push(i);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        unwind(closers);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn in_process_launch_yields_live_transport() {
        let mut node = NodeId::named("inproc");
        node.launch = Launch::InProcess;
        let (mut transport, closers) = launch(&node).await.unwrap();
        assert!(closers.is_empty());

        // The served node answers a cancel with its own terminal canceled.
        transport.send(&crate::message::Message::Cancel).await.unwrap();
        loop {
            match transport.receive().await.unwrap() {
                crate::message::Message::Canceled => break,
                _ => continue,
            }
        }
    }
}
