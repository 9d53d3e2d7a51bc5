//! # Runners
//!
//! A runner is the leaf action of a run tree: it does one thing on the node
//! it executes on, honoring context cancellation promptly, and returns a
//! feedback map for runners started after it. The [`Runners`] union carries
//! exactly one action variant; validation rejects zero or multiple.
//!
//! Optional capabilities, discovered per variant:
//!
//! - **canceler**: a successfully started runner may push a cleanup closure
//!   onto the node's canceler stack; cleanups execute in reverse push order
//!   at teardown (the server runners use this to stop serving).
//! - **validator**: a configuration-time self-check, run before any launch.
//! - **set-keyer**: the traffic runners receive a process-global secret key
//!   before first use and authenticate their peers with it.

use crate::run::{Arg, Feedback};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub mod packet;
pub mod stream;
pub mod system;

pub use packet::{PacketClient, PacketServer};
pub use stream::{StreamClient, StreamServer};
pub use system::System;

/// The process-global secret key, delivered by the setup message before any
/// runner that uses it starts.
static KEY: OnceLock<String> = OnceLock::new();

pub fn set_key(key: String) {
    let _ = KEY.set(key);
}

pub fn key() -> Option<String> {
    KEY.get().cloned()
}

/// The common runner contract.
#[async_trait]
pub trait Runner {
    /// Perform the action. `arg` carries the child registry, the incoming
    /// feedback, the recorder, and the canceler stack.
    async fn run(&self, arg: &mut Arg) -> Result<Feedback>;

    /// Configuration-time self-check.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Do nothing for a fixed time. Mostly useful for spacing test phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sleep {
    pub duration: String,
}

#[async_trait]
impl Runner for Sleep {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        let d = crate::cli::parse_duration(&self.duration).map_err(|e| anyhow!(e))?;
        tokio::select! {
            _ = tokio::time::sleep(d) => Ok(Feedback::new()),
            _ = arg.ctx.canceled() => Err(anyhow!("context canceled")),
        }
    }

    fn validate(&self) -> Result<()> {
        crate::cli::parse_duration(&self.duration)
            .map(|_| ())
            .map_err(|e| anyhow!("sleep duration {:?}: {}", self.duration, e))
    }
}

/// Record host facts: hostname, platform tag, CPU count, kernel version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysInfo {}

#[async_trait]
impl Runner for SysInfo {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|s| s.trim().to_string())
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let kernel = std::fs::read_to_string("/proc/version")
            .map(|s| s.lines().next().unwrap_or("").to_string())
            .unwrap_or_default();
        arg.rec.record(crate::record::Record::SysInfo(crate::record::SysInfoData {
            time: chrono::Utc::now(),
            node: arg.rec.node().to_string(),
            hostname,
            platform: crate::repo::platform(),
            cpus: num_cpus::get(),
            kernel,
        }));
        Ok(Feedback::new())
    }
}

/// Install a result stream filter on the upward direction, releasing
/// matching buffered records and streaming matching future ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultStream {
    #[serde(default)]
    pub filter: crate::filter::StreamFilter,
}

#[async_trait]
impl Runner for ResultStream {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        arg.rec.stream(self.filter.clone());
        Ok(Feedback::new())
    }
}

/// Launch a set of child nodes ahead of use. Internal: emitted into child
/// run trees so nodes bring up their own children recursively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupNodes {
    pub nodes: Vec<crate::node::NodeId>,
}

#[async_trait]
impl Runner for SetupNodes {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        for n in &self.nodes {
            let conn = arg
                .children
                .launch(n)
                .await
                .with_context(|| format!("setting up node {}", n))?;
            if let Some(key) = key() {
                conn.send(crate::message::Message::Setup(crate::message::Setup {
                    exes: Default::default(),
                    key: Some(key),
                }));
            }
        }
        Ok(Feedback::new())
    }

    fn validate(&self) -> Result<()> {
        for n in &self.nodes {
            n.validate()?;
        }
        Ok(())
    }
}

/// The runner union: exactly one action variant set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Runners {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<Sleep>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<System>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysinfo: Option<SysInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_client: Option<StreamClient>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_server: Option<StreamServer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_client: Option<PacketClient>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_server: Option<PacketServer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_stream: Option<ResultStream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupNodes>,
}

impl Runners {
    /// The name of the single set variant, or a union error.
    pub fn which(&self) -> Result<&'static str> {
        let mut names = Vec::new();
        if self.sleep.is_some() {
            names.push("sleep");
        }
        if self.system.is_some() {
            names.push("system");
        }
        if self.sysinfo.is_some() {
            names.push("sysinfo");
        }
        if self.stream_client.is_some() {
            names.push("stream_client");
        }
        if self.stream_server.is_some() {
            names.push("stream_server");
        }
        if self.packet_client.is_some() {
            names.push("packet_client");
        }
        if self.packet_server.is_some() {
            names.push("packet_server");
        }
        if self.result_stream.is_some() {
            names.push("result_stream");
        }
        if self.setup.is_some() {
            names.push("setup");
        }
        match names.len() {
            1 => Ok(names[0]),
            0 => Err(anyhow!("runners: no action variant set")),
            _ => Err(anyhow!("runners: multiple action variants set: {}", names.join(", "))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.which()?;
        self.as_runner().validate()
    }

    /// Invoke the single set variant.
    pub async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        self.as_runner().run(arg).await
    }

    fn as_runner(&self) -> &dyn Runner {
        if let Some(r) = &self.sleep {
            return r;
        }
        if let Some(r) = &self.system {
            return r;
        }
        if let Some(r) = &self.sysinfo {
            return r;
        }
        if let Some(r) = &self.stream_client {
            return r;
        }
        if let Some(r) = &self.stream_server {
            return r;
        }
        if let Some(r) = &self.packet_client {
            return r;
        }
        if let Some(r) = &self.packet_server {
            return r;
        }
        if let Some(r) = &self.result_stream {
            return r;
        }
        if let Some(r) = &self.setup {
            return r;
        }
        unreachable!("which() rejects empty unions")
    }

    pub fn sleep(duration: &str) -> Runners {
        Runners {
            sleep: Some(Sleep {
                duration: duration.to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn system(command: &str) -> Runners {
        Runners {
            system: Some(System::command(command)),
            ..Default::default()
        }
    }

    pub fn sysinfo() -> Runners {
        Runners {
            sysinfo: Some(SysInfo {}),
            ..Default::default()
        }
    }

    pub fn result_stream(filter: crate::filter::StreamFilter) -> Runners {
        Runners {
            result_stream: Some(ResultStream { filter }),
            ..Default::default()
        }
    }

    pub fn stream_server(server: StreamServer) -> Runners {
        Runners {
            stream_server: Some(server),
            ..Default::default()
        }
    }

    pub fn stream_client(client: StreamClient) -> Runners {
        Runners {
            stream_client: Some(client),
            ..Default::default()
        }
    }

    pub fn packet_server(server: PacketServer) -> Runners {
        Runners {
            packet_server: Some(server),
            ..Default::default()
        }
    }

    pub fn packet_client(client: PacketClient) -> Runners {
        Runners {
            packet_client: Some(client),
            ..Default::default()
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared scaffolding for runner tests: an [`Arg`] wired to an
    //! in-memory peer whose wire traffic is observable.

    use super::*;
    use crate::conn::Conn;
    use crate::message::Message;
    use crate::node::{CancelHandle, Ctx, Event, NodeId};
    use crate::record::Recorder;
    use crate::registry::Children;
    use crate::run::{canceler_stack, Canceler};
    use crate::transport::Transport;
    use tokio::sync::mpsc;

    pub struct TestArg {
        pub arg: Arg,
        pub cancel: CancelHandle,
        pub wire: mpsc::UnboundedReceiver<Message>,
        #[allow(dead_code)]
        pub events: mpsc::UnboundedReceiver<Event>,
        cancelers_rx: mpsc::UnboundedReceiver<Canceler>,
    }

    impl TestArg {
        pub fn new() -> Self {
            let (events_tx, events) = mpsc::unbounded_channel();
            let (a, mut b) = Transport::pair();
            let (wire_tx, wire) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Ok(m) = b.receive().await {
                    let _ = wire_tx.send(m);
                }
            });
            let conn = Conn::start(a, NodeId::named("peer"), events_tx.clone(), Vec::new());
            let (cancelers, cancelers_rx) = canceler_stack();
            let (cancel, ctx) = Ctx::new();
            let arg = Arg {
                node: "t".to_string(),
                children: Children::new(events_tx.clone()),
                rec: Recorder::new("t", conn),
                cancelers,
                ctx,
                feedback: Feedback::new(),
                events: events_tx,
            };
            Self {
                arg,
                cancel,
                wire,
                events,
                cancelers_rx,
            }
        }

        /// Drain and invoke registered cancelers, LIFO.
        pub fn run_cancelers(&mut self) {
            self.cancelers_rx.close();
            let mut stack = Vec::new();
            while let Ok(c) = self.cancelers_rx.try_recv() {
                stack.push(c);
            }
            for c in stack.into_iter().rev() {
                let _ = c.invoke();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::TestArg;
    use super::*;
    use crate::message::Message;
    use crate::record::Record;
    use std::time::{Duration, Instant};
    use tokio::time::timeout;

    #[test]
    fn union_rejects_zero_and_multiple() {
        assert!(Runners::default().which().is_err());

        let mut r = Runners::sleep("1ms");
        r.sysinfo = Some(SysInfo {});
        let err = r.which().unwrap_err();
        assert!(err.to_string().contains("sleep"));
        assert!(err.to_string().contains("sysinfo"));
    }

    #[test]
    fn union_names_single_variant() {
        assert_eq!(Runners::sleep("1ms").which().unwrap(), "sleep");
        assert_eq!(Runners::sysinfo().which().unwrap(), "sysinfo");
    }

    #[test]
    fn sleep_validates_duration() {
        assert!(Runners::sleep("10ms").validate().is_ok());
        assert!(Runners::sleep("bogus").validate().is_err());
    }

    #[tokio::test]
    async fn sleep_runs_for_at_least_its_duration() {
        let mut t = TestArg::new();
        let start = Instant::now();
        Runners::sleep("20ms").run(&mut t.arg).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn sleep_aborts_promptly_on_cancel() {
        let mut t = TestArg::new();
        let cancel = t.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let start = Instant::now();
        let err = Runners::sleep("10s").run(&mut t.arg).await.unwrap_err();
        assert!(err.to_string().contains("canceled"));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sysinfo_records_host_facts() {
        let mut t = TestArg::new();
        Runners::sysinfo().run(&mut t.arg).await.unwrap();
        // Records buffer until a filter streams them.
        t.arg.rec.stream(crate::filter::StreamFilter::all());
        let m = timeout(Duration::from_secs(2), t.wire.recv()).await.unwrap().unwrap();
        match m {
            Message::Record(Record::SysInfo(s)) => {
                assert!(s.cpus >= 1);
                assert_eq!(s.platform, crate::repo::platform());
            }
            m => panic!("unexpected message: {:?}", m),
        }
    }

    #[tokio::test]
    async fn result_stream_installs_filter() {
        let mut t = TestArg::new();
        // A record produced before the filter stays buffered...
        t.arg.rec.log("tag", "early");
        assert!(t.wire.try_recv().is_err());
        // ...until the result-stream runner releases it.
        Runners::result_stream(crate::filter::StreamFilter::all())
            .run(&mut t.arg)
            .await
            .unwrap();
        let m = timeout(Duration::from_secs(2), t.wire.recv()).await.unwrap().unwrap();
        match m {
            Message::Record(Record::Log(l)) => assert_eq!(l.text, "early"),
            m => panic!("unexpected message: {:?}", m),
        }
    }
}
