//! Packet-oriented (UDP) traffic runners.
//!
//! The client sends sequenced, timestamped probes at a fixed interval; the
//! server echoes them back; the client records a per-probe round-trip
//! sample. Probes are a fixed binary encoding padded to the configured
//! datagram length.

use super::Runner;
use crate::defaults;
use crate::record::{PacketInfo, PacketSample, Record, Side};
use crate::run::{Arg, Canceler, Feedback};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

fn default_addr_key() -> String {
    defaults::ADDR_KEY.to_string()
}

fn default_flow() -> String {
    "packet".to_string()
}

fn default_interval() -> String {
    "10ms".to_string()
}

fn default_length() -> usize {
    64
}

/// On-the-wire probe header, bincode-encoded at the front of each datagram.
#[derive(Debug, Serialize, Deserialize)]
struct Probe {
    seq: u64,
    sent_ns: u64,
}

const PROBE_LEN: usize = 16;

/// Echo datagrams back to their sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketServer {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Feedback key under which the bound address is published
    #[serde(default = "default_addr_key")]
    pub addr_key: String,

    /// Flow identifier tagging this session's records
    #[serde(default = "default_flow")]
    pub flow: String,
}

impl Default for PacketServer {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            addr_key: default_addr_key(),
            flow: default_flow(),
        }
    }
}

#[async_trait]
impl Runner for PacketServer {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        let sock = UdpSocket::bind(&self.listen)
            .await
            .with_context(|| format!("binding {}", self.listen))?;
        let addr = sock.local_addr()?;
        debug!(flow = %self.flow, "packet server on {}", addr);

        arg.rec.record(Record::PacketInfo(PacketInfo {
            time: chrono::Utc::now(),
            node: arg.rec.node().to_string(),
            flow: self.flow.clone(),
            side: Side::Server,
            addr: addr.to_string(),
        }));

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let ctx = arg.ctx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ctx.canceled() => break,
                    res = sock.recv_from(&mut buf) => match res {
                        Ok((n, peer)) => {
                            let _ = sock.send_to(&buf[..n], peer).await;
                        }
                        Err(e) => {
                            debug!("packet recv failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });
        let _ = arg.cancelers.send(Canceler::new("packet server", move || {
            let _ = stop_tx.send(true);
            Ok(())
        }));

        let mut fb = Feedback::new();
        fb.insert(self.addr_key.clone(), serde_json::json!(addr.to_string()));
        Ok(fb)
    }

    fn validate(&self) -> Result<()> {
        if self.flow.is_empty() {
            return Err(anyhow!("packet server: flow must not be empty"));
        }
        Ok(())
    }
}

/// Send probes at a fixed interval to the address published in feedback and
/// record per-probe round-trip samples from the echoes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketClient {
    /// Feedback key the server's address is looked up under
    #[serde(default = "default_addr_key")]
    pub addr_key: String,

    /// How long to probe
    pub duration: String,

    /// Inter-probe interval
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Datagram length; padded beyond the probe header
    #[serde(default = "default_length")]
    pub length: usize,

    /// Flow identifier tagging this session's records
    #[serde(default = "default_flow")]
    pub flow: String,
}

impl PacketClient {
    pub fn new(duration: &str) -> Self {
        Self {
            addr_key: default_addr_key(),
            duration: duration.to_string(),
            interval: default_interval(),
            length: default_length(),
            flow: default_flow(),
        }
    }
}

#[async_trait]
impl Runner for PacketClient {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        let duration = crate::cli::parse_duration(&self.duration).map_err(|e| anyhow!(e))?;
        let interval = crate::cli::parse_duration(&self.interval).map_err(|e| anyhow!(e))?;
        let addr = arg
            .feedback
            .get(&self.addr_key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("feedback key {:?} not set", self.addr_key))?
            .to_string();

        let sock = UdpSocket::bind("0.0.0.0:0").await?;
        sock.connect(&addr)
            .await
            .with_context(|| format!("connecting {}", addr))?;

        arg.rec.record(Record::PacketInfo(PacketInfo {
            time: chrono::Utc::now(),
            node: arg.rec.node().to_string(),
            flow: self.flow.clone(),
            side: Side::Client,
            addr: addr.clone(),
        }));

        let start = Instant::now();
        let deadline = start + duration;
        let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_millis(1)));
        let mut seq: u64 = 0;
        let mut out = vec![0u8; self.length.max(PROBE_LEN)];
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = arg.ctx.canceled() => return Err(anyhow!("context canceled")),
                _ = ticker.tick() => {
                    let probe = Probe { seq, sent_ns: start.elapsed().as_nanos() as u64 };
                    let header = bincode::serialize(&probe)?;
                    out[..header.len()].copy_from_slice(&header);
                    let _ = sock.send(&out).await;
                    seq += 1;
                }
                res = sock.recv(&mut buf) => {
                    if let Ok(n) = res {
                        if n >= PROBE_LEN {
                            if let Ok(probe) = bincode::deserialize::<Probe>(&buf[..PROBE_LEN]) {
                                let now_ns = start.elapsed().as_nanos() as u64;
                                arg.rec.record(Record::PacketSample(PacketSample {
                                    time: chrono::Utc::now(),
                                    node: arg.rec.node().to_string(),
                                    flow: self.flow.clone(),
                                    seq: probe.seq,
                                    rtt_ns: now_ns.saturating_sub(probe.sent_ns),
                                }));
                            }
                        }
                    }
                }
            }
        }
        Ok(Feedback::new())
    }

    fn validate(&self) -> Result<()> {
        crate::cli::parse_duration(&self.duration)
            .map_err(|e| anyhow!("packet client duration {:?}: {}", self.duration, e))?;
        crate::cli::parse_duration(&self.interval)
            .map_err(|e| anyhow!("packet client interval {:?}: {}", self.interval, e))?;
        if self.flow.is_empty() {
            return Err(anyhow!("packet client: flow must not be empty"));
        }
        Ok(())
    }
}
