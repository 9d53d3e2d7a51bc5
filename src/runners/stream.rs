//! Stream-oriented (TCP) traffic runners.
//!
//! The server binds, publishes its bound address into feedback under a
//! configurable key, and keeps serving in the background until its canceler
//! fires; the client, started after it in the same subtree, looks the
//! address up and writes for a configured duration. Both ends emit a
//! `StreamInfo` marker and periodic `StreamSample` goodput records tagged
//! with the flow id, and authenticate the flow with the process-global key.

use super::Runner;
use crate::defaults;
use crate::record::{Record, Side, StreamInfo, StreamSample};
use crate::run::{Arg, Canceler, Feedback};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
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
    "stream".to_string()
}

/// Accept stream connections and count inbound bytes, sampling goodput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamServer {
    /// Listen address; port 0 binds an ephemeral port
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Feedback key under which the bound address is published
    #[serde(default = "default_addr_key")]
    pub addr_key: String,

    /// Flow identifier tagging this session's records
    #[serde(default = "default_flow")]
    pub flow: String,
}

impl Default for StreamServer {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            addr_key: default_addr_key(),
            flow: default_flow(),
        }
    }
}

#[async_trait]
impl Runner for StreamServer {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .with_context(|| format!("binding {}", self.listen))?;
        let addr = listener.local_addr()?;
        debug!(flow = %self.flow, "stream server listening on {}", addr);

        arg.rec.record(Record::StreamInfo(StreamInfo {
            time: chrono::Utc::now(),
            node: arg.rec.node().to_string(),
            flow: self.flow.clone(),
            side: Side::Server,
            addr: addr.to_string(),
        }));

        // Serve in the background; the canceler (or node cancel) stops us.
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let rec = arg.rec.clone();
        let flow = self.flow.clone();
        let ctx = arg.ctx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ctx.canceled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, _)) => {
                            let rec = rec.clone();
                            let flow = flow.clone();
                            tokio::spawn(serve_stream(stream, rec, flow));
                        }
                        Err(e) => {
                            debug!("stream accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });
        let _ = arg.cancelers.send(Canceler::new("stream server", move || {
            let _ = stop_tx.send(true);
            Ok(())
        }));

        let mut fb = Feedback::new();
        fb.insert(self.addr_key.clone(), serde_json::json!(addr.to_string()));
        Ok(fb)
    }

    fn validate(&self) -> Result<()> {
        if self.flow.is_empty() {
            return Err(anyhow!("stream server: flow must not be empty"));
        }
        Ok(())
    }
}

async fn serve_stream(mut stream: TcpStream, rec: crate::record::Recorder, flow: String) {
    match read_key(&mut stream).await {
        Ok(got) => {
            if let Some(expect) = super::key() {
                if got != expect {
                    rec.record(Record::Error(crate::record::ErrorRecord::new(
                        rec.node(),
                        "stream_server",
                        format!("flow {}: peer key mismatch", flow),
                    )));
                    return;
                }
            }
        }
        Err(e) => {
            debug!(flow = %flow, "stream handshake failed: {}", e);
            return;
        }
    }

    let start = Instant::now();
    let mut last_sample = start;
    let mut total: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total += n as u64;
                if last_sample.elapsed() >= defaults::SAMPLE_INTERVAL {
                    last_sample = Instant::now();
                    sample(&rec, &flow, total, start);
                }
            }
        }
    }
    sample(&rec, &flow, total, start);
}

/// Connect to the address published in feedback and write for a configured
/// duration (or byte count), sampling goodput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamClient {
    /// Feedback key the server's address is looked up under
    #[serde(default = "default_addr_key")]
    pub addr_key: String,

    /// How long to transmit
    pub duration: String,

    /// Stop after this many bytes, if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    /// Flow identifier tagging this session's records
    #[serde(default = "default_flow")]
    pub flow: String,
}

impl StreamClient {
    pub fn new(duration: &str) -> Self {
        Self {
            addr_key: default_addr_key(),
            duration: duration.to_string(),
            length: None,
            flow: default_flow(),
        }
    }
}

#[async_trait]
impl Runner for StreamClient {
    async fn run(&self, arg: &mut Arg) -> Result<Feedback> {
        let duration = crate::cli::parse_duration(&self.duration).map_err(|e| anyhow!(e))?;
        let addr = arg
            .feedback
            .get(&self.addr_key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("feedback key {:?} not set", self.addr_key))?
            .to_string();

        let mut stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connecting {}", addr))?;
        tune_socket(&stream);
        write_key(&mut stream, super::key().as_deref().unwrap_or("")).await?;

        arg.rec.record(Record::StreamInfo(StreamInfo {
            time: chrono::Utc::now(),
            node: arg.rec.node().to_string(),
            flow: self.flow.clone(),
            side: Side::Client,
            addr: addr.clone(),
        }));

        let chunk = vec![0u8; 64 * 1024];
        let start = Instant::now();
        let deadline = start + duration;
        let mut last_sample = start;
        let mut total: u64 = 0;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            if let Some(limit) = self.length {
                if total >= limit {
                    break;
                }
            }
            let want = match self.length {
                Some(limit) => ((limit - total) as usize).min(chunk.len()),
                None => chunk.len(),
            };
            tokio::select! {
                res = stream.write(&chunk[..want]) => {
                    let n = res.with_context(|| format!("writing to {}", addr))?;
                    total += n as u64;
                    if last_sample.elapsed() >= defaults::SAMPLE_INTERVAL {
                        last_sample = Instant::now();
                        sample(&arg.rec, &self.flow, total, start);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
                _ = arg.ctx.canceled() => {
                    sample(&arg.rec, &self.flow, total, start);
                    return Err(anyhow!("context canceled"));
                }
            }
        }
        stream.shutdown().await.ok();
        sample(&arg.rec, &self.flow, total, start);
        Ok(Feedback::new())
    }

    fn validate(&self) -> Result<()> {
        crate::cli::parse_duration(&self.duration)
            .map_err(|e| anyhow!("stream client duration {:?}: {}", self.duration, e))?;
        if self.flow.is_empty() {
            return Err(anyhow!("stream client: flow must not be empty"));
        }
        Ok(())
    }
}

fn sample(rec: &crate::record::Recorder, flow: &str, bytes: u64, start: Instant) {
    rec.record(Record::StreamSample(StreamSample {
        time: chrono::Utc::now(),
        node: rec.node().to_string(),
        flow: flow.to_string(),
        bytes,
        elapsed_ns: start.elapsed().as_nanos() as u64,
    }));
}

fn tune_socket(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_nodelay(true);
    let _ = sock.set_send_buffer_size(256 * 1024);
    let _ = sock.set_recv_buffer_size(256 * 1024);
}

async fn write_key(stream: &mut TcpStream, key: &str) -> Result<()> {
    let bytes = key.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(anyhow!("key too long"));
    }
    stream.write_all(&(bytes.len() as u16).to_le_bytes()).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

async fn read_key(stream: &mut TcpStream) -> Result<String> {
    let mut len_bytes = [0u8; 2];
    stream.read_exact(&mut len_bytes).await?;
    let len = u16::from_le_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::TestArg;
    use super::super::Runners;
    use super::*;
    use crate::message::Message;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn server_publishes_addr_and_client_transfers() {
        let mut t = TestArg::new();
        t.arg.rec.stream(crate::filter::StreamFilter::all());

        let fb = Runners::stream_server(StreamServer::default())
            .run(&mut t.arg)
            .await
            .unwrap();
        let addr = fb[defaults::ADDR_KEY].as_str().unwrap().to_string();
        assert!(addr.contains(':'));

        let mut client = StreamClient::new("80ms");
        client.length = Some(256 * 1024);
        t.arg.feedback = fb;
        Runners::stream_client(client).run(&mut t.arg).await.unwrap();

        // Expect info markers for both sides and at least one sample with
        // nonzero bytes.
        let mut sides = Vec::new();
        let mut bytes = 0u64;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while (sides.len() < 2 || bytes == 0) && tokio::time::Instant::now() < deadline {
            let m = match timeout(Duration::from_millis(500), t.wire.recv()).await {
                Ok(Some(m)) => m,
                _ => break,
            };
            match m {
                Message::Record(Record::StreamInfo(i)) => sides.push(i.side),
                Message::Record(Record::StreamSample(s)) => bytes = bytes.max(s.bytes),
                _ => {}
            }
        }
        assert!(sides.contains(&Side::Client));
        assert!(sides.contains(&Side::Server));
        assert!(bytes > 0);

        t.run_cancelers();
    }

    #[tokio::test]
    async fn client_fails_without_published_addr() {
        let mut t = TestArg::new();
        let err = Runners::stream_client(StreamClient::new("10ms"))
            .run(&mut t.arg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("addr"));
    }

    #[test]
    fn validation_checks_duration_and_flow() {
        assert!(StreamClient::new("10ms").validate().is_ok());
        assert!(StreamClient::new("oops").validate().is_err());
        let mut s = StreamServer::default();
        s.flow.clear();
        assert!(s.validate().is_err());
    }
}
