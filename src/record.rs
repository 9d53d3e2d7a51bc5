//! # Tagged Records
//!
//! Records are the measurement and diagnostic output of a test: log entries,
//! data points, file chunks, traffic info and samples, and errors. Every
//! record carries a timestamp and the id of the node that produced it, so the
//! controller can reconstruct the full per-node history after records from
//! the whole fleet are interleaved.
//!
//! Records travel upward: a runner hands them to its [`Recorder`], which
//! writes them to the node's parent connection; intermediary nodes see the
//! `Forward` flag and relay them toward the controller unchanged.

use crate::conn::Conn;
use crate::filter::StreamFilter;
use crate::message::{Flags, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which end of a traffic flow a runner implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Client,
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// A line of log output from a runner or node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub node: String,
    pub tag: String,
    pub text: String,
}

impl LogEntry {
    pub fn new(node: &str, tag: &str, text: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            node: node.to_string(),
            tag: tag.to_string(),
            text: text.into(),
        }
    }
}

/// A chunk of a named file captured on a node (for example, the stdout of a
/// system command). Chunks for the same name are concatenated in arrival
/// order by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    pub time: DateTime<Utc>,
    pub node: String,
    pub name: String,
    pub data: Vec<u8>,
}

impl FileData {
    pub fn new(node: &str, name: &str, data: Vec<u8>) -> Self {
        Self {
            time: Utc::now(),
            node: node.to_string(),
            name: name.to_string(),
            data,
        }
    }
}

/// A single measurement in a named series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub time: DateTime<Utc>,
    pub node: String,
    pub series: String,
    pub value: serde_json::Value,
}

impl DataPoint {
    pub fn new(node: &str, series: &str, value: serde_json::Value) -> Self {
        Self {
            time: Utc::now(),
            node: node.to_string(),
            series: series.to_string(),
            value,
        }
    }
}

/// Start-of-flow marker for a stream (TCP) traffic session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub time: DateTime<Utc>,
    pub node: String,
    pub flow: String,
    pub side: Side,
    pub addr: String,
}

/// Periodic goodput sample for a stream flow: total bytes transferred at
/// `elapsed_ns` since the flow began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSample {
    pub time: DateTime<Utc>,
    pub node: String,
    pub flow: String,
    pub bytes: u64,
    pub elapsed_ns: u64,
}

/// Start-of-flow marker for a packet (UDP) traffic session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketInfo {
    pub time: DateTime<Utc>,
    pub node: String,
    pub flow: String,
    pub side: Side,
    pub addr: String,
}

/// Per-probe round-trip sample for a packet flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketSample {
    pub time: DateTime<Utc>,
    pub node: String,
    pub flow: String,
    pub seq: u64,
    pub rtt_ns: u64,
}

/// Host facts collected by the system-info runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysInfoData {
    pub time: DateTime<Utc>,
    pub node: String,
    pub hostname: String,
    pub platform: String,
    pub cpus: usize,
    pub kernel: String,
}

/// An error observed on a node, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub time: DateTime<Utc>,
    pub node: String,
    pub tag: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(node: &str, tag: &str, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            node: node.to_string(),
            tag: tag.to_string(),
            message: message.into(),
        }
    }
}

/// The union of record kinds that flow toward the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Log(LogEntry),
    File(FileData),
    Data(DataPoint),
    StreamInfo(StreamInfo),
    StreamSample(StreamSample),
    PacketInfo(PacketInfo),
    PacketSample(PacketSample),
    SysInfo(SysInfoData),
    Error(ErrorRecord),
}

impl Record {
    /// Id of the node that produced the record.
    pub fn node(&self) -> &str {
        match self {
            Record::Log(r) => &r.node,
            Record::File(r) => &r.node,
            Record::Data(r) => &r.node,
            Record::StreamInfo(r) => &r.node,
            Record::StreamSample(r) => &r.node,
            Record::PacketInfo(r) => &r.node,
            Record::PacketSample(r) => &r.node,
            Record::SysInfo(r) => &r.node,
            Record::Error(r) => &r.node,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Record::Log(r) => r.time,
            Record::File(r) => r.time,
            Record::Data(r) => r.time,
            Record::StreamInfo(r) => r.time,
            Record::StreamSample(r) => r.time,
            Record::PacketInfo(r) => r.time,
            Record::PacketSample(r) => r.time,
            Record::SysInfo(r) => r.time,
            Record::Error(r) => r.time,
        }
    }

    /// Errors push through buffering; everything else may be held back by the
    /// stream filter until end of test. All records forward at intermediaries.
    pub fn flags(&self) -> Flags {
        match self {
            Record::Error(_) => Flags::PUSH | Flags::FORWARD,
            _ => Flags::FORWARD,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = |n: &str| if n.is_empty() { "-".to_string() } else { n.to_string() };
        match self {
            Record::Log(r) => write!(f, "[{}] {}: {}", node(&r.node), r.tag, r.text),
            Record::File(r) => {
                write!(f, "[{}] file {} ({} bytes)", node(&r.node), r.name, r.data.len())
            }
            Record::Data(r) => write!(f, "[{}] {} = {}", node(&r.node), r.series, r.value),
            Record::StreamInfo(r) => {
                write!(f, "[{}] stream {} {} at {}", node(&r.node), r.flow, r.side, r.addr)
            }
            Record::StreamSample(r) => write!(
                f,
                "[{}] stream {} {} bytes at {} ns",
                node(&r.node),
                r.flow,
                r.bytes,
                r.elapsed_ns
            ),
            Record::PacketInfo(r) => {
                write!(f, "[{}] packet {} {} at {}", node(&r.node), r.flow, r.side, r.addr)
            }
            Record::PacketSample(r) => write!(
                f,
                "[{}] packet {} seq {} rtt {} ns",
                node(&r.node),
                r.flow,
                r.seq,
                r.rtt_ns
            ),
            Record::SysInfo(r) => write!(
                f,
                "[{}] sysinfo {} {} {} cpus",
                node(&r.node),
                r.hostname,
                r.platform,
                r.cpus
            ),
            Record::Error(r) => write!(f, "[{}] error {}: {}", node(&r.node), r.tag, r.message),
        }
    }
}

/// Handle given to runners for producing tagged records.
///
/// Cloneable and cheap; writes go to the owning node's parent connection,
/// where the stream filter decides between immediate transmission and
/// buffering until end of test.
#[derive(Clone)]
pub struct Recorder {
    node: String,
    conn: Conn,
}

impl Recorder {
    pub fn new(node: impl Into<String>, conn: Conn) -> Self {
        Self {
            node: node.into(),
            conn,
        }
    }

    /// Id of the node this recorder tags records with.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Emit a log entry.
    pub fn log(&self, tag: &str, text: impl Into<String>) {
        self.record(Record::Log(LogEntry::new(&self.node, tag, text)));
    }

    /// Emit a data point.
    pub fn data(&self, series: &str, value: serde_json::Value) {
        self.record(Record::Data(DataPoint::new(&self.node, series, value)));
    }

    /// Emit a file chunk.
    pub fn file(&self, name: &str, data: Vec<u8>) {
        self.record(Record::File(FileData::new(&self.node, name, data)));
    }

    /// Emit an arbitrary record.
    pub fn record(&self, r: Record) {
        self.conn.send(Message::Record(r));
    }

    /// Install (or replace) the result stream filter on the upward direction.
    pub fn stream(&self, filter: StreamFilter) {
        self.conn.stream(filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_carry_node_and_flags() {
        let r = Record::Log(LogEntry::new("n2", "sys", "started"));
        assert_eq!(r.node(), "n2");
        assert_eq!(r.flags(), Flags::FORWARD);

        let e = Record::Error(ErrorRecord::new("n2", "io", "broken pipe"));
        assert!(e.flags().contains(Flags::PUSH));
        assert!(e.flags().contains(Flags::FORWARD));
    }

    #[test]
    fn display_is_single_line() {
        let r = Record::Data(DataPoint::new("a", "rtt", serde_json::json!(42)));
        let s = format!("{}", r);
        assert!(s.contains("rtt"));
        assert!(!s.contains('\n'));

        let root = Record::Log(LogEntry::new("", "run", "x"));
        assert!(format!("{}", root).starts_with("[-]"));
    }
}
