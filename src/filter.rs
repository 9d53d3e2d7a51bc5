//! # Result Stream Filter
//!
//! A connection normally buffers test records until end of test, then flushes
//! them upward with the terminal message so the controller receives the
//! complete record even on abort. Installing a stream filter changes that:
//! records matching the filter are transmitted as they are produced, which is
//! what live-monitoring front ends use to watch a test in flight.
//!
//! The filter is a runtime-installable value; the result-stream runner ships
//! one to each node it should apply to. Installation replaces the current
//! filter and re-evaluates the buffered backlog in original order.

use crate::record::Record;
use serde::{Deserialize, Serialize};

/// One rule set: which records to accept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Glob patterns matched against file-data names
    #[serde(default)]
    pub file: Vec<String>,

    /// Accept log entries
    #[serde(default)]
    pub log: bool,

    /// Flow identifiers whose traffic info and samples are accepted
    #[serde(default)]
    pub flows: Vec<String>,

    /// Accept everything
    #[serde(default)]
    pub all: bool,
}

impl FilterRule {
    fn matches(&self, r: &Record) -> bool {
        if self.all {
            return true;
        }
        match r {
            Record::Log(_) => self.log,
            Record::File(f) => self.file.iter().any(|p| glob_matches(p, &f.name)),
            Record::StreamInfo(i) => self.flows.iter().any(|f| f == &i.flow),
            Record::StreamSample(s) => self.flows.iter().any(|f| f == &s.flow),
            Record::PacketInfo(i) => self.flows.iter().any(|f| f == &i.flow),
            Record::PacketSample(s) => self.flows.iter().any(|f| f == &s.flow),
            _ => false,
        }
    }
}

/// The installed filter: an accept rule set plus an optional exclude rule set
/// that carves exceptions out of the accepted records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamFilter {
    pub accept: FilterRule,

    #[serde(default)]
    pub exclude: Option<FilterRule>,
}

impl StreamFilter {
    /// A filter that streams everything immediately.
    pub fn all() -> Self {
        Self {
            accept: FilterRule {
                all: true,
                ..Default::default()
            },
            exclude: None,
        }
    }

    /// Whether `r` should be streamed now rather than buffered.
    pub fn accepts(&self, r: &Record) -> bool {
        if !self.accept.matches(r) {
            return false;
        }
        match &self.exclude {
            Some(x) => !x.matches(r),
            None => true,
        }
    }
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(name),
        Err(_) => pattern == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataPoint, FileData, LogEntry, StreamSample};
    use chrono::Utc;

    fn sample(flow: &str) -> Record {
        Record::StreamSample(StreamSample {
            time: Utc::now(),
            node: "n".into(),
            flow: flow.into(),
            bytes: 1,
            elapsed_ns: 1,
        })
    }

    #[test]
    fn empty_filter_accepts_nothing() {
        let f = StreamFilter::default();
        assert!(!f.accepts(&Record::Log(LogEntry::new("n", "t", "x"))));
        assert!(!f.accepts(&sample("f1")));
    }

    #[test]
    fn accept_all_streams_everything() {
        let f = StreamFilter::all();
        assert!(f.accepts(&Record::Log(LogEntry::new("n", "t", "x"))));
        assert!(f.accepts(&sample("f1")));
        assert!(f.accepts(&Record::Data(DataPoint::new("n", "s", serde_json::json!(1)))));
    }

    #[test]
    fn file_globs_match_names() {
        let f = StreamFilter {
            accept: FilterRule {
                file: vec!["*.pcap".into()],
                ..Default::default()
            },
            exclude: None,
        };
        assert!(f.accepts(&Record::File(FileData::new("n", "eth0.pcap", vec![]))));
        assert!(!f.accepts(&Record::File(FileData::new("n", "out.txt", vec![]))));
    }

    #[test]
    fn flows_select_traffic_records() {
        let f = StreamFilter {
            accept: FilterRule {
                flows: vec!["dl".into()],
                ..Default::default()
            },
            exclude: None,
        };
        assert!(f.accepts(&sample("dl")));
        assert!(!f.accepts(&sample("ul")));
    }

    #[test]
    fn exclude_carves_out_of_accept() {
        let f = StreamFilter {
            accept: FilterRule {
                all: true,
                ..Default::default()
            },
            exclude: Some(FilterRule {
                log: true,
                ..Default::default()
            }),
        };
        assert!(!f.accepts(&Record::Log(LogEntry::new("n", "t", "x"))));
        assert!(f.accepts(&sample("f1")));
    }
}
