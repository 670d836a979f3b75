//! Measurements handed to an external metrics sink.
//!
//! The proxy only produces [`Metric`] values. Storage and aggregation belong
//! to whatever implements [`MetricsSink`], which must not block the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use tokio::sync::mpsc;

/// Names of the measurements emitted by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    /// Connection lifecycle and cached connection counts.
    Connection,
    /// One DNS lookup.
    Dns,
    /// One SIP message in or out.
    SipMessage,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Connection => "connection",
            MetricName::Dns => "dns",
            MetricName::SipMessage => "sipMessage",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        FieldValue::Int(value as i64)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Int(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

/// One measurement with its tags and fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: MetricName,
    pub tags: BTreeMap<&'static str, String>,
    pub fields: BTreeMap<&'static str, FieldValue>,
    pub time: SystemTime,
}

impl Metric {
    pub fn new(name: MetricName) -> Self {
        Self {
            name,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time: SystemTime::now(),
        }
    }

    pub fn tag(mut self, name: &'static str, value: impl ToString) -> Self {
        self.tags.insert(name, value.to_string());
        self
    }

    pub fn field(mut self, name: &'static str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name, value.into());
        self
    }
}

/// Receives the measurements.
pub trait MetricsSink: Send + Sync {
    /// Records `metric`. Must return without waiting.
    fn emit(&self, metric: Metric);
}

/// Drops every metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn emit(&self, _metric: Metric) {}
}

/// Forwards metrics to a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Metric>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Metric>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl MetricsSink for ChannelSink {
    fn emit(&self, metric: Metric) {
        if let Err(err) = self.tx.try_send(metric) {
            log::trace!("Metric dropped: {}", err);
        }
    }
}
