//! Userspace type definitions
//!
//! Defines the data structures flowing between the table scanner, the
//! histogram aggregator and the collector.

use serde::Serialize;

/// Kind of a declared metric. Collection dispatches on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter, one sample per decoded label set
    Counter,
    /// Cumulative histogram; the last label of every row is the bucket
    /// boundary
    Histogram,
}

impl MetricKind {
    /// Lowercase name used in log messages
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// A raw row of a kernel map table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableEntry {
    /// Key bytes as stored in the map
    pub key: Vec<u8>,
    /// Value, read as a host-order 64-bit counter
    pub value: u64,
}

/// A decoded row of a kernel map table
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct MetricValueRow {
    /// Raw key, hex encoded
    pub raw: String,
    /// Label values decoded from the key, in declaration order
    pub labels: Vec<String>,
    /// Counter value
    pub value: u64,
}

/// Raw contents of one declared table of one attached process
#[derive(Serialize, Clone, Debug)]
pub struct TableDump {
    /// Program the table belongs to
    pub program: String,
    /// Process the module is attached to
    pub pid: i32,
    /// Table name
    pub table: String,
    /// Decoded rows
    pub rows: Vec<MetricValueRow>,
}

/// Lowercase hex encoding of a byte string
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
