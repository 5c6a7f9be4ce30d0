//! Exporter configuration
//!
//! Programs are declared in a YAML file loaded once at startup. Each program
//! carries its instrumentation source, the probes to enable, the binary to
//! attach to and the metrics read back from its tables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use crate::types::MetricKind;

/// Top-level configuration file
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Instrumentation programs to attach
    pub programs: Vec<Program>,
}

/// One instrumentation program
#[derive(Deserialize, Debug, Clone)]
pub struct Program {
    /// Unique program name, exported as the `name` label of the info gauge
    pub name: String,

    /// C source of the instrumentation, compiled once per attached process
    #[serde(default)]
    pub code: String,

    /// Extra compiler flags
    #[serde(default)]
    pub cflags: Vec<String>,

    /// USDT probe spec (`name` or `provider:name`) to function name
    #[serde(default)]
    pub usdt: BTreeMap<String, String>,

    /// Symbol spec (`symbol` or `path:symbol`) to function name
    #[serde(default)]
    pub uprobes: BTreeMap<String, String>,

    /// Symbol spec (`symbol` or `path:symbol`) to function name, run on
    /// function return
    #[serde(default)]
    pub uretprobes: BTreeMap<String, String>,

    /// Which processes to attach to
    pub attachment: Attachment,

    /// Metrics read from the program's tables
    #[serde(default)]
    pub metrics: Metrics,
}

/// Process selector
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Attachment {
    /// Command name of the processes to attach to
    pub binary_name: String,
}

/// Declared metrics of a program
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Metrics {
    #[serde(default)]
    pub counters: Vec<Metric>,
    #[serde(default)]
    pub histograms: Vec<Metric>,
}

/// A metric backed by one kernel table
#[derive(Deserialize, Debug, Clone)]
pub struct Metric {
    /// Metric name, prefixed with the exporter namespace on exposition
    pub name: String,
    /// Help text
    #[serde(default)]
    pub help: String,
    /// Table holding the metric's values
    pub table: String,
    /// Labels packed into the table key, in key order
    #[serde(default)]
    pub labels: Vec<Label>,
}

/// A label packed into a table key
#[derive(Deserialize, Debug, Clone)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Bytes of the key holding the label
    pub size: usize,
    /// Bytes skipped after the label
    #[serde(default)]
    pub padding: usize,
    /// Decoder chain run over the label bytes
    #[serde(default)]
    pub decoders: Vec<Decoder>,
}

/// A label decoder and its settings
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Decoder {
    /// Host-order unsigned integer to decimal
    Uint,
    /// NUL-terminated string
    String,
    /// Lookup table
    StaticMap {
        static_map: BTreeMap<String, String>,
        #[serde(default)]
        allow_unknown: bool,
    },
    /// Keep rows matching any of the patterns, skip the rest
    Regexp { regexps: Vec<String> },
    /// IPv4 or IPv6 address
    InetIp,
    /// Lowercase hex
    Hex,
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_yaml(&text).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse and validate a configuration document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut program_names = HashSet::new();
        let mut metric_names = HashSet::new();

        for program in &self.programs {
            if program.name.is_empty() {
                bail!("program with empty name");
            }
            if !program_names.insert(program.name.as_str()) {
                bail!("duplicate program name: {}", program.name);
            }
            if program.attachment.binary_name.is_empty() {
                bail!("program {}: empty attachment binary_name", program.name);
            }

            for (kind, metric) in program.metrics() {
                // Metrics of all programs share one namespace on exposition
                if !metric_names.insert(metric.name.as_str()) {
                    bail!(
                        "program {}: duplicate metric name: {}",
                        program.name,
                        metric.name
                    );
                }
                if kind == MetricKind::Histogram && metric.labels.is_empty() {
                    bail!(
                        "program {}: histogram {} needs a bucket label",
                        program.name,
                        metric.name
                    );
                }
                for label in &metric.labels {
                    if label.size == 0 {
                        bail!(
                            "program {}: label {} of {} has zero size",
                            program.name,
                            label.name,
                            metric.name
                        );
                    }
                    if label.decoders.is_empty() {
                        bail!(
                            "program {}: label {} of {} has no decoders",
                            program.name,
                            label.name,
                            metric.name
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

impl Program {
    /// Every declared metric tagged with its kind, counters first
    pub fn metrics(&self) -> impl Iterator<Item = (MetricKind, &Metric)> {
        self.metrics
            .counters
            .iter()
            .map(|m| (MetricKind::Counter, m))
            .chain(
                self.metrics
                    .histograms
                    .iter()
                    .map(|m| (MetricKind::Histogram, m)),
            )
    }
}
