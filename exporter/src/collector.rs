//! Program registry and metrics collector
//!
//! The [`Exporter`] attaches every configured program to every process
//! running its target binary, then serves as a Prometheus collector that
//! reads the programs' tables on each scrape.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use prometheus::{
    core::{Collector, Desc},
    proto::{self, MetricFamily, MetricType},
};
use usdt_common::{PID_LABEL, PROMETHEUS_NAMESPACE};

use crate::{
    config::{Config, Metric, Program},
    context::{ContextError, ProbeContext},
    decoder::DecoderSet,
    histogram::{aggregate, CumulativeHistogram},
    process::ProcessLocator,
    runtime::{Module, Runtime},
    scanner::table_values,
    types::{MetricKind, MetricValueRow, TableDump},
};

/// A program attached to one process
struct AttachmentRecord<R: Runtime> {
    /// Index into the configured programs
    program: usize,
    pid: i32,
    context: ProbeContext<R>,
}

/// Descriptor of one declared metric
struct MetricDescriptor {
    program: usize,
    kind: MetricKind,
    metric: Metric,
    fq_name: String,
    help: String,
    /// Variable label names, `pid` last
    label_names: Vec<String>,
    desc: Desc,
}

/// Descriptors of everything the exporter exposes, built once
struct Descriptors {
    enabled_programs: Desc,
    metrics: Vec<MetricDescriptor>,
}

/// Attached programs and their metrics
pub struct Exporter<R: Runtime> {
    config: Config,
    runtime: Arc<R>,
    locator: ProcessLocator,
    decoders: DecoderSet,
    descriptors: Descriptors,
    attachments: Vec<AttachmentRecord<R>>,
}

fn fq_name(name: &str) -> String {
    format!("{}_{}", PROMETHEUS_NAMESPACE, name)
}

impl Descriptors {
    fn build(config: &Config) -> Result<Self> {
        let enabled_programs = Desc::new(
            fq_name("enabled_programs"),
            "The set of enabled programs".to_string(),
            vec!["name".to_string(), PID_LABEL.to_string()],
            HashMap::new(),
        )
        .context("Failed to build enabled_programs descriptor")?;

        let mut metrics = Vec::new();
        for (index, program) in config.programs.iter().enumerate() {
            for (kind, metric) in program.metrics() {
                let mut label_names: Vec<String> =
                    metric.labels.iter().map(|l| l.name.clone()).collect();
                if kind == MetricKind::Histogram {
                    // The bucket boundary becomes `le`
                    label_names.pop();
                }
                label_names.push(PID_LABEL.to_string());

                let fq_name = fq_name(&metric.name);
                let help = if metric.help.is_empty() {
                    format!("{} read from table {}", kind.as_str(), metric.table)
                } else {
                    metric.help.clone()
                };
                let desc = Desc::new(
                    fq_name.clone(),
                    help.clone(),
                    label_names.clone(),
                    HashMap::new(),
                )
                .with_context(|| {
                    format!(
                        "Invalid {} {} in program {}",
                        kind.as_str(),
                        metric.name,
                        program.name
                    )
                })?;

                metrics.push(MetricDescriptor {
                    program: index,
                    kind,
                    metric: metric.clone(),
                    fq_name,
                    help,
                    label_names,
                    desc,
                });
            }
        }

        Ok(Self {
            enabled_programs,
            metrics,
        })
    }
}

impl<R: Runtime> Exporter<R> {
    /// Create an exporter for `config`. Nothing is attached yet.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `runtime` - Runtime compiling and loading the instrumentation
    /// * `locator` - Process table used to find target processes
    pub fn new(config: Config, runtime: Arc<R>, locator: ProcessLocator) -> Result<Self> {
        let decoders = DecoderSet::new(&config).context("Invalid label decoders")?;
        let descriptors = Descriptors::build(&config)?;

        Ok(Self {
            config,
            runtime,
            locator,
            decoders,
            descriptors,
            attachments: Vec::new(),
        })
    }

    /// Attach every program to every process running its binary.
    ///
    /// All or nothing: on the first failure every context attached so far
    /// is closed and the error returned.
    pub fn attach(&mut self) -> Result<()> {
        info!("Attaching {} programs...", self.config.programs.len());

        if let Err(e) = self.attach_programs() {
            self.close();
            return Err(e);
        }

        info!(
            "All programs attached ({} process attachments)",
            self.attachments.len()
        );
        Ok(())
    }

    fn attach_programs(&mut self) -> Result<()> {
        for (index, program) in self.config.programs.iter().enumerate() {
            let binary = &program.attachment.binary_name;
            let processes = self
                .locator
                .find_by_binary_name(binary)
                .with_context(|| format!("Failed to list processes for program {}", program.name))?;
            if processes.is_empty() {
                bail!("no process found for binary {} (program {})", binary, program.name);
            }

            for process in processes {
                let context = attach_process(&self.runtime, &self.locator, program, process.pid)
                    .with_context(|| {
                        format!("Failed to attach program {} to pid {}", program.name, process.pid)
                    })?;
                info!(
                    "  ✓ Attached {} to {} (pid {})",
                    program.name, process.comm, process.pid
                );
                self.attachments.push(AttachmentRecord {
                    program: index,
                    pid: process.pid,
                    context,
                });
            }
        }
        Ok(())
    }

    /// (program name, pid) of every attachment
    pub fn attachments(&self) -> Vec<(&str, i32)> {
        self.attachments
            .iter()
            .map(|r| (self.config.programs[r.program].name.as_str(), r.pid))
            .collect()
    }

    /// Detach everything, most recent attachment first. Idempotent.
    pub fn close(&mut self) {
        if self.attachments.is_empty() {
            return;
        }

        info!("Detaching {} probe contexts...", self.attachments.len());
        while let Some(mut record) = self.attachments.pop() {
            record.context.close();
            debug!("Detached pid {}", record.pid);
        }
    }

    /// Raw rows of every declared table of every attachment
    pub fn table_dump(&self) -> Result<Vec<TableDump>> {
        let mut dumps = Vec::new();

        for record in &self.attachments {
            let Some(module) = record.context.module() else {
                continue;
            };
            let program = &self.config.programs[record.program];

            for (_, metric) in program.metrics() {
                let rows = table_values(module, &metric.table, &metric.labels, &self.decoders)
                    .with_context(|| {
                        format!(
                            "Failed to dump {} of program {} (pid {})",
                            metric.table, program.name, record.pid
                        )
                    })?;
                dumps.push(TableDump {
                    program: program.name.clone(),
                    pid: record.pid,
                    table: metric.table.clone(),
                    rows,
                });
            }
        }

        Ok(dumps)
    }

    fn enabled_programs_family(&self) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(self.descriptors.enabled_programs.fq_name.clone());
        family.set_help(self.descriptors.enabled_programs.help.clone());
        family.set_field_type(MetricType::GAUGE);

        let names = &self.descriptors.enabled_programs.variable_labels;
        for record in &self.attachments {
            let values = [
                self.config.programs[record.program].name.clone(),
                record.pid.to_string(),
            ];
            let mut gauge = proto::Gauge::default();
            gauge.set_value(1.0);

            let mut metric = proto::Metric::default();
            set_labels(&mut metric, names, &values);
            metric.set_gauge(gauge);
            family.mut_metric().push(metric);
        }

        family
    }

    fn collect_metric(&self, descriptor: &MetricDescriptor) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(descriptor.fq_name.clone());
        family.set_help(descriptor.help.clone());
        family.set_field_type(match descriptor.kind {
            MetricKind::Counter => MetricType::COUNTER,
            MetricKind::Histogram => MetricType::HISTOGRAM,
        });

        for record in self
            .attachments
            .iter()
            .filter(|r| r.program == descriptor.program)
        {
            let Some(module) = record.context.module() else {
                continue;
            };
            let pid = record.pid.to_string();

            let rows = match table_values(
                module,
                &descriptor.metric.table,
                &descriptor.metric.labels,
                &self.decoders,
            ) {
                Ok(rows) => rows,
                Err(e) => {
                    error!(
                        "Failed to read {} for pid {}: {:#}",
                        descriptor.fq_name, record.pid, e
                    );
                    continue;
                }
            };

            match descriptor.kind {
                MetricKind::Counter => {
                    for (mut values, value) in merge_counters(rows) {
                        values.push(pid.clone());
                        family
                            .mut_metric()
                            .push(counter_metric(&descriptor.label_names, &values, value));
                    }
                }
                MetricKind::Histogram => match aggregate(&rows) {
                    Ok(histograms) => {
                        for histogram in histograms {
                            family.mut_metric().push(histogram_metric(
                                &descriptor.label_names,
                                &pid,
                                histogram,
                            ));
                        }
                    }
                    Err(e) => error!(
                        "Failed to aggregate {} for pid {}: {}",
                        descriptor.fq_name, record.pid, e
                    ),
                },
            }
        }

        family
    }
}

impl<R: Runtime> Drop for Exporter<R> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<R: Runtime> Collector for Exporter<R> {
    fn desc(&self) -> Vec<&Desc> {
        std::iter::once(&self.descriptors.enabled_programs)
            .chain(self.descriptors.metrics.iter().map(|m| &m.desc))
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        std::iter::once(self.enabled_programs_family())
            .chain(self.descriptors.metrics.iter().map(|d| self.collect_metric(d)))
            .filter(|family| !family.get_metric().is_empty())
            .collect()
    }
}

/// Take a fresh context for `pid` through open, enable, compile and attach
fn attach_process<R: Runtime>(
    runtime: &Arc<R>,
    locator: &ProcessLocator,
    program: &Program,
    pid: i32,
) -> Result<ProbeContext<R>> {
    let mut context = ProbeContext::open(Arc::clone(runtime), pid, &program.code, &program.cflags)?;

    for (probe, fn_name) in &program.usdt {
        context.enable_probe(probe, fn_name)?;
    }
    context.compile()?;
    let usdt = context.attach_uprobes()?;

    for (spec, fn_name) in program.uprobes.iter().chain(&program.uretprobes) {
        attach_symbol(&mut context, locator, spec, fn_name)?;
    }

    debug!(
        "pid {}: {} USDT uprobes, {} symbol probes",
        pid,
        usdt,
        program.uprobes.len() + program.uretprobes.len()
    );
    Ok(context)
}

/// Attach `fn_name` to a symbol given as `symbol` (in the process's own
/// executable) or `path:symbol`
fn attach_symbol<R: Runtime>(
    context: &mut ProbeContext<R>,
    locator: &ProcessLocator,
    spec: &str,
    fn_name: &str,
) -> Result<()> {
    let pid = context.pid();
    let (path, symbol) = match spec.split_once(':') {
        Some((path, symbol)) => (PathBuf::from(path), symbol),
        None => (locator.exe_path(pid)?, spec),
    };

    let module = context
        .module_mut()
        .ok_or(ContextError::NotCompiled(pid))?;
    let program = module
        .load_uprobe(fn_name)
        .with_context(|| format!("Failed to load {}", fn_name))?;
    module
        .attach_uprobe_by_symbol(&program, &path, symbol, pid)
        .with_context(|| format!("Failed to attach {} to {}:{}", fn_name, path.display(), symbol))?;

    debug!("Attached {} -> {}:{} (pid {})", fn_name, path.display(), symbol, pid);
    Ok(())
}

/// Sum the values of rows whose keys decode to the same labels, so each
/// series is exposed once
fn merge_counters(rows: Vec<MetricValueRow>) -> BTreeMap<Vec<String>, u64> {
    let mut merged = BTreeMap::new();
    for row in rows {
        let value: &mut u64 = merged.entry(row.labels).or_default();
        *value = value.saturating_add(row.value);
    }
    merged
}

fn set_labels(metric: &mut proto::Metric, names: &[String], values: &[String]) {
    let mut pairs: Vec<proto::LabelPair> = names
        .iter()
        .zip(values)
        .map(|(name, value)| {
            let mut pair = proto::LabelPair::default();
            pair.set_name(name.clone());
            pair.set_value(value.clone());
            pair
        })
        .collect();
    pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));

    for pair in pairs {
        metric.mut_label().push(pair);
    }
}

fn counter_metric(names: &[String], values: &[String], value: u64) -> proto::Metric {
    let mut counter = proto::Counter::default();
    counter.set_value(value as f64);

    let mut metric = proto::Metric::default();
    set_labels(&mut metric, names, values);
    metric.set_counter(counter);
    metric
}

fn histogram_metric(names: &[String], pid: &str, histogram: CumulativeHistogram) -> proto::Metric {
    let mut values = histogram.labels;
    values.push(pid.to_string());

    let mut h = proto::Histogram::default();
    h.set_sample_count(histogram.count);
    h.set_sample_sum(histogram.sum);
    for (upper_bound, cumulative) in histogram.buckets {
        let mut bucket = proto::Bucket::default();
        bucket.set_upper_bound(upper_bound);
        bucket.set_cumulative_count(cumulative);
        h.mut_bucket().push(bucket);
    }

    let mut metric = proto::Metric::default();
    set_labels(&mut metric, names, &values);
    metric.set_histogram(h);
    metric
}
