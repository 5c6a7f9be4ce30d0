//! Table scanning
//!
//! Walks a live kernel table and decodes each key into label values. The
//! walk is not atomic: instrumentation keeps updating the table while it is
//! read.

use std::collections::HashSet;

use anyhow::{Context, Result};
use log::debug;

use crate::{
    config::Label,
    decoder::{DecodeError, DecoderSet},
    runtime::Module,
    types::{hex, MetricValueRow},
};

/// Read and decode every row of `table`.
///
/// Rows a decoder asks to skip are left out, as are repeats of a key already
/// read. Any other decode error fails the whole scan.
pub fn table_values<M: Module>(
    module: &M,
    table: &str,
    labels: &[Label],
    decoders: &DecoderSet,
) -> Result<Vec<MetricValueRow>> {
    let entries = module
        .table(table)
        .with_context(|| format!("Failed to read table {}", table))?;

    let mut rows = Vec::with_capacity(entries.len());
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.key.clone()) {
            debug!("Dropping repeated key {} of table {}", hex(&entry.key), table);
            continue;
        }
        let values = match decoders.decode_labels(&entry.key, labels) {
            Ok(values) => values,
            Err(DecodeError::Skip) => continue,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to decode key {} of table {}", hex(&entry.key), table)
                })
            }
        };

        rows.push(MetricValueRow {
            raw: hex(&entry.key),
            labels: values,
            value: entry.value,
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Decoder,
        runtime::Runtime,
        testing::{StubConfig, StubRuntime},
        types::TableEntry,
    };
    use std::collections::HashMap;

    fn module_with(table: &str, entries: Vec<TableEntry>) -> impl Module {
        let runtime = StubRuntime::new(StubConfig {
            tables: HashMap::from([(table.to_string(), entries)]),
            ..Default::default()
        });
        runtime.compile("// preamble pid 1\n", &[]).unwrap()
    }

    fn labels() -> Vec<Label> {
        vec![Label {
            name: "gen".to_string(),
            size: 4,
            padding: 0,
            decoders: vec![Decoder::Uint],
        }]
    }

    #[test]
    fn test_table_values() {
        let module = module_with(
            "gc_counts",
            vec![
                TableEntry {
                    key: 0u32.to_ne_bytes().to_vec(),
                    value: 12,
                },
                TableEntry {
                    key: 2u32.to_ne_bytes().to_vec(),
                    value: 3,
                },
            ],
        );

        let rows = table_values(&module, "gc_counts", &labels(), &DecoderSet::default()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].labels, vec!["0"]);
        assert_eq!(rows[0].value, 12);
        assert_eq!(rows[1].labels, vec!["2"]);
        assert_eq!(rows[1].raw, hex(&2u32.to_ne_bytes()));
    }

    #[test]
    fn test_repeated_key_read_once() {
        let entry = TableEntry {
            key: 1u32.to_ne_bytes().to_vec(),
            value: 3,
        };
        let module = module_with("gc_counts", vec![entry.clone(), entry]);

        let rows = table_values(&module, "gc_counts", &labels(), &DecoderSet::default()).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].labels, vec!["1"]);
        assert_eq!(rows[0].value, 3);
    }

    #[test]
    fn test_short_key_aborts_scan() {
        let module = module_with(
            "gc_counts",
            vec![
                TableEntry {
                    key: 0u32.to_ne_bytes().to_vec(),
                    value: 1,
                },
                TableEntry {
                    key: vec![1, 2],
                    value: 1,
                },
            ],
        );

        let err = table_values(&module, "gc_counts", &labels(), &DecoderSet::default())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("0102"));
    }

    #[test]
    fn test_missing_table() {
        let module = module_with("gc_counts", Vec::new());

        assert!(table_values(&module, "other", &labels(), &DecoderSet::default()).is_err());
        assert!(table_values(&module, "gc_counts", &labels(), &DecoderSet::default())
            .unwrap()
            .is_empty());
    }
}
