//! Histogram aggregation
//!
//! Histogram tables hold one row per (labels..., bucket) with the raw count
//! of that bucket. The last label is the bucket's upper boundary as an
//! unsigned integer. Rows are grouped by the remaining labels and turned
//! into cumulative buckets.

use std::{collections::BTreeMap, num::ParseIntError};

use thiserror::Error;

use crate::types::MetricValueRow;

#[derive(Error, Debug)]
pub enum HistogramError {
    #[error("histogram row {0} has no bucket label")]
    NoBucketLabel(String),

    #[error("invalid bucket boundary {boundary:?}: {source}")]
    Boundary {
        boundary: String,
        #[source]
        source: ParseIntError,
    },
}

/// One labelled histogram ready for exposition
#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeHistogram {
    /// Labels without the bucket boundary
    pub labels: Vec<String>,
    /// (upper bound, cumulative count), ascending
    pub buckets: Vec<(f64, u64)>,
    /// Total observations, the count of the highest bucket
    pub count: u64,
    /// Sum of observations; tables do not record it
    pub sum: f64,
}

/// Group rows by their labels and build cumulative buckets.
///
/// Counts of rows with the same labels and boundary are added up. Groups
/// come out sorted by labels. A single unparsable boundary fails the whole
/// histogram.
pub fn aggregate(rows: &[MetricValueRow]) -> Result<Vec<CumulativeHistogram>, HistogramError> {
    let mut groups: BTreeMap<&[String], BTreeMap<u64, u64>> = BTreeMap::new();

    for row in rows {
        let (boundary, labels) = row
            .labels
            .split_last()
            .ok_or_else(|| HistogramError::NoBucketLabel(row.raw.clone()))?;
        let boundary = parse_boundary(boundary)?;

        let count = groups.entry(labels).or_default().entry(boundary).or_default();
        *count = count.saturating_add(row.value);
    }

    Ok(groups
        .into_iter()
        .map(|(labels, counts)| {
            let mut total = 0u64;
            let buckets = counts
                .into_iter()
                .map(|(boundary, count)| {
                    total = total.saturating_add(count);
                    (boundary as f64, total)
                })
                .collect();

            CumulativeHistogram {
                labels: labels.to_vec(),
                buckets,
                count: total,
                sum: 0.0,
            }
        })
        .collect())
}

/// Parse an unsigned boundary in decimal, `0x`, `0o` or `0b` notation
pub fn parse_boundary(s: &str) -> Result<u64, HistogramError> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (oct, 8)
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (bin, 2)
    } else {
        (s, 10)
    };

    u64::from_str_radix(digits, radix).map_err(|source| HistogramError::Boundary {
        boundary: s.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(labels: &[&str], value: u64) -> MetricValueRow {
        MetricValueRow {
            raw: String::new(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            value,
        }
    }

    #[test]
    fn test_cumulative_buckets() {
        let rows = vec![
            row(&["sda", "read", "1"], 10),
            row(&["sda", "read", "2"], 2),
            row(&["sda", "read", "4"], 5),
        ];

        let histograms = aggregate(&rows).unwrap();

        assert_eq!(histograms.len(), 1);
        let h = &histograms[0];
        assert_eq!(h.labels, vec!["sda", "read"]);
        assert_eq!(h.buckets, vec![(1.0, 10), (2.0, 12), (4.0, 17)]);
        assert_eq!(h.count, 17);
        assert_eq!(h.sum, 0.0);
    }

    #[test]
    fn test_groups_are_sorted_and_merged() {
        let rows = vec![
            row(&["sdb", "8"], 1),
            row(&["sda", "16"], 4),
            row(&["sda", "8"], 3),
            row(&["sda", "0x10"], 6),
        ];

        let histograms = aggregate(&rows).unwrap();

        assert_eq!(histograms.len(), 2);
        assert_eq!(histograms[0].labels, vec!["sda"]);
        assert_eq!(histograms[0].buckets, vec![(8.0, 3), (16.0, 13)]);
        assert_eq!(histograms[1].labels, vec!["sdb"]);
        assert_eq!(histograms[1].count, 1);
    }

    #[test]
    fn test_bucket_only_rows() {
        let histograms = aggregate(&[row(&["2"], 1), row(&["1"], 1)]).unwrap();

        assert_eq!(histograms.len(), 1);
        assert!(histograms[0].labels.is_empty());
        assert_eq!(histograms[0].buckets, vec![(1.0, 1), (2.0, 2)]);
    }

    #[test]
    fn test_bad_boundary_fails() {
        let rows = vec![row(&["sda", "1"], 1), row(&["sda", "one"], 1)];

        assert!(matches!(
            aggregate(&rows),
            Err(HistogramError::Boundary { .. })
        ));
        assert!(matches!(
            aggregate(&[row(&[], 1)]),
            Err(HistogramError::NoBucketLabel(_))
        ));
    }

    #[test]
    fn test_parse_boundary() {
        assert_eq!(parse_boundary("42").unwrap(), 42);
        assert_eq!(parse_boundary("0x1f").unwrap(), 31);
        assert_eq!(parse_boundary("0o17").unwrap(), 15);
        assert_eq!(parse_boundary("0b101").unwrap(), 5);
        assert!(parse_boundary("-1").is_err());
        assert!(parse_boundary("").is_err());
    }
}
