//! Label decoders
//!
//! Table keys are packed structs. Each declared label takes a slice of the
//! key and runs it through a chain of decoders; the output of one decoder is
//! the input of the next.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr},
};

use regex::Regex;
use thiserror::Error;

use crate::{
    config::{Config, Decoder, Label},
    types::hex,
};

/// Errors decoding a table key
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Not an error: the row must be left out of the scrape
    #[error("row skipped by decoder")]
    Skip,

    #[error("key of {available} bytes too short for label {label} at offset {offset} (size {size})")]
    ShortKey {
        label: String,
        offset: usize,
        size: usize,
        available: usize,
    },

    #[error("uint decoder does not support {0}-byte integers")]
    UintSize(usize),

    #[error("inet_ip decoder needs 4 or 16 bytes, got {0}")]
    IpSize(usize),

    #[error("invalid regexp {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("regexp {0:?} was not compiled")]
    MissingRegex(String),
}

/// Runs decoder chains over table keys. Regular expressions are compiled
/// once, when the set is built.
#[derive(Debug, Default)]
pub struct DecoderSet {
    regexes: HashMap<String, Regex>,
}

impl DecoderSet {
    /// Build a decoder set for every label declared in `config`
    pub fn new(config: &Config) -> Result<Self, DecodeError> {
        let mut regexes = HashMap::new();

        let patterns = config
            .programs
            .iter()
            .flat_map(|p| p.metrics())
            .flat_map(|(_, m)| m.labels.iter())
            .flat_map(|l| l.decoders.iter())
            .filter_map(|d| match d {
                Decoder::Regexp { regexps } => Some(regexps),
                _ => None,
            })
            .flatten();

        for pattern in patterns {
            if regexes.contains_key(pattern) {
                continue;
            }
            let regex = Regex::new(pattern).map_err(|source| DecodeError::Regex {
                pattern: pattern.clone(),
                source,
            })?;
            regexes.insert(pattern.clone(), regex);
        }

        Ok(Self { regexes })
    }

    /// Decode every label of `key`, in declaration order
    pub fn decode_labels(&self, key: &[u8], labels: &[Label]) -> Result<Vec<String>, DecodeError> {
        let mut values = Vec::with_capacity(labels.len());
        let mut offset = 0;

        for label in labels {
            let short_key = || DecodeError::ShortKey {
                label: label.name.clone(),
                offset,
                size: label.size,
                available: key.len(),
            };
            let end = offset.checked_add(label.size).ok_or_else(short_key)?;
            let bytes = key.get(offset..end).ok_or_else(short_key)?;

            values.push(self.decode_chain(bytes, &label.decoders)?);
            offset = end.saturating_add(label.padding);
        }

        Ok(values)
    }

    fn decode_chain(&self, bytes: &[u8], decoders: &[Decoder]) -> Result<String, DecodeError> {
        let mut value = bytes.to_vec();
        for decoder in decoders {
            value = self.decode(&value, decoder)?.into_bytes();
        }
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    fn decode(&self, input: &[u8], decoder: &Decoder) -> Result<String, DecodeError> {
        match decoder {
            Decoder::Uint => decode_uint(input),
            Decoder::String => Ok(decode_string(input)),
            Decoder::StaticMap {
                static_map,
                allow_unknown,
            } => {
                let key = String::from_utf8_lossy(input);
                Ok(match static_map.get(key.as_ref()) {
                    Some(mapped) => mapped.clone(),
                    None if *allow_unknown => key.into_owned(),
                    None => format!("unknown:{key}"),
                })
            }
            Decoder::Regexp { regexps } => {
                let text = String::from_utf8_lossy(input);
                for pattern in regexps {
                    let regex = self
                        .regexes
                        .get(pattern)
                        .ok_or_else(|| DecodeError::MissingRegex(pattern.clone()))?;
                    if regex.is_match(&text) {
                        return Ok(text.into_owned());
                    }
                }
                Err(DecodeError::Skip)
            }
            Decoder::InetIp => match input.len() {
                4 => {
                    let octets: [u8; 4] = input.try_into().map_err(|_| DecodeError::IpSize(4))?;
                    Ok(Ipv4Addr::from(octets).to_string())
                }
                16 => {
                    let octets: [u8; 16] =
                        input.try_into().map_err(|_| DecodeError::IpSize(16))?;
                    Ok(Ipv6Addr::from(octets).to_string())
                }
                n => Err(DecodeError::IpSize(n)),
            },
            Decoder::Hex => Ok(hex(input)),
        }
    }
}

fn decode_uint(input: &[u8]) -> Result<String, DecodeError> {
    let value = match input.len() {
        1 => u64::from(input[0]),
        2 => u64::from(u16::from_ne_bytes([input[0], input[1]])),
        4 => u64::from(u32::from_ne_bytes([input[0], input[1], input[2], input[3]])),
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(input);
            u64::from_ne_bytes(bytes)
        }
        n => return Err(DecodeError::UintSize(n)),
    };
    Ok(value.to_string())
}

fn decode_string(input: &[u8]) -> String {
    let end = input.iter().position(|&b| b == 0).unwrap_or(input.len());
    String::from_utf8_lossy(&input[..end]).into_owned()
}
