//! Envelope integrity checksum.
//!
//! The checksum is a hex digest over the canonical text form of the envelope
//! with its own `checksum` field removed. Canonical form: keys sorted at
//! every level, `", "` and `": "` separators, and everything outside
//! printable ASCII written as a lowercase `\uXXXX` escape (surrogate pairs
//! above the BMP). Signer and verifier must use the identical rule, so the
//! rule lives only here.

use std::{fmt, io, str::FromStr};

use md5::Md5;
use serde::Serialize;
use serde_json::{ser::Formatter, Map, Value};
use sha2::{Digest, Sha256};

pub const CHECKSUM_FIELD: &str = "checksum";

#[derive(thiserror::Error, Debug)]
pub enum ChecksumError {
    #[error("checksummed payload must be a JSON object")]
    NotAnObject,

    #[error("checksum field missing")]
    Missing,

    #[error("checksum field is not a string")]
    NotAString,

    #[error("checksum mismatch (supplied {supplied}, computed {computed})")]
    Mismatch { supplied: String, computed: String },

    #[error("unknown checksum algorithm '{0}' (expected md5 or sha256)")]
    UnknownAlgorithm(String),

    #[error("canonical serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    fn digest_hex(&self, bytes: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Md5 => hex::encode(Md5::digest(bytes)),
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(ChecksumError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Spaced separators, ASCII-only strings.
struct CanonicalFormatter;

impl Formatter for CanonicalFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        // Quotes, backslashes and C0 controls never reach this method.
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if (' '..='~').contains(&c) {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Canonical bytes of `value` with the top-level `checksum` field excluded.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, ChecksumError> {
    let obj = value.as_object().ok_or(ChecksumError::NotAnObject)?;
    let body: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| k.as_str() != CHECKSUM_FIELD)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut out = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, CanonicalFormatter);
    sorted(&Value::Object(body)).serialize(&mut ser)?;
    Ok(out)
}

pub fn compute(value: &Value, algorithm: ChecksumAlgorithm) -> Result<String, ChecksumError> {
    Ok(algorithm.digest_hex(&canonical_bytes(value)?))
}

/// Recompute and compare against the supplied `checksum` field.
pub fn verify(value: &Value, algorithm: ChecksumAlgorithm) -> Result<(), ChecksumError> {
    let supplied = value
        .as_object()
        .ok_or(ChecksumError::NotAnObject)?
        .get(CHECKSUM_FIELD)
        .ok_or(ChecksumError::Missing)?
        .as_str()
        .ok_or(ChecksumError::NotAString)?;

    let computed = compute(value, algorithm)?;
    if computed == supplied {
        Ok(())
    } else {
        Err(ChecksumError::Mismatch {
            supplied: supplied.to_string(),
            computed,
        })
    }
}
