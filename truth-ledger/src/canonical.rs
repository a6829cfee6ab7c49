//! Canonical serialization for chain hashing
//!
//! Produces the deterministic byte representation a check is hashed over.
//! Members are emitted in lexicographic key order with a fixed text encoding:
//!
//! - `", "` between members and `": "` between key and value
//! - integers in base 10, absent optionals as `null`
//! - strings escaped ASCII-only: printable ASCII is literal, `"` `\` and the
//!   usual control characters get short escapes, everything else becomes
//!   lowercase `\uXXXX` (UTF-16 surrogate pairs above the BMP)
//!
//! The output is byte-identical to a sorted-key JSON dump with ASCII escaping,
//! so ledgers written by other tooling using that convention verify here.

use crate::types::{Check, CheckPayload, CheckStatus};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Hashable fields of a check, borrowed from whichever record holds them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalFields<'a> {
    /// Caller-supplied timestamp text, hashed verbatim
    pub timestamp: &'a str,
    /// Stream key
    pub stream_key: &'a str,
    /// Probed URL
    pub endpoint: &'a str,
    /// Observed status
    pub status: CheckStatus,
    /// Latency
    pub response_time_ms: Option<u64>,
    /// Response code
    pub status_code: Option<i64>,
    /// Provenance tag
    pub source: &'a str,
}

/// Records that participate in a hash chain
pub trait ChainRecord {
    /// The fields covered by the record's hash
    fn canonical_fields(&self) -> CanonicalFields<'_>;
}

impl ChainRecord for Check {
    fn canonical_fields(&self) -> CanonicalFields<'_> {
        CanonicalFields {
            timestamp: &self.timestamp,
            stream_key: &self.stream_key,
            endpoint: &self.endpoint,
            status: self.status,
            response_time_ms: self.response_time_ms,
            status_code: self.status_code,
            source: &self.source,
        }
    }
}

impl ChainRecord for CheckPayload {
    fn canonical_fields(&self) -> CanonicalFields<'_> {
        CanonicalFields {
            timestamp: &self.timestamp,
            stream_key: &self.stream_key,
            endpoint: &self.endpoint,
            status: self.status,
            response_time_ms: self.response_time_ms,
            status_code: self.status_code,
            source: &self.source,
        }
    }
}

impl ChainRecord for CanonicalFields<'_> {
    fn canonical_fields(&self) -> CanonicalFields<'_> {
        *self
    }
}

/// Canonical member value
#[derive(Debug, Clone, Copy)]
enum Value<'a> {
    Str(&'a str),
    Unsigned(u64),
    Signed(i64),
    Null,
}

/// Canonical serializer
///
/// Members are collected in a `BTreeMap`, so emission order is the key
/// order regardless of insertion order.
#[derive(Debug, Default)]
struct CanonicalSerializer<'a> {
    members: BTreeMap<&'static str, Value<'a>>,
}

impl<'a> CanonicalSerializer<'a> {
    fn new() -> Self {
        Self::default()
    }

    fn string(mut self, key: &'static str, value: &'a str) -> Self {
        self.members.insert(key, Value::Str(value));
        self
    }

    fn unsigned(mut self, key: &'static str, value: Option<u64>) -> Self {
        self.members
            .insert(key, value.map_or(Value::Null, Value::Unsigned));
        self
    }

    fn signed(mut self, key: &'static str, value: Option<i64>) -> Self {
        self.members.insert(key, value.map_or(Value::Null, Value::Signed));
        self
    }

    fn finalize(self) -> String {
        let mut out = String::with_capacity(256);
        out.push('{');
        for (i, (key, value)) in self.members.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_string(&mut out, key);
            out.push_str(": ");
            match value {
                Value::Str(s) => write_string(&mut out, s),
                Value::Unsigned(n) => {
                    let _ = write!(out, "{}", n);
                }
                Value::Signed(n) => {
                    let _ = write!(out, "{}", n);
                }
                Value::Null => out.push_str("null"),
            }
        }
        out.push('}');
        out
    }
}

/// Canonical text of a record linked to `previous_hash`
pub fn canonical_string<R: ChainRecord + ?Sized>(record: &R, previous_hash: &str) -> String {
    let fields = record.canonical_fields();

    CanonicalSerializer::new()
        .string("timestamp", fields.timestamp)
        .string("stream_key", fields.stream_key)
        .string("endpoint", fields.endpoint)
        .string("status", fields.status.as_str())
        .unsigned("response_time_ms", fields.response_time_ms)
        .signed("status_code", fields.status_code)
        .string("source", fields.source)
        .string("previous_hash", previous_hash)
        .finalize()
}

/// Canonical bytes of a record linked to `previous_hash`
pub fn canonical_bytes<R: ChainRecord + ?Sized>(record: &R, previous_hash: &str) -> Vec<u8> {
    canonical_string(record, previous_hash).into_bytes()
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='~' => out.push(c),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{:04x}", unit);
                }
            }
        }
    }
    out.push('"');
}
