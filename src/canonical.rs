//! Deterministic Canonicalisation
//!
//! Single source of byte-stable output for the engine. Every decision record
//! and every MAC payload goes through this module; nothing else in the crate
//! is allowed to serialise bytes that end up hashed, signed, or compared.
//!
//! # Canonical form
//!
//! - Object keys are sorted lexicographically (byte order) at every depth.
//! - Numbers are rendered in fixed notation, never exponent form. Integers
//!   render without a fractional part; floats use the shortest fixed
//!   representation that round-trips (`f64` `Display`).
//! - Non-finite floats are rejected: a NaN or infinity in a record is a bug
//!   upstream, not something to canonicalise.
//! - Timestamps are RFC 3339 UTC with fixed millisecond precision.
//! - Strings use standard JSON escaping.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{OracleError, OracleResult};

/// Render any serialisable value as canonical JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> OracleResult<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| OracleError::Config(format!("canonicalisation failed: {e}")))?;
    let mut out = String::with_capacity(256);
    write_value(&value, &mut out)?;
    Ok(out)
}

/// SHA-256 over canonical JSON, as lowercase hex.
pub fn canonical_digest<T: Serialize>(value: &T) -> OracleResult<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// RFC 3339 UTC with fixed millisecond precision.
///
/// Fixed precision matters: `2024-01-01T00:00:00Z` and
/// `2024-01-01T00:00:00.000Z` are the same instant but different bytes.
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn write_value(value: &Value, out: &mut String) -> OracleResult<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json map preserves insertion order; sort here so callers
            // never have to think about field declaration order.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_number(n: &serde_json::Number, out: &mut String) -> OracleResult<()> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    let f = n
        .as_f64()
        .ok_or_else(|| OracleError::Config(format!("unrepresentable number {n}")))?;
    if !f.is_finite() {
        return Err(OracleError::Config(format!(
            "non-finite number {f} rejected by canonicaliser"
        )));
    }
    // f64 Display is fixed notation for all finite values; ryu (used by
    // serde_json) is not, which is why numbers are rendered here.
    out.push_str(&format!("{f}"));
    Ok(())
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// =============================================================================
// MAC PAYLOAD BUILDER
// =============================================================================

/// Ordered payload builder for MAC inputs.
///
/// Field order is the caller's registration order, which must itself be
/// fixed; the builder exists so that payload assembly is explicit and a
/// field can never be silently skipped or reordered between producer and
/// verifier.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    buf: Vec<u8>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field as `len(name) ‖ name ‖ len(value) ‖ value`.
    ///
    /// Length prefixes prevent ambiguous concatenation: ("ab","c") and
    /// ("a","bc") must not produce the same bytes.
    pub fn field(mut self, name: &str, value: &[u8]) -> Self {
        self.buf
            .extend_from_slice(&(name.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        self.buf
            .extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn text_field(self, name: &str, value: &str) -> Self {
        self.field(name, value.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
