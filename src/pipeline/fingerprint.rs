use std::fmt;

use chrono::Datelike;
use sha2::{Digest, Sha256};

use crate::stages::StageConfig;
use crate::types::{DataType, RowSet, Value};

/// Content hash used as a memoization key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hash of the schema (names, types, display formats) and every cell of `rows`.
    pub fn of_rows(rows: &RowSet) -> Self {
        let mut h = Sha256::new();
        h.update(b"rows");
        h.update((rows.schema.len() as u64).to_le_bytes());
        for field in &rows.schema.fields {
            put_str(&mut h, &field.name);
            h.update([type_tag(field.data_type)]);
            match &field.format {
                Some(f) => {
                    h.update([1u8]);
                    put_str(&mut h, f);
                }
                None => h.update([0u8]),
            }
        }
        h.update((rows.row_count() as u64).to_le_bytes());
        for row in &rows.rows {
            for cell in row {
                put_value(&mut h, cell);
            }
        }
        Self(h.finalize().into())
    }

    /// Structural hash of a stage configuration (kind plus every option value).
    pub fn of_config(config: &StageConfig) -> Self {
        let mut h = Sha256::new();
        h.update(b"config");
        put_str(&mut h, config.kind().as_str());
        // Config types serialize infallibly (string keys, ordered maps).
        match serde_json::to_vec(config) {
            Ok(bytes) => h.update(bytes),
            Err(_) => h.update(format!("{config:?}")),
        }
        Self(h.finalize().into())
    }

    /// Order-sensitive combination of several fingerprints.
    pub fn combine(parts: &[Fingerprint]) -> Self {
        let mut h = Sha256::new();
        h.update(b"combine");
        for p in parts {
            h.update(p.0);
        }
        Self(h.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// First 12 hex digits, for logs.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn type_tag(t: DataType) -> u8 {
    match t {
        DataType::Int64 => 1,
        DataType::Float64 => 2,
        DataType::Date => 3,
        DataType::Utf8 => 4,
    }
}

fn put_str(h: &mut Sha256, s: &str) {
    h.update((s.len() as u64).to_le_bytes());
    h.update(s.as_bytes());
}

fn put_value(h: &mut Sha256, v: &Value) {
    match v {
        Value::Null => h.update([0u8]),
        Value::Int64(x) => {
            h.update([1u8]);
            h.update(x.to_le_bytes());
        }
        Value::Float64(x) => {
            h.update([2u8]);
            h.update(x.to_bits().to_le_bytes());
        }
        Value::Date(d) => {
            h.update([3u8]);
            h.update(d.num_days_from_ce().to_le_bytes());
        }
        Value::Utf8(s) => {
            h.update([4u8]);
            put_str(h, s);
        }
    }
}
