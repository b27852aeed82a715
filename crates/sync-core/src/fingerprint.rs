//! Canonical content fingerprints.
//!
//! A fingerprint is a SHA-256 digest over a canonical byte encoding of a
//! document. The encoding tags every value with its type, renders floats by
//! their IEEE 754 bits, and walks object fields in key order, so two
//! representations of the same document always hash identically while any
//! content difference changes the digest.

use sha2::{Digest, Sha256};

use crate::values::{Document, DocumentId, Value};

/// A 32-byte canonical content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Compute the canonical fingerprint of a document, id included.
pub fn fingerprint(doc: &Document) -> Fingerprint {
    let mut hasher = Sha256::new();
    write_id(&mut hasher, &doc.id);
    hasher.update((doc.fields.len() as u64).to_be_bytes());
    for (key, value) in &doc.fields {
        write_str(&mut hasher, key);
        write_value(&mut hasher, value);
    }
    Fingerprint(hasher.finalize().into())
}

fn write_id(hasher: &mut Sha256, id: &DocumentId) {
    match id {
        DocumentId::Int(i) => {
            hasher.update(b"I");
            hasher.update(i.to_be_bytes());
        }
        DocumentId::Text(s) => {
            hasher.update(b"S");
            write_str(hasher, s);
        }
        DocumentId::ObjectId(oid) => {
            hasher.update(b"O");
            write_str(hasher, oid);
        }
    }
}

fn write_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn write_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update([u8::from(*b)]);
        }
        Value::Int32(i) => {
            hasher.update(b"i");
            hasher.update(i64::from(*i).to_be_bytes());
        }
        Value::Int64(i) => {
            hasher.update(b"l");
            hasher.update(i.to_be_bytes());
        }
        Value::Double(f) => {
            hasher.update(b"f");
            hasher.update(f.to_bits().to_be_bytes());
        }
        Value::Text(s) => {
            hasher.update(b"s");
            write_str(hasher, s);
        }
        Value::ObjectId(oid) => {
            hasher.update(b"o");
            write_str(hasher, oid);
        }
        Value::DateTime(ts) => {
            hasher.update(b"d");
            hasher.update(ts.timestamp_micros().to_be_bytes());
        }
        Value::Bytes(bytes) => {
            hasher.update(b"y");
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        Value::Decimal(dec) => {
            hasher.update(b"m");
            write_str(hasher, dec);
        }
        Value::Array(items) => {
            hasher.update(b"a");
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                write_value(hasher, item);
            }
        }
        Value::Object(fields) => {
            hasher.update(b"c");
            hasher.update((fields.len() as u64).to_be_bytes());
            for (key, val) in fields {
                write_str(hasher, key);
                write_value(hasher, val);
            }
        }
    }
}
