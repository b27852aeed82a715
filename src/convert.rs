//! BSON conversions and MongoDB error classification.
//!
//! Documents cross the engine boundary exactly once in each direction:
//! source reads convert BSON into the engine's [`Value`] model, target
//! writes convert back. The mapping is lossless for the value universe the
//! engine replicates with fidelity; legacy BSON types (regular expressions,
//! code, min/max keys) are folded into textual or object renderings.

use std::collections::BTreeMap;

use bson::spec::BinarySubtype;
use bson::{Binary, Bson};
use sync_core::{Document, DocumentId, SyncError, Value};

/// Convert a BSON value to the engine's value model.
pub fn bson_to_value(bson: Bson) -> Value {
    match bson {
        Bson::Double(f) => Value::Double(f),
        Bson::String(s) => Value::Text(s),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_value).collect()),
        Bson::Document(doc) => {
            let mut fields = BTreeMap::new();
            for (key, value) in doc {
                fields.insert(key, bson_to_value(value));
            }
            Value::Object(fields)
        }
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Int32(i) => Value::Int32(i),
        Bson::Int64(i) => Value::Int64(i),
        Bson::ObjectId(oid) => Value::ObjectId(oid.to_hex()),
        Bson::DateTime(dt) => Value::DateTime(dt.to_chrono()),
        Bson::Timestamp(ts) => {
            // Internal oplog timestamps: seconds plus an ordering increment,
            // which maps onto nanoseconds to keep relative order.
            match chrono::DateTime::from_timestamp(i64::from(ts.time), ts.increment) {
                Some(dt) => Value::DateTime(dt),
                None => Value::Null,
            }
        }
        Bson::Binary(binary) => Value::Bytes(binary.bytes),
        Bson::Decimal128(d) => Value::Decimal(d.to_string()),
        Bson::RegularExpression(regex) => {
            // /PATTERN/OPTIONS has no native representation here; keep the
            // inline-flags rendering so the content survives comparison.
            Value::Text(format!("(?{}){}", regex.options, regex.pattern))
        }
        Bson::JavaScriptCode(code) => Value::Text(code),
        Bson::JavaScriptCodeWithScope(code_with_scope) => {
            let mut scope = BTreeMap::new();
            for (key, value) in code_with_scope.scope {
                scope.insert(key, bson_to_value(value));
            }
            let mut fields = BTreeMap::new();
            fields.insert("$code".to_string(), Value::Text(code_with_scope.code));
            fields.insert("$scope".to_string(), Value::Object(scope));
            Value::Object(fields)
        }
        Bson::Symbol(s) => Value::Text(s),
        Bson::MaxKey => {
            let mut fields = BTreeMap::new();
            fields.insert("$maxKey".to_string(), Value::Int64(1));
            Value::Object(fields)
        }
        Bson::MinKey => {
            let mut fields = BTreeMap::new();
            fields.insert("$minKey".to_string(), Value::Int64(1));
            Value::Object(fields)
        }
        Bson::DbPointer(_) => Value::Text("$dbPointer".to_string()),
    }
}

/// Convert an engine value back to BSON for target writes.
pub fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int32(i) => Bson::Int32(*i),
        Value::Int64(i) => Bson::Int64(*i),
        Value::Double(f) => Bson::Double(*f),
        Value::Text(s) => Bson::String(s.clone()),
        Value::ObjectId(oid) => match bson::oid::ObjectId::parse_str(oid) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(oid.clone()),
        },
        Value::DateTime(ts) => Bson::DateTime(bson::DateTime::from_chrono(*ts)),
        Value::Bytes(bytes) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: bytes.clone(),
        }),
        Value::Decimal(dec) => match dec.parse::<bson::Decimal128>() {
            Ok(d) => Bson::Decimal128(d),
            Err(_) => Bson::String(dec.clone()),
        },
        Value::Array(items) => Bson::Array(items.iter().map(value_to_bson).collect()),
        Value::Object(fields) => {
            let mut doc = bson::Document::new();
            for (key, val) in fields {
                doc.insert(key.clone(), value_to_bson(val));
            }
            Bson::Document(doc)
        }
    }
}

/// Extract a document id from a BSON `_id` value.
pub fn document_id_from_bson(bson: &Bson) -> Result<DocumentId, SyncError> {
    match bson {
        Bson::ObjectId(oid) => Ok(DocumentId::ObjectId(oid.to_hex())),
        Bson::String(s) => Ok(DocumentId::Text(s.clone())),
        Bson::Int32(i) => Ok(DocumentId::Int(i64::from(*i))),
        Bson::Int64(i) => Ok(DocumentId::Int(*i)),
        other => Err(SyncError::Validation(format!(
            "unsupported _id type: {other:?}"
        ))),
    }
}

/// Render a document id as the BSON `_id` value it came from.
pub fn document_id_to_bson(id: &DocumentId) -> Bson {
    match id {
        DocumentId::Int(i) => Bson::Int64(*i),
        DocumentId::Text(s) => Bson::String(s.clone()),
        DocumentId::ObjectId(oid) => match bson::oid::ObjectId::parse_str(oid) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(oid.clone()),
        },
    }
}

/// Convert a full BSON document (with `_id`) into the engine model.
pub fn document_from_bson(doc: bson::Document) -> Result<Document, SyncError> {
    let id_bson = doc
        .get("_id")
        .ok_or_else(|| SyncError::Validation("document is missing _id".to_string()))?;
    let id = document_id_from_bson(id_bson)?;

    let mut fields = BTreeMap::new();
    for (key, value) in doc {
        if key != "_id" {
            fields.insert(key, bson_to_value(value));
        }
    }
    Ok(Document::new(id, fields))
}

/// Convert an engine document into a full BSON document (with `_id`).
pub fn document_to_bson(doc: &Document) -> bson::Document {
    let mut out = bson::Document::new();
    out.insert("_id", document_id_to_bson(&doc.id));
    for (key, value) in &doc.fields {
        out.insert(key.clone(), value_to_bson(value));
    }
    out
}

// Server error codes the engine cares about.
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;
const CHANGE_STREAMS_UNSUPPORTED: i32 = 40573;
const INDEX_OPTIONS_CONFLICT: i32 = 85;
const INDEX_KEY_SPECS_CONFLICT: i32 = 86;

/// Map a driver error onto the engine taxonomy.
///
/// Anything not recognizably a shape rejection is treated as transient and
/// handed to the retry policy; exhausted retries escalate it to a recorded
/// permanent failure either way.
pub fn classify_mongo_error(err: mongodb::error::Error) -> SyncError {
    use mongodb::error::{ErrorKind, WriteFailure};

    match &*err.kind {
        ErrorKind::InvalidArgument { .. }
        | ErrorKind::BsonSerialization(_)
        | ErrorKind::BsonDeserialization(_) => SyncError::Validation(err.to_string()),
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DOCUMENT_VALIDATION_FAILURE =>
        {
            SyncError::Validation(err.to_string())
        }
        ErrorKind::Command(command_error) if command_error.code == CHANGE_STREAMS_UNSUPPORTED => {
            SyncError::CaptureUnsupported(err.to_string())
        }
        _ => SyncError::Transient(err.to_string()),
    }
}

/// Whether an index creation failure means the index is already there.
pub fn is_index_exists_error(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    match &*err.kind {
        ErrorKind::Command(command_error) => {
            command_error.code == INDEX_OPTIONS_CONFLICT
                || command_error.code == INDEX_KEY_SPECS_CONFLICT
                || command_error.message.contains("already exists")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip_preserves_bson_types() {
        let original = bson::doc! {
            "_id": 7i64,
            "name": "widget",
            "qty": 3i32,
            "total": 12.5f64,
            "active": true,
            "nothing": Bson::Null,
        };

        let doc = document_from_bson(original.clone()).unwrap();
        let back = document_to_bson(&doc);

        assert_eq!(back.get("name"), original.get("name"));
        assert_eq!(back.get("qty"), original.get("qty"));
        assert_eq!(back.get("total"), original.get("total"));
        assert_eq!(back.get("active"), original.get("active"));
        assert_eq!(back.get("nothing"), original.get("nothing"));
        assert_eq!(back.get("_id"), original.get("_id"));
    }

    #[test]
    fn object_id_roundtrips_as_object_id() {
        let oid = bson::oid::ObjectId::new();
        let original = bson::doc! { "_id": oid, "ref": oid };

        let doc = document_from_bson(original).unwrap();
        assert_eq!(doc.id, DocumentId::ObjectId(oid.to_hex()));

        let back = document_to_bson(&doc);
        assert_eq!(back.get("_id"), Some(&Bson::ObjectId(oid)));
        assert_eq!(back.get("ref"), Some(&Bson::ObjectId(oid)));
    }

    #[test]
    fn nested_documents_and_arrays_convert_recursively() {
        let original = bson::doc! {
            "_id": "k1",
            "lines": [ { "sku": "a", "qty": 1i32 }, { "sku": "b", "qty": 2i32 } ],
        };

        let doc = document_from_bson(original.clone()).unwrap();
        match doc.fields.get("lines") {
            Some(Value::Array(items)) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }

        let back = document_to_bson(&doc);
        assert_eq!(back.get("lines"), original.get("lines"));
    }

    #[test]
    fn missing_id_is_a_validation_error() {
        let result = document_from_bson(bson::doc! { "name": "x" });
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[test]
    fn binary_payload_survives_roundtrip() {
        let original = bson::doc! {
            "_id": 1i64,
            "blob": Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: vec![0, 159, 146, 150] }),
        };
        let doc = document_from_bson(original.clone()).unwrap();
        let back = document_to_bson(&doc);
        assert_eq!(back.get("blob"), original.get("blob"));
    }
}
