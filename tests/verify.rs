//! Verifier behavior: count checks, fingerprint comparison, deletion
//! sampling, and the read-only guarantee.

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use mongo_mirror::testing::{sample_document, MemorySource, MemoryTarget};
use mongo_mirror::{
    verify, CollectionSpec, DocumentId, Value, Verifier, VerifyOptions, VerifyStatus,
};

fn spec(name: &str) -> CollectionSpec {
    CollectionSpec::new("app", "app", name)
}

fn verifier(source: &MemorySource, target: &MemoryTarget, exhaustive: bool) -> Verifier {
    Verifier::new(
        Arc::new(source.clone()),
        Arc::new(target.clone()),
        VerifyOptions {
            sample_size: 10,
            exhaustive,
        },
    )
}

fn mirror(source: &MemorySource, target: &MemoryTarget, collection: &str, count: i64) {
    let now = Utc::now();
    for i in 0..count {
        let doc = sample_document(i, i, now);
        source.put(collection, doc.clone());
        target.put(collection, doc);
    }
}

#[tokio::test]
async fn identical_sides_verify_clean() {
    let source = MemorySource::new();
    let target = MemoryTarget::new();
    mirror(&source, &target, "orders", 40);

    let result = verifier(&source, &target, true)
        .compare(&spec("orders"))
        .await
        .unwrap();

    assert_eq!(result.status, VerifyStatus::Ok);
    assert_eq!(result.source_count, 40);
    assert_eq!(result.target_count, 40);
    assert!(result.mismatched_ids.is_empty());
    assert!(result.missing_ids.is_empty());
    assert!(result.extra_ids.is_empty());
}

#[tokio::test]
async fn content_drift_is_reported_by_id() {
    let source = MemorySource::new();
    let target = MemoryTarget::new();
    mirror(&source, &target, "orders", 20);

    // Drift one document's content on the target side.
    let mut drifted = target.get_document("orders", &DocumentId::Int(7)).unwrap();
    drifted
        .fields
        .insert("value".to_string(), Value::Int64(-1));
    target.put("orders", drifted);

    let result = verifier(&source, &target, true)
        .compare(&spec("orders"))
        .await
        .unwrap();

    assert_eq!(result.status, VerifyStatus::Mismatch);
    assert_eq!(result.mismatched_ids, vec![DocumentId::Int(7)]);
}

#[tokio::test]
async fn documents_missing_from_target_are_reported() {
    let source = MemorySource::new();
    let target = MemoryTarget::new();
    mirror(&source, &target, "orders", 10);

    // Remove from the target only; deletion goes through the writer trait.
    use mongo_mirror::TargetWriter;
    let removed = [DocumentId::Int(3), DocumentId::Int(8)];
    for id in &removed {
        target.delete(&spec("orders"), id).await.unwrap();
    }

    let result = verifier(&source, &target, true)
        .compare(&spec("orders"))
        .await
        .unwrap();

    assert_eq!(result.status, VerifyStatus::Mismatch);
    assert_eq!(result.missing_ids, removed.to_vec());
}

#[tokio::test]
async fn source_deletions_surface_as_extra_target_ids() {
    let source = MemorySource::new();
    let target = MemoryTarget::new();
    mirror(&source, &target, "orders", 30);

    // k documents vanish at the source; an exhaustive run must report at
    // least k extra ids.
    let k = 5;
    for i in 0..k {
        source.remove("orders", &DocumentId::Int(i));
    }

    let result = verifier(&source, &target, true)
        .compare(&spec("orders"))
        .await
        .unwrap();

    assert_eq!(result.status, VerifyStatus::Mismatch);
    assert!(result.extra_ids.len() >= k as usize);
    assert_eq!(result.source_count, 25);
    assert_eq!(result.target_count, 30);
}

#[tokio::test]
async fn sampled_deletion_detection_respects_its_bound() {
    let source = MemorySource::new();
    let target = MemoryTarget::new();
    mirror(&source, &target, "orders", 50);
    source.clear("orders");

    // Non-exhaustive, non-widened sampling inspects at most sample_size
    // target ids.
    let v = verifier(&source, &target, false);
    let extra = v.sample_extra_ids(&spec("orders"), false).await.unwrap();
    assert_eq!(extra.len(), 10);

    // Widened sampling covers the rest here.
    let extra = v.sample_extra_ids(&spec("orders"), true).await.unwrap();
    assert_eq!(extra.len(), 50);
}

#[tokio::test]
async fn verifier_never_mutates_the_target() {
    let source = MemorySource::new();
    let target = MemoryTarget::new();
    mirror(&source, &target, "orders", 15);
    for i in 0..5 {
        source.remove("orders", &DocumentId::Int(i));
    }

    verifier(&source, &target, true)
        .compare(&spec("orders"))
        .await
        .unwrap();

    // Detection only: the extra documents are still on the target.
    assert_eq!(target.len("orders"), 15);
}

#[tokio::test]
async fn sampled_content_check_still_catches_global_drift() {
    let source = MemorySource::new();
    let target = MemoryTarget::new();
    mirror(&source, &target, "orders", 100);

    // Every target document drifts; even a small sample must notice.
    for id in target.ids("orders") {
        let mut doc = target.get_document("orders", &id).unwrap();
        doc.fields.insert("value".to_string(), Value::Int64(-1));
        target.put("orders", doc);
    }

    let result = verifier(&source, &target, false)
        .compare(&spec("orders"))
        .await
        .unwrap();

    assert_eq!(result.status, VerifyStatus::Mismatch);
    assert!(!result.mismatched_ids.is_empty());
}

#[tokio::test]
async fn report_file_is_written_and_parseable() {
    let source = MemorySource::new();
    let target = MemoryTarget::new();
    mirror(&source, &target, "orders", 5);

    let results = vec![verifier(&source, &target, true)
        .compare(&spec("orders"))
        .await
        .unwrap()];

    let tmp = TempDir::new().unwrap();
    let path = verify::write_report(tmp.path(), &results).unwrap();
    assert!(path.exists());

    let content = std::fs::read_to_string(path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(parsed[0]["collection"], "orders");
    assert_eq!(parsed[0]["status"], "OK");
}
