//! Post-hoc reconciliation of source and target.
//!
//! The verifier only detects and reports: count comparison, canonical
//! fingerprint comparison (sampled or exhaustive), and deletion sampling
//! for target documents that no longer exist at the source. Correction is
//! the copier's and applier's job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sync_core::{fingerprint, CollectionSpec, DocumentId, SyncError};

use crate::sink::TargetWriter;
use crate::source::SourceReader;

/// Default number of documents sampled per collection for content checks
/// and deletion detection.
pub const DELETION_SAMPLE: usize = 100;
/// Widened sample used when the target holds more documents than the
/// source, which is exactly the signature of unobserved deletions.
pub const DELETION_SAMPLE_WIDE: usize = 1000;

/// Verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyStatus {
    Ok,
    Mismatch,
}

/// Result of one collection comparison. Produced fresh on every run and
/// never mutated afterward.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub collection: String,
    pub source_count: u64,
    pub target_count: u64,
    /// Ids present on both sides with differing content fingerprints.
    pub mismatched_ids: Vec<DocumentId>,
    /// Ids present at the source but absent from the target.
    pub missing_ids: Vec<DocumentId>,
    /// Ids present at the target but absent from the source.
    pub extra_ids: Vec<DocumentId>,
    pub status: VerifyStatus,
}

/// Verification tuning.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Content-check sample bound in sampled mode.
    pub sample_size: usize,
    /// Compare every document and widen deletion sampling to the whole
    /// target (force-refresh mode).
    pub exhaustive: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            sample_size: DELETION_SAMPLE,
            exhaustive: false,
        }
    }
}

/// Read-only reconciliation of one or more collections.
pub struct Verifier {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    options: VerifyOptions,
}

impl Verifier {
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        options: VerifyOptions,
    ) -> Self {
        Verifier {
            source,
            target,
            options,
        }
    }

    /// Compare source and target for one collection.
    pub async fn compare(&self, spec: &CollectionSpec) -> Result<VerificationResult, SyncError> {
        let source_count = self.source.count(spec).await?;
        let target_count = self.target.count(spec).await?;

        let (mismatched_ids, missing_ids) = self.content_check(spec, source_count).await?;

        let widen = self.options.exhaustive || target_count > source_count;
        let extra_ids = self.sample_extra_ids(spec, widen).await?;

        let status = if source_count == target_count
            && mismatched_ids.is_empty()
            && missing_ids.is_empty()
            && extra_ids.is_empty()
        {
            VerifyStatus::Ok
        } else {
            VerifyStatus::Mismatch
        };

        let result = VerificationResult {
            collection: spec.collection.clone(),
            source_count,
            target_count,
            mismatched_ids,
            missing_ids,
            extra_ids,
            status,
        };
        tracing::info!(
            collection = %spec.collection,
            source_count,
            target_count,
            mismatched = result.mismatched_ids.len(),
            missing = result.missing_ids.len(),
            extra = result.extra_ids.len(),
            status = ?result.status,
            "verification finished"
        );
        Ok(result)
    }

    /// Walk source documents (all of them, or an evenly spaced sample) and
    /// compare content fingerprints against the target.
    async fn content_check(
        &self,
        spec: &CollectionSpec,
        source_count: u64,
    ) -> Result<(Vec<DocumentId>, Vec<DocumentId>), SyncError> {
        let mut mismatched = Vec::new();
        let mut missing = Vec::new();

        let step = if self.options.exhaustive || self.options.sample_size == 0 {
            1
        } else {
            std::cmp::max(1, source_count as usize / self.options.sample_size)
        };

        let mut after: Option<DocumentId> = None;
        let mut index = 0usize;
        loop {
            let batch = self
                .source
                .read_batch(spec, after.as_ref(), VERIFY_READ_BATCH)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id.clone());

            for doc in &batch {
                let sampled = index % step == 0;
                index += 1;
                if !sampled {
                    continue;
                }
                match self.target.get(spec, &doc.id).await? {
                    None => missing.push(doc.id.clone()),
                    Some(target_doc) => {
                        if fingerprint(doc) != fingerprint(&target_doc) {
                            mismatched.push(doc.id.clone());
                        }
                    }
                }
            }
        }

        Ok((mismatched, missing))
    }

    /// Sample target ids and report those absent from the source.
    ///
    /// In exhaustive mode the sample covers the entire target, which is
    /// what guarantees that k source-side deletions surface as at least k
    /// extra ids.
    pub async fn sample_extra_ids(
        &self,
        spec: &CollectionSpec,
        widen: bool,
    ) -> Result<Vec<DocumentId>, SyncError> {
        let bound = if self.options.exhaustive {
            usize::MAX
        } else if widen {
            DELETION_SAMPLE_WIDE
        } else {
            self.options.sample_size
        };

        let candidate_ids = self.target.list_ids(spec, bound).await?;
        let mut extra = Vec::new();
        for id in candidate_ids {
            if !self.source.contains(spec, &id).await? {
                extra.push(id);
            }
        }
        Ok(extra)
    }
}

const VERIFY_READ_BATCH: usize = 500;

/// Write verification results as a timestamped JSON report, returning its
/// path.
pub fn write_report(dir: &Path, results: &[VerificationResult]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("verification_{timestamp}.json"));
    std::fs::write(&path, serde_json::to_string_pretty(results)?)?;
    Ok(path)
}
