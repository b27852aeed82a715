//! Configuration: connection options, sync tuning, and the collection
//! list.
//!
//! The collection list lives in a JSON file (`collections.json` by
//! default), one entry per replicated collection:
//!
//! ```json
//! [
//!   { "source_db": "app", "target_db": "app", "collection": "orders" },
//!   { "source_db": "app", "target_db": "app", "collection": "users",
//!     "filter": { "active": true } }
//! ]
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sync_core::{CollectionSpec, RetryPolicy};

use crate::capture::CaptureConfig;

/// Source and target connection options.
#[derive(Parser, Clone, Debug)]
pub struct ConnectionOpts {
    /// Source MongoDB connection string
    #[arg(long, env = "SOURCE_URI")]
    pub source_uri: String,

    /// Target MongoDB connection string
    #[arg(long, env = "TARGET_URI")]
    pub target_uri: String,
}

/// Sync tuning shared by all operating modes.
#[derive(Parser, Clone, Debug)]
pub struct SyncOpts {
    /// Collection list file
    #[arg(long, default_value = "collections.json")]
    pub collections_file: PathBuf,

    /// Batch size for document processing
    #[arg(long, default_value = "1000")]
    pub batch_size: usize,

    /// Seconds between polling cycles
    #[arg(long, default_value = "5")]
    pub polling_interval: u64,

    /// Ignore checkpoints and re-scan all documents each cycle
    #[arg(long)]
    pub force_refresh: bool,

    /// Maximum attempts for a failing batch read/write
    #[arg(long, default_value = "5")]
    pub retry_limit: u32,

    /// Base delay in seconds for exponential backoff
    #[arg(long, default_value = "2")]
    pub retry_delay: u64,

    /// Directory for checkpoint records
    #[arg(long, default_value = ".mongo-mirror/progress")]
    pub progress_dir: PathBuf,

    /// Directory for failed-document logs
    #[arg(long, default_value = ".mongo-mirror/logs")]
    pub log_dir: PathBuf,

    /// Directory for verification reports
    #[arg(long, default_value = ".mongo-mirror/verification")]
    pub verification_dir: PathBuf,
}

impl SyncOpts {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_limit,
            base_delay: Duration::from_secs(self.retry_delay),
            ..RetryPolicy::default()
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            batch_size: self.batch_size,
            polling_interval: Duration::from_secs(self.polling_interval),
            force_refresh: self.force_refresh,
            retry: self.retry_policy(),
            ..CaptureConfig::default()
        }
    }
}

/// Worker pool sizing: one worker per collection, or a fixed count with
/// collections queued round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threads {
    Auto,
    Fixed(usize),
}

impl Threads {
    /// Parse the CLI form: `auto` or a positive count.
    pub fn parse(s: &str) -> anyhow::Result<Threads> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Threads::Auto);
        }
        let n: usize = s
            .parse()
            .with_context(|| format!("invalid thread count: {s}"))?;
        if n == 0 {
            // Zero historically meant one worker per collection.
            return Ok(Threads::Auto);
        }
        Ok(Threads::Fixed(n))
    }
}

/// Load and validate the collection list.
pub fn load_collections(path: &Path) -> anyhow::Result<Vec<CollectionSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read collection list {}", path.display()))?;
    let specs: Vec<CollectionSpec> = serde_json::from_str(&content)
        .with_context(|| format!("invalid collection list {}", path.display()))?;

    for (i, spec) in specs.iter().enumerate() {
        if spec.source_db.is_empty() || spec.target_db.is_empty() || spec.collection.is_empty() {
            anyhow::bail!(
                "invalid collection config at index {i}: source_db, target_db and collection are required"
            );
        }
    }

    tracing::info!(
        collections = specs.len(),
        "loaded collection list from {}",
        path.display()
    );
    Ok(specs)
}
