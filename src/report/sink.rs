//! Where result entries go once a family produces them.

use super::{ResultEntry, TestFamily};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, entry: &ResultEntry) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JsonLinesSink
// ---------------------------------------------------------------------------

/// One JSON-lines file per test family:
/// `{dir}/{prefix}-{family}{postfix}.jsonl`.
pub struct JsonLinesSink {
    dir: PathBuf,
    prefix: String,
    postfix: String,
    files: Mutex<HashMap<TestFamily, tokio::fs::File>>,
}

impl JsonLinesSink {
    /// Create `dir` if needed. An empty `postfix` adds nothing to the name.
    pub async fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        postfix: &str,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create results directory: {}", dir.display()))?;

        let postfix = if postfix.is_empty() {
            String::new()
        } else {
            format!("-{postfix}")
        };

        Ok(Self {
            dir,
            prefix: prefix.into(),
            postfix,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Prefix derived from the current UTC time, e.g. `20261016T093000Z`.
    pub fn timestamp_prefix() -> String {
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, family: TestFamily) -> PathBuf {
        self.dir.join(format!(
            "{}-{}{}.jsonl",
            self.prefix,
            family.file_stem(),
            self.postfix
        ))
    }
}

#[async_trait::async_trait]
impl ResultSink for JsonLinesSink {
    async fn record(&self, entry: &ResultEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("failed to serialize result entry")?;
        line.push('\n');

        let mut files = self.files.lock().await;
        let file = match files.entry(entry.family) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let path = self.path_for(entry.family);
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .with_context(|| format!("failed to open result file: {}", path.display()))?;
                debug!(path = %path.display(), "result file opened");
                v.insert(file)
            }
        };

        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write result for {}", entry.family))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush result for {}", entry.family))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TracingSink
// ---------------------------------------------------------------------------

/// Emits every entry as a structured `info` event.
pub struct TracingSink;

#[async_trait::async_trait]
impl ResultSink for TracingSink {
    async fn record(&self, entry: &ResultEntry) -> Result<()> {
        let record = serde_json::to_string(&entry.record).context("failed to serialize record")?;
        info!(family = %entry.family, %record, "result");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Keeps entries in memory, for one-shot commands and tests.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<ResultEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ResultEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ResultSink for MemorySink {
    async fn record(&self, entry: &ResultEntry) -> Result<()> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
