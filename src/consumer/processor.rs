//! The memory-processing callback boundary.
//!
//! The consumer hands every decoded message to a [`MemoryProcessor`]. What
//! the processor does with it (LLM extraction, classification, storage) is
//! its own business; the consumer only looks at whether it succeeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::transport::MessageKind;

#[async_trait]
pub trait MemoryProcessor: Send + Sync {
    async fn process(&self, text: &str, kind: MessageKind) -> anyhow::Result<()>;
}

#[async_trait]
impl<P: MemoryProcessor + ?Sized> MemoryProcessor for Arc<P> {
    async fn process(&self, text: &str, kind: MessageKind) -> anyhow::Result<()> {
        (**self).process(text, kind).await
    }
}

/// Adapts a plain closure into a processor.
pub struct FnProcessor<F>(pub F);

#[async_trait]
impl<F> MemoryProcessor for FnProcessor<F>
where
    F: Fn(&str, MessageKind) -> anyhow::Result<()> + Send + Sync,
{
    async fn process(&self, text: &str, kind: MessageKind) -> anyhow::Result<()> {
        (self.0)(text, kind)
    }
}

#[derive(Serialize)]
struct JournalEntry<'a> {
    time: String,
    #[serde(rename = "type")]
    kind: MessageKind,
    memory: &'a str,
}

/// Appends every memory as one JSON line: `{"time": ..., "type": ..., "memory": ...}`.
pub struct JournalProcessor {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JournalProcessor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MemoryProcessor for JournalProcessor {
    async fn process(&self, text: &str, kind: MessageKind) -> anyhow::Result<()> {
        let entry = JournalEntry {
            time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            kind,
            memory: text,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;

        tracing::info!(path = %self.path.display(), "long-term memory saved");
        Ok(())
    }
}
