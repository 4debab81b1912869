use anyhow::{Context, Result};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

use crate::core::io::Storage;
use crate::core::state::XrayDocument;

/// Percentage-keyed snapshots (`N%.json`) in one book's output folder.
///
/// `100%.json` is the finished artifact. `0%.json` is a copy of the earliest
/// snapshot for readers who have not started the book; it is never used to
/// resume.
pub struct CheckpointManager {
    dir: String,
    storage: Arc<dyn Storage>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            dir: dir.into(),
            storage,
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn path(&self, percent: u8) -> String {
        Path::new(&self.dir)
            .join(format!("{}%.json", percent))
            .to_string_lossy()
            .to_string()
    }

    pub async fn list(&self) -> Result<Vec<u8>> {
        let mut found: Vec<u8> = self
            .storage
            .list(&self.dir)
            .await?
            .iter()
            .filter_map(|path| parse_percent(path))
            .collect();
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    pub async fn save(&self, doc: &XrayDocument) -> Result<String> {
        let path = self.path(doc.analysis_progress);
        let content = serde_json::to_string_pretty(doc)?;
        self.storage
            .write(&path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to write checkpoint {}", path))?;
        Ok(path)
    }

    pub async fn load(&self, percent: u8) -> Result<XrayDocument> {
        let path = self.path(percent);
        let bytes = self.storage.read(&path).await?;
        let doc = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse checkpoint {}", path))?;
        Ok(doc)
    }

    /// The highest readable snapshot. Unreadable ones are skipped with a
    /// warning so a torn newest file falls back to the one before it.
    pub async fn latest(&self) -> Result<Option<(u8, XrayDocument)>> {
        for percent in self.list().await?.into_iter().rev() {
            if percent == 0 {
                continue;
            }
            match self.load(percent).await {
                Ok(doc) => return Ok(Some((percent, doc))),
                Err(e) => warn!("Skipping unreadable checkpoint {}%: {:#}", percent, e),
            }
        }
        Ok(None)
    }

    pub async fn finalize(&self, doc: &XrayDocument) -> Result<String> {
        let mut doc = doc.clone();
        doc.analysis_progress = 100;
        let path = self.save(&doc).await?;
        self.write_start_view().await?;
        Ok(path)
    }

    pub async fn write_start_view(&self) -> Result<()> {
        let Some(first) = self.list().await?.into_iter().find(|p| *p > 0) else {
            return Ok(());
        };
        self.storage
            .copy(&self.path(first), &self.path(0))
            .await
            .context("Failed to write 0%.json")?;
        info!("Copied {}%.json to 0%.json for readers at the start of the book", first);
        Ok(())
    }
}

fn parse_percent(path: &str) -> Option<u8> {
    let name = Path::new(path).file_name()?.to_str()?;
    let digits = name.strip_suffix("%.json")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u8>().ok().filter(|p| *p <= 100)
}
