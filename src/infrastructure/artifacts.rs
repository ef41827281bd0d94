//! # Artifact and Snapshot Files
//!
//! Downloaded result artifacts land in one directory as `<key>.<ext>`; page
//! snapshots taken on suspicious failures land in another as
//! `<key>_<reason>_<timestamp>_<n>.html`. Directories are created on first use.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use tracing::debug;
use url::Url;

use crate::domain::Key;

/// Extension used when the artifact reference does not carry one
pub const DEFAULT_ARTIFACT_EXTENSION: &str = "png";

/// Directory of downloaded artifacts, one file per key
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `bytes` as the artifact of `key`, replacing an earlier download
    pub async fn save(&self, key: &Key, reference: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.{}", key, artifact_extension(reference)));
        tokio::fs::write(&path, bytes).await?;
        debug!("Saved artifact of {} to {:?}", key, path);
        Ok(path)
    }
}

/// File extension of the artifact a reference points at
#[must_use]
pub fn artifact_extension(reference: &str) -> String {
    let path = Url::parse(reference.trim()).map_or_else(|_| reference.trim().to_string(), |url| url.path().to_string());
    path.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| DEFAULT_ARTIFACT_EXTENSION.to_string())
}

/// Why a page snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    /// The key input field was missing
    NoInput,
    /// The consecutive-timeout limit was reached
    Timeout,
    /// The attempt ended in an unexpected error
    Unexpected,
}

impl SnapshotReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoInput => "no_input",
            Self::Timeout => "timeout",
            Self::Unexpected => "unexpected",
        }
    }
}

/// Directory of page sources saved for later inspection
#[derive(Debug)]
pub struct DebugSnapshots {
    dir: PathBuf,
    /// Keeps names unique when snapshots land within the same millisecond
    taken: AtomicU64,
}

impl DebugSnapshots {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            taken: AtomicU64::new(0),
        }
    }

    pub async fn save(&self, key: &Key, reason: SnapshotReason, page: &str) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S%3f");
        let n = self.taken.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("{}_{}_{}_{}.html", key, reason.as_str(), stamp, n));
        tokio::fs::write(&path, page).await?;
        debug!("📸 Saved {} snapshot of {} to {:?}", reason.as_str(), key, path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("https://maps.example/maps/90210.PDF", "pdf")]
    #[case("https://maps.example/img?zip=90210", "png")]
    #[case("https://maps.example/a.b/map.gif?v=2", "gif")]
    #[case("/relative/map.jpeg", "jpeg")]
    #[case("https://maps.example/archive.tar-gz", "png")]
    #[case("", "png")]
    fn extension_comes_from_the_reference_path(#[case] reference: &str, #[case] expected: &str) {
        assert_eq!(artifact_extension(reference), expected);
    }

    #[tokio::test]
    async fn artifact_is_named_after_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("images"));
        let key = Key::parse("2134").unwrap();

        let path = store.save(&key, "https://maps.example/m.pdf", b"%PDF").await.unwrap();
        assert_eq!(path, dir.path().join("images").join("02134.pdf"));
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF");

        // a second download for the same key replaces the first
        let again = store.save(&key, "https://maps.example/m.pdf", b"%PDF-2").await.unwrap();
        assert_eq!(again, path);
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-2");
    }

    #[tokio::test]
    async fn snapshot_name_carries_key_and_reason() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = DebugSnapshots::new(dir.path());
        let key = Key::parse("90210").unwrap();

        let path = snapshots.save(&key, SnapshotReason::NoInput, "<html></html>").await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("90210_no_input_"), "{name}");
        assert!(name.ends_with(".html"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<html></html>");

        let second = snapshots.save(&key, SnapshotReason::NoInput, "<html></html>").await.unwrap();
        assert_ne!(second, path);
    }
}
