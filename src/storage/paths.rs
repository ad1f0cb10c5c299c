//! Storage root resolution and output path allocation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};

use crate::error::CaptureError;

const APP_DIR_NAME: &str = "CaptureAgent";
const WRITE_PROBE_NAME: &str = ".capture-agent-write-probe";

/// Fixed recordings location on the embedded target
#[cfg(target_os = "android")]
const DEVICE_ROOT: &str = "/storage/emulated/0/Movies/CaptureAgent";

/// Platform default for the recordings directory
pub fn platform_root() -> PathBuf {
    #[cfg(target_os = "android")]
    {
        return PathBuf::from(DEVICE_ROOT);
    }

    #[cfg(not(target_os = "android"))]
    {
        let user_dirs = directories::UserDirs::new();
        if let Some(documents) = user_dirs.as_ref().and_then(|d| d.document_dir()) {
            return documents.join(APP_DIR_NAME);
        }
        if let Some(home) = user_dirs.as_ref().map(|d| d.home_dir()) {
            return home.join("Documents").join(APP_DIR_NAME);
        }
        std::env::temp_dir().join(APP_DIR_NAME)
    }
}

/// Computes the storage root and hands out collision-free file names
#[derive(Debug)]
pub struct PathResolver {
    root_override: Option<PathBuf>,
    /// Last token handed out (capture time in milliseconds)
    last_token: AtomicI64,
}

impl PathResolver {
    pub fn new(root_override: Option<PathBuf>) -> Self {
        Self {
            root_override,
            last_token: AtomicI64::new(i64::MIN),
        }
    }

    /// Resolve the storage root and make sure it exists and is writable
    pub async fn resolve_root(&self) -> Result<PathBuf, CaptureError> {
        let root = self.root_override.clone().unwrap_or_else(platform_root);

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| CaptureError::storage(&root, format!("cannot create directory: {}", e)))?;

        let probe = root.join(WRITE_PROBE_NAME);
        tokio::fs::write(&probe, b"")
            .await
            .map_err(|e| CaptureError::storage(&root, format!("directory not writable: {}", e)))?;
        let _ = tokio::fs::remove_file(&probe).await;

        debug!("Storage root ready: {:?}", root);
        Ok(root)
    }

    /// Allocate a fresh output path under `root`.
    ///
    /// The name is the capture time in milliseconds. Tokens are strictly
    /// increasing for the lifetime of the resolver, and names already present
    /// on disk are skipped.
    pub fn allocate_output_path(&self, root: &Path, extension: &str) -> PathBuf {
        self.allocate_output_path_with(root, extension, &[])
    }

    /// Like [`allocate_output_path`](Self::allocate_output_path), but the
    /// token is also skipped when a file with any of `companions` as its
    /// extension exists, so later steps writing `<token>.<companion>` never
    /// land on an older recording.
    pub fn allocate_output_path_with(
        &self,
        root: &Path,
        extension: &str,
        companions: &[&str],
    ) -> PathBuf {
        let extension = extension.trim_start_matches('.');
        loop {
            let token = self.next_token();
            let path = root.join(format!("{}.{}", token, extension));
            let taken = std::iter::once(extension)
                .chain(companions.iter().map(|c| c.trim_start_matches('.')))
                .map(|ext| path.with_extension(ext))
                .find(|candidate| candidate.exists());
            match taken {
                None => {
                    info!("Allocated output path {:?}", path);
                    return path;
                }
                Some(existing) => debug!("{:?} already exists, skipping token {}", existing, token),
            }
        }
    }

    fn next_token(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let prev = self
            .last_token
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(if now > last { now } else { last + 1 })
            })
            .unwrap_or(now);
        if now > prev {
            now
        } else {
            prev + 1
        }
    }
}

/// List finished recordings in `root`, oldest first
pub async fn list_recordings(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocated_paths_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(Some(dir.path().to_path_buf()));

        let mut seen = HashSet::new();
        for _ in 0..500 {
            let path = resolver.allocate_output_path(dir.path(), "h264");
            assert!(seen.insert(path));
        }
    }

    #[test]
    fn test_allocated_names_are_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(None);

        let before = chrono::Utc::now().timestamp_millis();
        let path = resolver.allocate_output_path(dir.path(), ".mp4");
        let stem: i64 = path.file_stem().unwrap().to_str().unwrap().parse().unwrap();

        assert!(stem >= before);
        assert_eq!(path.extension().unwrap(), "mp4");
        assert_eq!(path.parent().unwrap(), dir.path());
    }

    #[test]
    fn test_existing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(None);

        // Occupy the next few milliseconds worth of names
        let now = chrono::Utc::now().timestamp_millis();
        for offset in 0..50 {
            std::fs::write(dir.path().join(format!("{}.h264", now + offset)), b"x").unwrap();
        }

        let path = resolver.allocate_output_path(dir.path(), "h264");
        assert!(!path.exists());
    }

    #[test]
    fn test_companion_names_are_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(None);

        // Older recordings whose raw file was already converted away
        let now = chrono::Utc::now().timestamp_millis();
        for offset in 0..50 {
            std::fs::write(dir.path().join(format!("{}.mp4", now + offset)), b"old").unwrap();
        }

        for _ in 0..10 {
            let path = resolver.allocate_output_path_with(dir.path(), "h264", &["mp4"]);
            assert!(!path.exists());
            assert!(!path.with_extension("mp4").exists());
        }
    }

    #[tokio::test]
    async fn test_resolve_root_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("a").join("b").join("recordings");
        let resolver = PathResolver::new(Some(root.clone()));

        assert_eq!(resolver.resolve_root().await.unwrap(), root);
        assert!(root.is_dir());
        // Pre-existing directory is fine
        assert_eq!(resolver.resolve_root().await.unwrap(), root);
        assert!(!root.join(WRITE_PROBE_NAME).exists());
    }

    #[tokio::test]
    async fn test_resolve_root_fails_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let resolver = PathResolver::new(Some(blocker.join("recordings")));
        let err = resolver.resolve_root().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StorageError);
    }

    #[tokio::test]
    async fn test_list_recordings_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("200.mp4"), b"b").unwrap();
        std::fs::write(dir.path().join("100.mp4"), b"a").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = list_recordings(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["100.mp4", "200.mp4"]);
    }
}
