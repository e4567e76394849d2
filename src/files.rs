use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::warn;
use ulid::Ulid;

/// Storage for documents uploaded with a claim.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Park an upload until the claim is confirmed. Returns the temporary path.
    async fn stage_temp(&self, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf>;

    /// Copy a staged upload next to the window it belongs to. Returns the permanent
    /// path. The staged copy stays until `cleanup`, so a failed confirmation can retry.
    async fn promote(&self, temp_path: &Path, window_id: Ulid) -> io::Result<PathBuf>;

    /// Best-effort removal.
    async fn cleanup(&self, paths: &[PathBuf]);

    /// Remove staged uploads older than `max_age`. Returns how many were removed.
    async fn purge_staged(&self, max_age: Duration) -> io::Result<usize>;
}

/// Keep only characters that are safe in a single path component.
fn sanitize_file_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    let safe = safe.trim_start_matches('.');
    if safe.is_empty() {
        "upload".to_string()
    } else {
        safe.to_string()
    }
}

/// `<root>/tmp/<ulid>-<name>` while staged, `<root>/windows/<window_id>/<name>` once promoted.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn window_dir(&self, window_id: Ulid) -> PathBuf {
        self.root.join("windows").join(window_id.to_string())
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn stage_temp(&self, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let dir = self.temp_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}-{}", Ulid::new(), sanitize_file_name(file_name)));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    async fn promote(&self, temp_path: &Path, window_id: Ulid) -> io::Result<PathBuf> {
        if !temp_path.starts_with(self.temp_dir()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path is not a staged upload",
            ));
        }
        let staged_name = temp_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad staged file name"))?;
        // Strip the "<ulid>-" staging prefix.
        let final_name = staged_name
            .split_once('-')
            .map_or(staged_name, |(_, rest)| rest);
        let dir = self.window_dir(window_id);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(final_name);
        tokio::fs::copy(temp_path, &dest).await?;
        Ok(dest)
    }

    async fn cleanup(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), "file cleanup failed: {e}");
            }
        }
    }

    async fn purge_staged(&self, max_age: Duration) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(self.temp_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut stale = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let modified = entry.metadata().await?.modified()?;
            if modified <= cutoff {
                stale.push(entry.path());
            }
        }
        self.cleanup(&stale).await;
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("slotbook_test_files")
            .join(format!("{name}_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_file_name("safety form.pdf"), "safetyform.pdf");
        assert_eq!(sanitize_file_name("///"), "upload");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }

    #[tokio::test]
    async fn stage_then_promote() {
        let store = LocalFileStore::new(test_root("promote"));
        let temp = store.stage_temp("permit.pdf", b"%PDF").await.unwrap();
        assert!(temp.exists());

        let window_id = Ulid::new();
        let dest = store.promote(&temp, window_id).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF");
        assert!(dest.ends_with(format!("windows/{window_id}/permit.pdf")));

        // The staged copy survives promotion until cleaned up.
        assert!(temp.exists());
        store.cleanup(&[temp.clone()]).await;
        assert!(!temp.exists());
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn purge_removes_only_old_staged_files() {
        let store = LocalFileStore::new(test_root("purge"));
        assert_eq!(store.purge_staged(Duration::ZERO).await.unwrap(), 0);

        let temp = store.stage_temp("old.pdf", b"x").await.unwrap();
        assert_eq!(store.purge_staged(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(temp.exists());

        assert_eq!(store.purge_staged(Duration::ZERO).await.unwrap(), 1);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn promote_rejects_foreign_paths() {
        let root = test_root("foreign");
        let store = LocalFileStore::new(root.clone());
        let outside = root.join("elsewhere.txt");
        std::fs::write(&outside, b"x").unwrap();
        let result = store.promote(&outside, Ulid::new()).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn cleanup_ignores_missing() {
        let store = LocalFileStore::new(test_root("cleanup"));
        let temp = store.stage_temp("a.txt", b"a").await.unwrap();
        store
            .cleanup(&[temp.clone(), PathBuf::from("/nonexistent/slotbook")])
            .await;
        assert!(!temp.exists());
    }
}
