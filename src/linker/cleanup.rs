//! Local credential store removal.

use std::path::Path;
use tracing::{debug, info, warn};

/// Recursively delete a credential store directory.
///
/// A missing path is a no-op. Errors are logged, never returned.
pub async fn remove_store(path: &Path) -> bool {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("removed credential store {}", path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("failed to remove credential store {}: {e}", path.display());
            false
        }
    }
}

/// Remove every store left behind under `sessions_dir` by a previous run.
pub async fn clear_leftovers(sessions_dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(sessions_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("cannot scan {}: {e}", sessions_dir.display());
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir && remove_store(&entry.path()).await {
                    removed += 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("error scanning {}: {e}", sessions_dir.display());
                break;
            }
        }
    }

    if removed > 0 {
        info!("removed {removed} leftover credential store(s)");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_store_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let store = tmp.path().join("15551234567");
        std::fs::create_dir_all(store.join("nested")).unwrap();
        std::fs::write(store.join("creds.json"), "{}").unwrap();
        std::fs::write(store.join("nested/pre-key-1.json"), "{}").unwrap();

        assert!(remove_store(&store).await);
        assert!(!store.exists());
        // Second call is a no-op.
        assert!(!remove_store(&store).await);
    }

    #[tokio::test]
    async fn test_clear_leftovers_only_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a")).unwrap();
        std::fs::create_dir_all(tmp.path().join("qr_b")).unwrap();
        std::fs::write(tmp.path().join("README"), "keep").unwrap();

        assert_eq!(clear_leftovers(tmp.path()).await, 2);
        assert!(tmp.path().join("README").exists());
        assert_eq!(clear_leftovers(&tmp.path().join("missing")).await, 0);
    }
}
