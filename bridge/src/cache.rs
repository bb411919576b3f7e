//! Attachment de-duplication cache.
//!
//! Remembers, per thread, which remote URL a given file content was uploaded
//! to, so a message quoting earlier attachments does not upload them again.
//! Entries are plain files: `<root>/<thread>/<sha256 of content>` holding the
//! URL. Every failure degrades to a cache miss.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AttachmentCache {
    root: PathBuf,
}

impl AttachmentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache view for a single thread, owned by one ingestion call.
    ///
    /// Ids that are not plain directory names are stored under the hash of
    /// the raw id, so no id maps onto the root or onto another id.
    pub fn scope(&self, thread_id: &str) -> ThreadCache {
        let plain = !thread_id.is_empty()
            && thread_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let name = if plain {
            thread_id.to_string()
        } else {
            format!("h_{}", hex::encode(Sha256::digest(thread_id.as_bytes())))
        };
        ThreadCache {
            dir: self.root.join(name),
            current: None,
        }
    }
}

#[derive(Debug)]
struct Lookup {
    hash: String,
    url: Option<String>,
}

#[derive(Debug)]
pub struct ThreadCache {
    dir: PathBuf,
    current: Option<Lookup>,
}

impl ThreadCache {
    /// Look `content` up. The lookup becomes the current entry that
    /// `current_url` and `save` refer to.
    pub async fn has(&mut self, content: &[u8]) -> bool {
        let hash = hex::encode(Sha256::digest(content));
        let url = match tokio::fs::read_to_string(self.dir.join(&hash)).await {
            Ok(url) if !url.trim().is_empty() => Some(url.trim().to_string()),
            _ => None,
        };
        let hit = url.is_some();
        self.current = Some(Lookup { hash, url });
        hit
    }

    pub fn current_url(&self) -> Option<&str> {
        self.current.as_ref()?.url.as_deref()
    }

    /// Record `url` for the content of the last lookup.
    pub async fn save(&mut self, url: &str) {
        let Some(current) = self.current.as_mut() else {
            warn!(url = %url, "attachment_cache_save_without_lookup");
            return;
        };
        current.url = Some(url.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "attachment_cache_mkdir_failed");
            return;
        }
        let path = self.dir.join(&current.hash);
        if let Err(e) = tokio::fs::write(&path, url).await {
            warn!(file = %path.display(), error = %e, "attachment_cache_write_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path());

        let mut scope = cache.scope("card1");
        assert!(!scope.has(b"file bytes").await);
        assert_eq!(scope.current_url(), None);
        scope.save("https://board.test/a1").await;

        let mut scope = cache.scope("card1");
        assert!(scope.has(b"file bytes").await);
        assert_eq!(scope.current_url(), Some("https://board.test/a1"));
        assert!(!scope.has(b"other bytes").await);
        assert_eq!(scope.current_url(), None);
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path());

        let mut first = cache.scope("card1");
        first.has(b"same").await;
        first.save("https://board.test/a1").await;

        let mut second = cache.scope("card2");
        assert!(!second.has(b"same").await);
    }

    #[tokio::test]
    async fn test_save_without_lookup_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut scope = AttachmentCache::new(dir.path()).scope("../escape");
        scope.save("https://board.test/a1").await;
        assert_eq!(scope.current_url(), None);
        assert!(scope.dir.starts_with(dir.path()));
        assert_ne!(scope.dir, dir.path());
    }

    #[tokio::test]
    async fn test_unusual_thread_ids_get_their_own_scope() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AttachmentCache::new(dir.path());

        let empty = cache.scope("");
        let parent = cache.scope("../");
        let slashed = cache.scope("a/b");
        let plain = cache.scope("ab");
        for scope in [&empty, &parent, &slashed] {
            assert_eq!(scope.dir.parent(), Some(dir.path()));
        }
        assert_ne!(empty.dir, parent.dir);
        assert_ne!(slashed.dir, plain.dir);

        let mut first = cache.scope("");
        first.has(b"same").await;
        first.save("https://board.test/a1").await;
        let mut second = cache.scope("../");
        assert!(!second.has(b"same").await);
    }
}
