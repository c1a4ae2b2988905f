use crate::blocks::SyncedBlock;
use crate::db::{CacheDb, CacheError, ContentWrite};
use crate::executor::SyncCache;
use parking_lot::Mutex;
use std::path::Path;
use tracing::info;

/// Process-wide cache connection with explicit init and teardown. Until `init`
/// succeeds every operation reports [`CacheError::NotInitialized`].
#[derive(Default)]
pub struct SharedCache {
    db: Mutex<Option<CacheDb>>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self, path: &Path) -> Result<(), CacheError> {
        let db = CacheDb::open(path)?;
        *self.db.lock() = Some(db);
        info!(path = %path.display(), "cache opened");
        Ok(())
    }

    pub fn init_in_memory(&self) -> Result<(), CacheError> {
        *self.db.lock() = Some(CacheDb::new_in_memory()?);
        Ok(())
    }

    /// Closes the connection. Returns false when nothing was open.
    pub fn teardown(&self) -> bool {
        self.db.lock().take().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.db.lock().is_some()
    }

    pub fn with<T>(
        &self,
        f: impl FnOnce(&CacheDb) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let guard = self.db.lock();
        let db = guard.as_ref().ok_or(CacheError::NotInitialized)?;
        f(db)
    }
}

impl SyncCache for SharedCache {
    fn is_initialized(&self) -> bool {
        SharedCache::is_initialized(self)
    }

    fn save_content(
        &self,
        page_id: &str,
        blocks: &[SyncedBlock],
    ) -> Result<ContentWrite, CacheError> {
        self.with(|db| db.save_content(page_id, blocks))
    }

    fn mark_pushed(&self, page_id: &str, hash: &str) -> Result<(), CacheError> {
        self.with(|db| db.mark_pushed(page_id, hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_fail_until_initialized() {
        let cache = SharedCache::new();
        assert!(!cache.is_initialized());
        assert!(matches!(
            cache.with(|db| db.has_page("p1")),
            Err(CacheError::NotInitialized)
        ));

        cache.init_in_memory().expect("init");
        assert!(cache.with(|db| db.has_page("p1")).is_ok());

        assert!(cache.teardown());
        assert!(!cache.teardown());
        assert!(!cache.is_initialized());
    }

    #[test]
    fn sync_cache_writes_through() {
        let cache = SharedCache::new();
        cache.init_in_memory().expect("init");

        let write = SyncCache::save_content(&cache, "p1", &[]).expect("save");
        SyncCache::mark_pushed(&cache, "p1", write.hash()).expect("mark");

        let pushed = cache.with(|db| db.last_pushed_hash("p1")).expect("hash");
        assert_eq!(pushed.as_deref(), Some(write.hash()));
    }
}
