use crate::blocks::{content_hash, Page};
use crate::cache::SharedCache;
use crate::config::{ConfigError, SyncConfig};
use crate::db::{CacheError, PageRecord};
use crate::executor::{Executor, SyncOutcome};
use crate::format::{Formatter, LineFormatter};
use crate::plan::{compute_plan, SyncPlan};
use crate::remote::{HttpRemote, RemoteError, RemotePage, RemoteStore};
use crate::session::{Session, SessionArena, SessionHandle};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session is no longer active")]
    StaleSession,
    #[error("sync already in progress for page {0}")]
    SyncInProgress(String),
    #[error("page was loaded again while this load was running")]
    Superseded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSource {
    Cache,
    Remote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenedPage {
    pub handle: SessionHandle,
    pub source: PageSource,
}

/// Entry point tying sessions, the remote store, the cache and the formatter
/// together.
pub struct SyncEngine {
    sessions: Mutex<SessionArena>,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<SharedCache>,
    formatter: Arc<dyn Formatter>,
    executor: Executor,
    cache_ttl: Duration,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<SharedCache>,
        formatter: Arc<dyn Formatter>,
        cache_ttl: Duration,
    ) -> Self {
        let executor = Executor::new(remote.clone(), cache.clone(), formatter.clone());
        Self {
            sessions: Mutex::new(SessionArena::new()),
            remote,
            cache,
            formatter,
            executor,
            cache_ttl,
        }
    }

    /// HTTP remote, on-disk cache and the line formatter, as configured.
    pub fn from_config(config: &SyncConfig) -> Result<Self, EngineError> {
        let remote = HttpRemote::new(
            config.api_base_url.clone(),
            config.token()?,
            config.api_version.clone(),
            config.page_size,
        );
        let cache = Arc::new(SharedCache::new());
        cache.init(&config.resolved_cache_path()?)?;
        Ok(Self::new(
            Arc::new(remote),
            cache,
            Arc::new(LineFormatter),
            Duration::from_secs(config.cache_ttl_secs),
        ))
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Opens a session for `page_id`, from the cache when its content is younger
    /// than the TTL and from the remote store otherwise.
    pub async fn open_page(&self, page_id: &str) -> Result<OpenedPage, EngineError> {
        let handle = self
            .sessions
            .lock()
            .open(Session::new(Page::new(Some(page_id.to_string()), "")));

        if self.load_cached(handle, page_id) {
            self.record_open(page_id);
            info!(page_id, source = "cache", "page opened");
            return Ok(OpenedPage {
                handle,
                source: PageSource::Cache,
            });
        }

        match self.load_remote(handle, page_id).await {
            Ok(()) => {
                self.record_open(page_id);
                info!(page_id, source = "remote", "page opened");
                Ok(OpenedPage {
                    handle,
                    source: PageSource::Remote,
                })
            }
            Err(err) => {
                self.sessions.lock().close(handle);
                Err(err)
            }
        }
    }

    /// Re-reads the page from the remote store, replacing buffer and snapshot.
    /// Refused while a sync of this session is running.
    pub async fn reload(&self, handle: SessionHandle) -> Result<(), EngineError> {
        let page_id = self
            .with_session(handle, |session| session.page.id.clone())?
            .ok_or(EngineError::StaleSession)?;
        self.load_remote(handle, &page_id).await
    }

    fn load_cached(&self, handle: SessionHandle, page_id: &str) -> bool {
        if !self.cache.is_initialized() {
            return false;
        }
        let cached = self.cache.with(|db| {
            let fresh = db
                .get_cache_age(page_id)?
                .is_some_and(|age| age < self.cache_ttl);
            if !fresh {
                return Ok(None);
            }
            Ok(db.get_content(page_id)?.zip(db.get_page(page_id)?))
        });
        let (content, record) = match cached {
            Ok(Some(found)) => found,
            Ok(None) => return false,
            Err(err) => {
                warn!(page_id, error = %err, "cache read failed, falling back to remote");
                return false;
            }
        };

        let mut arena = self.sessions.lock();
        let Some(session) = arena.get_mut(handle) else {
            return false;
        };
        session.page.title = record.title;
        session.page.icon = record.icon;
        session.page.parent = record.parent;
        session.page.content_hash = Some(content.content_hash);
        session.load(content.blocks, self.formatter.as_ref());
        true
    }

    async fn load_remote(&self, handle: SessionHandle, page_id: &str) -> Result<(), EngineError> {
        let epoch = self.with_session(handle, |session| {
            if session.is_syncing() {
                return Err(EngineError::SyncInProgress(page_id.to_string()));
            }
            Ok(session.load_epoch())
        })??;
        debug!(page_id, "fetching page");
        let (page, blocks) = futures::try_join!(
            self.remote.fetch_page(page_id),
            self.remote.fetch_children(page_id)
        )?;
        let hash = content_hash(&blocks);

        {
            let mut arena = self.sessions.lock();
            let Some(session) = arena.get_mut(handle) else {
                warn!(page_id, "page load finished after its session closed, dropped");
                return Err(EngineError::StaleSession);
            };
            if session.is_syncing() {
                warn!(page_id, "page load finished during a sync, dropped");
                return Err(EngineError::SyncInProgress(page_id.to_string()));
            }
            if session.load_epoch() != epoch {
                warn!(page_id, "page load finished after a newer one, dropped");
                return Err(EngineError::Superseded);
            }
            session.page.title = page.title.clone();
            session.page.icon = page.icon.clone();
            session.page.parent = page.parent.clone();
            session.page.content_hash = Some(hash);
            session.page.last_synced_at = Some(Utc::now().timestamp_millis());
            session.load(blocks.clone(), self.formatter.as_ref());
        }

        if self.cache.is_initialized() {
            let written = self.cache.with(|db| {
                db.save_page(&page_record(&page))?;
                db.save_content(page_id, &blocks)
            });
            if let Err(err) = written {
                warn!(page_id, error = %err, "failed to cache fetched page");
            }
        }
        Ok(())
    }

    fn record_open(&self, page_id: &str) {
        if !self.cache.is_initialized() {
            return;
        }
        if let Err(err) = self.cache.with(|db| db.record_open(page_id)) {
            warn!(page_id, error = %err, "failed to record page open");
        }
    }

    pub fn with_session<T>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&Session) -> T,
    ) -> Result<T, EngineError> {
        let arena = self.sessions.lock();
        let session = arena.get(handle).ok_or(EngineError::StaleSession)?;
        Ok(f(session))
    }

    fn with_session_mut<T>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&mut Session, &dyn Formatter) -> T,
    ) -> Result<T, EngineError> {
        let mut arena = self.sessions.lock();
        let session = arena.get_mut(handle).ok_or(EngineError::StaleSession)?;
        Ok(f(session, self.formatter.as_ref()))
    }

    /// Replaces lines `start..end`. Returns the ids of non-editable blocks the edit
    /// touched, which have been restored.
    pub fn edit(
        &self,
        handle: SessionHandle,
        start: usize,
        end: usize,
        lines: Vec<String>,
    ) -> Result<Vec<String>, EngineError> {
        let reverted = self.with_session_mut(handle, |session, formatter| {
            session.apply_edit(start, end, lines, formatter)
        })?;
        if !reverted.is_empty() {
            info!(blocks = ?reverted, "reverted edits to read-only blocks");
        }
        Ok(reverted)
    }

    pub fn set_lines(
        &self,
        handle: SessionHandle,
        lines: Vec<String>,
    ) -> Result<Vec<String>, EngineError> {
        self.with_session_mut(handle, |session, formatter| {
            session.set_all_lines(lines, formatter)
        })
    }

    pub fn lines(&self, handle: SessionHandle) -> Result<Vec<String>, EngineError> {
        self.with_session(handle, |session| session.lines().to_vec())
    }

    pub fn plan(&self, handle: SessionHandle) -> Result<SyncPlan, EngineError> {
        self.with_session(handle, |session| {
            compute_plan(session.blocks(), session.synced())
        })
    }

    pub async fn execute(&self, handle: SessionHandle, plan: SyncPlan) -> SyncOutcome {
        self.executor.execute(&self.sessions, handle, plan).await
    }

    pub async fn sync(&self, handle: SessionHandle) -> Result<SyncOutcome, EngineError> {
        let plan = self.plan(handle)?;
        Ok(self.execute(handle, plan).await)
    }

    /// Ids of blocks whose content differs from what the cache last stored, plus
    /// placeholders of blocks the cache has never seen.
    pub fn changed_since_cache(&self, handle: SessionHandle) -> Result<Vec<String>, EngineError> {
        let (page_id, current) = self.with_session(handle, |session| {
            let current: Vec<(String, Option<String>)> = session
                .blocks()
                .iter()
                .map(|block| {
                    let hash = block.to_synced().map(|synced| synced.content_hash());
                    (block.block_ref().as_str().to_string(), hash)
                })
                .collect();
            (session.page.id.clone(), current)
        })?;
        let Some(page_id) = page_id else {
            return Ok(current.into_iter().map(|(id, _)| id).collect());
        };
        let stored = self.cache.with(|db| db.block_hashes(&page_id))?;
        Ok(current
            .into_iter()
            .filter(|(id, hash)| match hash {
                Some(hash) => stored.get(id) != Some(hash),
                None => true,
            })
            .map(|(id, _)| id)
            .collect())
    }

    pub fn close(&self, handle: SessionHandle) -> bool {
        self.sessions.lock().close(handle).is_some()
    }
}

fn page_record(page: &RemotePage) -> PageRecord {
    PageRecord {
        icon: page.icon.clone(),
        parent: page.parent.clone(),
        ..PageRecord::new(page.id.clone(), page.title.clone())
    }
}
