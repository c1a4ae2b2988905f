use crate::blocks::{content_hash, wire_block, BlockRef, SyncedBlock};
use crate::db::{CacheError, ContentWrite};
use crate::format::Formatter;
use crate::plan::{CreateOp, SyncPlan, TypeChangeOp, UpdateOp};
use crate::remote::{RemoteError, RemoteStore};
use crate::session::{Session, SessionArena, SessionHandle};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Write side of the cache as the executor sees it.
pub trait SyncCache: Send + Sync {
    fn is_initialized(&self) -> bool;
    fn save_content(
        &self,
        page_id: &str,
        blocks: &[SyncedBlock],
    ) -> Result<ContentWrite, CacheError>;
    fn mark_pushed(&self, page_id: &str, hash: &str) -> Result<(), CacheError>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncOutcome {
    /// True only when every operation in the plan succeeded.
    pub ok: bool,
    pub errors: Vec<String>,
    /// Placeholders of blocks whose remote copy was deleted by a type change that
    /// could not be re-created.
    pub stranded: Vec<String>,
    /// Ambiguous regions left for the caller to resolve.
    pub unmatched: usize,
    /// Hash of the snapshot after a fully successful sync.
    pub content_hash: Option<String>,
    /// Synced blocks that sit somewhere else on the remote page than in the
    /// buffer. A block created at the top of a non-empty page has no anchor and
    /// is appended remotely; a relinked block keeps its old remote position.
    /// Neither is moved back.
    pub misplaced: Vec<String>,
}

impl SyncOutcome {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            errors: vec![message.into()],
            ..Self::default()
        }
    }

    fn fail(&mut self, message: String) {
        warn!(%message, "sync operation failed");
        self.ok = false;
        self.errors.push(message);
    }
}

enum Completion {
    Updated {
        op: UpdateOp,
        result: Result<(), RemoteError>,
    },
    Deleted {
        id: String,
        result: Result<(), RemoteError>,
    },
}

enum Placement {
    Create(CreateOp),
    Retype(TypeChangeOp),
}

impl Placement {
    fn position(&self) -> usize {
        match self {
            Placement::Create(op) => op.position,
            Placement::Retype(op) => op.position,
        }
    }
}

const SESSION_GONE: &str = "Session closed or reloaded during sync; remaining results discarded";

/// A sync that passed its precondition checks. Holds the page in the executor's
/// in-flight set and the session's flag until dropped, so an early return or a
/// cancelled future releases both.
struct InFlight<'a> {
    sessions: &'a Mutex<SessionArena>,
    handle: SessionHandle,
    epoch: u64,
    page_id: String,
    syncing: &'a Mutex<HashSet<String>>,
    formatter: &'a dyn Formatter,
}

impl InFlight<'_> {
    /// Runs `f` against the session the sync started on. `None` once it was
    /// closed or loaded again since.
    fn with<T>(&self, f: impl FnOnce(&mut Session, &dyn Formatter) -> T) -> Option<T> {
        let mut arena = self.sessions.lock();
        let session = arena
            .get_mut(self.handle)
            .filter(|session| session.load_epoch() == self.epoch)?;
        Some(f(session, self.formatter))
    }

    fn is_current(&self) -> bool {
        self.with(|_, _| ()).is_some()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.syncing.lock().remove(&self.page_id);
        if let Some(session) = self.sessions.lock().get_mut(self.handle) {
            session.sync_in_flight = false;
        }
    }
}

/// Applies sync plans to the remote store and folds the results back into the
/// session. Tracks which pages have a sync running; clones share that set.
#[derive(Clone)]
pub struct Executor {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn SyncCache>,
    formatter: Arc<dyn Formatter>,
    syncing: Arc<Mutex<HashSet<String>>>,
}

impl Executor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn SyncCache>,
        formatter: Arc<dyn Formatter>,
    ) -> Self {
        Self {
            remote,
            cache,
            formatter,
            syncing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Runs `plan` for the session behind `handle` and reports once.
    ///
    /// Only one sync per page runs at a time, whichever session asks. Updates and
    /// deletes are issued together and committed in completion order. Creates and
    /// type changes follow one call at a time in document order so a create
    /// anchored on another pending create sees its resolved id. Every commit first
    /// checks that the session is still open and has not been loaded again; if it
    /// has, the remaining results are dropped and no further calls are made.
    pub async fn execute(
        &self,
        sessions: &Mutex<SessionArena>,
        handle: SessionHandle,
        plan: SyncPlan,
    ) -> SyncOutcome {
        let flight = match self.begin(sessions, handle, &plan) {
            Ok(flight) => flight,
            Err(message) => {
                warn!(%message, "sync rejected");
                return SyncOutcome::rejected(message);
            }
        };
        let page_id = flight.page_id.as_str();
        debug!(
            page_id,
            operations = plan.operation_count(),
            "executing sync plan"
        );

        let SyncPlan {
            creates,
            updates,
            deletes,
            type_changes,
            relinks: _,
            unmatched,
        } = plan;
        let mut outcome = SyncOutcome {
            ok: true,
            unmatched: unmatched.len(),
            ..SyncOutcome::default()
        };

        let mut pending: FuturesUnordered<BoxFuture<'static, Completion>> =
            FuturesUnordered::new();
        for op in updates {
            let remote = Arc::clone(&self.remote);
            pending.push(
                async move {
                    let wire = wire_block(Some(&op.id), &op.kind, &op.content);
                    let result = remote.update(&op.id, wire).await;
                    Completion::Updated { op, result }
                }
                .boxed(),
            );
        }
        for op in deletes {
            let remote = Arc::clone(&self.remote);
            pending.push(
                async move {
                    let result = remote.delete(&op.id).await;
                    Completion::Deleted { id: op.id, result }
                }
                .boxed(),
            );
        }

        let mut active = true;
        while let Some(completion) = pending.next().await {
            if !active {
                continue;
            }
            active = commit_completion(&flight, completion, &mut outcome);
        }

        let mut placements: Vec<Placement> = creates
            .into_iter()
            .map(Placement::Create)
            .chain(type_changes.into_iter().map(Placement::Retype))
            .collect();
        placements.sort_by_key(Placement::position);

        let mut resolved: HashMap<BlockRef, Option<String>> = HashMap::new();
        for placement in placements {
            if !active {
                break;
            }
            active = match placement {
                Placement::Create(op) => {
                    self.place_create(&flight, op, &mut resolved, &mut outcome)
                        .await
                }
                Placement::Retype(op) => {
                    self.place_retype(&flight, op, &mut resolved, &mut outcome)
                        .await
                }
            };
        }

        if !active {
            warn!(page_id, "session closed or reloaded during sync");
            outcome.ok = false;
            outcome.errors.push(SESSION_GONE.to_string());
            return outcome;
        }
        self.finish(&flight, outcome)
    }

    /// Precondition checks and the in-flight markers. Relinks are local only, so
    /// they are committed here before any remote call.
    fn begin<'a>(
        &'a self,
        sessions: &'a Mutex<SessionArena>,
        handle: SessionHandle,
        plan: &SyncPlan,
    ) -> Result<InFlight<'a>, String> {
        let mut arena = sessions.lock();
        let session = arena
            .get_mut(handle)
            .ok_or_else(|| "Cannot sync: session is no longer active".to_string())?;
        let page_id = session
            .page
            .id
            .clone()
            .ok_or_else(|| "Cannot sync: page has no page_id".to_string())?;
        if session.sync_in_flight || !self.syncing.lock().insert(page_id.clone()) {
            return Err(format!("Sync already in progress for page {page_id}"));
        }
        session.sync_in_flight = true;
        for relink in &plan.relinks {
            session.commit_relinked(&relink.temp_id, &relink.id, self.formatter.as_ref());
        }
        Ok(InFlight {
            sessions,
            handle,
            epoch: session.load_epoch(),
            page_id,
            syncing: &self.syncing,
            formatter: self.formatter.as_ref(),
        })
    }

    async fn place_create(
        &self,
        flight: &InFlight<'_>,
        op: CreateOp,
        resolved: &mut HashMap<BlockRef, Option<String>>,
        outcome: &mut SyncOutcome,
    ) -> bool {
        let block_ref = BlockRef::Temp(op.temp_id.clone());
        let anchor = resolve_anchor(op.anchor.as_ref(), resolved);
        match self.create_one(&flight.page_id, &op, anchor.as_deref()).await {
            Ok(id) => {
                let committed = flight.with(|session, formatter| {
                    session.commit_created(
                        &block_ref,
                        &id,
                        op.kind,
                        op.content,
                        anchor.as_deref(),
                        formatter,
                    )
                });
                resolved.insert(block_ref, Some(id));
                committed.is_some()
            }
            Err(err) => {
                outcome.fail(format!("Create failed: {err}"));
                // Later blocks anchored here fall back to this block's own anchor.
                resolved.insert(block_ref, anchor);
                flight.is_current()
            }
        }
    }

    async fn place_retype(
        &self,
        flight: &InFlight<'_>,
        op: TypeChangeOp,
        resolved: &mut HashMap<BlockRef, Option<String>>,
        outcome: &mut SyncOutcome,
    ) -> bool {
        let block_ref = BlockRef::Remote(op.id.clone());
        let anchor = resolve_anchor(op.anchor.as_ref(), resolved);

        if let Err(err) = self.remote.delete(&op.id).await {
            outcome.fail(format!("Type change failed for {}: {err}", op.id));
            return flight.is_current();
        }
        if flight.with(|session, _| session.commit_deleted(&op.id)).is_none() {
            return false;
        }

        let create = CreateOp {
            temp_id: op.id.clone(),
            kind: op.new_type,
            content: op.content,
            anchor: op.anchor.clone(),
            position: op.position,
        };
        match self.create_one(&flight.page_id, &create, anchor.as_deref()).await {
            Ok(id) => {
                let committed = flight.with(|session, formatter| {
                    session.commit_created(
                        &block_ref,
                        &id,
                        create.kind,
                        create.content,
                        anchor.as_deref(),
                        formatter,
                    )
                });
                resolved.insert(block_ref, Some(id));
                committed.is_some()
            }
            Err(err) => {
                resolved.insert(block_ref, anchor);
                let Some(temp_id) = flight.with(|session, _| session.commit_stranded(&op.id))
                else {
                    return false;
                };
                let pending = temp_id.unwrap_or_default();
                outcome.fail(format!(
                    "Type change stranded block {}: deleted remotely but re-create failed: {err}; \
                     it is now pending create {pending}",
                    op.id
                ));
                outcome.stranded.push(pending);
                true
            }
        }
    }

    async fn create_one(
        &self,
        page_id: &str,
        op: &CreateOp,
        anchor: Option<&str>,
    ) -> Result<String, RemoteError> {
        let wire = wire_block(None, &op.kind, &op.content);
        debug!(page_id, temp_id = %op.temp_id, anchor, "creating block");
        let ids = self.remote.create(page_id, vec![wire], anchor).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| RemoteError::Decode("create returned no id".to_string()))
    }

    fn finish(&self, flight: &InFlight<'_>, mut outcome: SyncOutcome) -> SyncOutcome {
        let page_id = flight.page_id.as_str();
        let ok = outcome.ok;
        let committed = flight.with(|session, _| {
            let misplaced = session.misplaced_blocks();
            if !ok {
                return (None, misplaced);
            }
            let snapshot = session.synced().to_vec();
            session.page.content_hash = Some(content_hash(&snapshot));
            session.page.last_synced_at = Some(Utc::now().timestamp_millis());
            (Some(snapshot), misplaced)
        });
        let Some((snapshot, misplaced)) = committed else {
            outcome.ok = false;
            outcome.errors.push(SESSION_GONE.to_string());
            return outcome;
        };

        if !misplaced.is_empty() {
            warn!(page_id, blocks = ?misplaced, "remote block order differs from the buffer");
        }
        outcome.misplaced = misplaced;

        if let Some(snapshot) = snapshot {
            let hash = content_hash(&snapshot);
            if self.cache.is_initialized() {
                match self.cache.save_content(page_id, &snapshot) {
                    Ok(write) => {
                        if let Err(err) = self.cache.mark_pushed(page_id, write.hash()) {
                            warn!(page_id, error = %err, "failed to record pushed hash");
                        }
                    }
                    Err(err) => warn!(page_id, error = %err, "failed to cache synced content"),
                }
            }
            outcome.content_hash = Some(hash);
        }

        info!(
            page_id,
            ok = outcome.ok,
            errors = outcome.errors.len(),
            stranded = outcome.stranded.len(),
            misplaced = outcome.misplaced.len(),
            unmatched = outcome.unmatched,
            "sync finished"
        );
        outcome
    }
}

fn commit_completion(
    flight: &InFlight<'_>,
    completion: Completion,
    outcome: &mut SyncOutcome,
) -> bool {
    match completion {
        Completion::Updated { op, result } => match result {
            Ok(()) => flight
                .with(|session, formatter| {
                    session.commit_updated(&op.id, op.kind, op.content, formatter)
                })
                .is_some(),
            Err(err) => {
                outcome.fail(format!("Update failed for {}: {err}", op.id));
                true
            }
        },
        Completion::Deleted { id, result } => match result {
            Ok(()) => flight
                .with(|session, _| session.commit_deleted(&id))
                .is_some(),
            Err(err) => {
                outcome.fail(format!("Delete failed for {id}: {err}"));
                true
            }
        },
    }
}

fn resolve_anchor(
    anchor: Option<&BlockRef>,
    resolved: &HashMap<BlockRef, Option<String>>,
) -> Option<String> {
    let anchor = anchor?;
    match resolved.get(anchor) {
        Some(id) => id.clone(),
        None => match anchor {
            BlockRef::Remote(id) => Some(id.clone()),
            BlockRef::Temp(temp_id) => {
                warn!(%temp_id, "anchor was never placed, appending instead");
                None
            }
        },
    }
}
