//! Scriptable in-memory [`RemoteStore`] used by the engine's tests and for dry runs.

use super::{RemoteError, RemotePage, RemoteStore};
use crate::blocks::{ParentRef, SyncedBlock};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCall {
    Create {
        parent_id: String,
        children: Vec<Value>,
        anchor: Option<String>,
    },
    Update {
        id: String,
        block: Value,
    },
    Delete {
        id: String,
    },
    FetchPage {
        id: String,
    },
    FetchChildren {
        id: String,
    },
}

#[derive(Default)]
struct State {
    pages: HashMap<String, RemotePage>,
    children: HashMap<String, Vec<SyncedBlock>>,
    calls: Vec<RemoteCall>,
    queued_ids: VecDeque<String>,
    next_id: u64,
    failing_blocks: HashSet<String>,
    failing_creates: Vec<String>,
    fail_fetches: bool,
    delays: HashMap<String, Duration>,
}

/// Records every call and applies it to its own copy of the pages, so a test can
/// read back what the remote side would now hold.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<State>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_page(&self, id: &str, title: &str, blocks: Vec<SyncedBlock>) {
        let mut state = self.state.lock();
        state.pages.insert(
            id.to_string(),
            RemotePage {
                id: id.to_string(),
                title: title.to_string(),
                icon: None,
                parent: ParentRef::Workspace,
                last_edited_time: None,
            },
        );
        state.children.insert(id.to_string(), blocks);
    }

    /// Ids handed out by the next creates, in order. Afterwards ids are generated.
    pub fn push_created_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .queued_ids
            .extend(ids.into_iter().map(Into::into));
    }

    /// Creates whose serialized children contain `needle` fail with a 400.
    pub fn fail_creates_containing(&self, needle: &str) {
        self.state.lock().failing_creates.push(needle.to_string());
    }

    /// Updates and deletes of `id` fail.
    pub fn fail_block(&self, id: &str) {
        self.state.lock().failing_blocks.insert(id.to_string());
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.state.lock().fail_fetches = fail;
    }

    /// Holds calls targeting `id` (block id for update/delete, page id otherwise)
    /// for `delay` before completing.
    pub fn delay(&self, id: &str, delay: Duration) {
        self.state.lock().delays.insert(id.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn create_calls(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, RemoteCall::Create { .. }))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn children(&self, page_id: &str) -> Vec<SyncedBlock> {
        self.state
            .lock()
            .children
            .get(page_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn hold(&self, id: &str) {
        let delay = self.state.lock().delays.get(id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn not_found(id: &str) -> RemoteError {
    RemoteError::Http {
        status: 404,
        message: format!("Could not find block with ID: {id}"),
    }
}

fn rejected(message: &str) -> RemoteError {
    RemoteError::Http {
        status: 400,
        message: message.to_string(),
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn create(
        &self,
        parent_id: &str,
        children: Vec<Value>,
        anchor: Option<&str>,
    ) -> Result<Vec<String>, RemoteError> {
        self.state.lock().calls.push(RemoteCall::Create {
            parent_id: parent_id.to_string(),
            children: children.clone(),
            anchor: anchor.map(str::to_string),
        });
        self.hold(parent_id).await;

        let mut state = self.state.lock();
        let serialized: Vec<String> = children.iter().map(Value::to_string).collect();
        if state
            .failing_creates
            .iter()
            .any(|needle| serialized.iter().any(|child| child.contains(needle.as_str())))
        {
            return Err(rejected("body failed validation"));
        }

        let mut created = Vec::with_capacity(children.len());
        for mut child in children {
            let id = match state.queued_ids.pop_front() {
                Some(id) => id,
                None => {
                    state.next_id += 1;
                    format!("blk-{}", state.next_id)
                }
            };
            child["id"] = json!(id);
            let block = SyncedBlock::from_wire(&child)
                .ok_or_else(|| rejected("child is not a block object"))?;
            created.push((id, block));
        }

        let siblings = state.children.entry(parent_id.to_string()).or_default();
        let mut position = anchor
            .and_then(|anchor| siblings.iter().position(|block| block.id == anchor))
            .map(|ix| ix + 1)
            .unwrap_or(siblings.len());
        let mut ids = Vec::with_capacity(created.len());
        for (id, block) in created {
            siblings.insert(position, block);
            position += 1;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn update(&self, id: &str, block: Value) -> Result<(), RemoteError> {
        self.state.lock().calls.push(RemoteCall::Update {
            id: id.to_string(),
            block: block.clone(),
        });
        self.hold(id).await;

        let mut state = self.state.lock();
        if state.failing_blocks.contains(id) {
            return Err(rejected("update rejected"));
        }
        let mut wire = block;
        wire["id"] = json!(id);
        let updated = SyncedBlock::from_wire(&wire).ok_or_else(|| rejected("not a block"))?;
        let existing = state
            .children
            .values_mut()
            .flat_map(|blocks| blocks.iter_mut())
            .find(|entry| entry.id == id)
            .ok_or_else(|| not_found(id))?;
        *existing = updated;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.state.lock().calls.push(RemoteCall::Delete { id: id.to_string() });
        self.hold(id).await;

        let mut state = self.state.lock();
        if state.failing_blocks.contains(id) {
            return Err(rejected("delete rejected"));
        }
        let mut found = false;
        for blocks in state.children.values_mut() {
            let before = blocks.len();
            blocks.retain(|entry| entry.id != id);
            found |= blocks.len() != before;
        }
        if found {
            Ok(())
        } else {
            Err(not_found(id))
        }
    }

    async fn fetch_page(&self, id: &str) -> Result<RemotePage, RemoteError> {
        self.state.lock().calls.push(RemoteCall::FetchPage { id: id.to_string() });
        self.hold(id).await;

        let state = self.state.lock();
        if state.fail_fetches {
            return Err(RemoteError::Transport("connection reset".to_string()));
        }
        state.pages.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn fetch_children(&self, id: &str) -> Result<Vec<SyncedBlock>, RemoteError> {
        self.state
            .lock()
            .calls
            .push(RemoteCall::FetchChildren { id: id.to_string() });
        self.hold(id).await;

        let state = self.state.lock();
        if state.fail_fetches {
            return Err(RemoteError::Transport("connection reset".to_string()));
        }
        Ok(state.children.get(id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockKind, TextRun};

    fn paragraph(id: &str, text: &str) -> SyncedBlock {
        SyncedBlock::new(id, BlockKind::Paragraph, vec![TextRun::plain(text)])
    }

    #[tokio::test]
    async fn create_inserts_after_anchor_with_queued_ids() {
        let remote = MockRemote::new();
        remote.insert_page("p", "Page", vec![paragraph("a", "one"), paragraph("c", "three")]);
        remote.push_created_ids(["b"]);

        let ids = remote
            .create("p", vec![paragraph("ignored", "two").serialize()], Some("a"))
            .await
            .expect("create");

        assert_eq!(ids, vec!["b".to_string()]);
        let order: Vec<_> = remote.children("p").into_iter().map(|b| b.id).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn scripted_failures_are_reported() {
        let remote = MockRemote::new();
        remote.insert_page("p", "Page", vec![paragraph("a", "one")]);
        remote.fail_block("a");
        remote.fail_creates_containing("boom");

        assert!(remote.delete("a").await.is_err());
        assert!(remote
            .create("p", vec![paragraph("x", "boom").serialize()], None)
            .await
            .is_err());
        assert!(matches!(
            remote.delete("missing").await,
            Err(RemoteError::Http { status: 404, .. })
        ));
        assert_eq!(remote.calls().len(), 3);
        assert_eq!(remote.children("p").len(), 1);
    }
}
