use crate::blocks::{plain_text, Block, BlockKind, BlockRef, SyncedBlock, TextRun};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub struct CreateOp {
    pub temp_id: String,
    pub kind: BlockKind,
    pub content: Vec<TextRun>,
    pub anchor: Option<BlockRef>,
    /// Index of the block in the buffer's block sequence.
    pub position: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOp {
    pub id: String,
    pub kind: BlockKind,
    pub content: Vec<TextRun>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteOp {
    pub id: String,
}

/// The remote store cannot change a block's type in place, so this runs as a
/// delete of `id` followed by a create at the same position.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeChangeOp {
    pub id: String,
    pub old_type: BlockKind,
    pub new_type: BlockKind,
    pub content: Vec<TextRun>,
    pub anchor: Option<BlockRef>,
    pub position: usize,
}

/// A new buffer block whose content is identical to a remote block that lost its
/// mark; it takes over that identity instead of a create/delete pair. The remote
/// block is not moved, so a relink across other blocks leaves it out of order;
/// the sync outcome lists it under `misplaced`.
#[derive(Clone, Debug, PartialEq)]
pub struct Relink {
    pub temp_id: String,
    pub id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Unmatched {
    pub temp_id: String,
    pub position: usize,
    pub kind: BlockKind,
    pub content: Vec<TextRun>,
    pub anchor: Option<BlockRef>,
    pub candidates: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Create,
    Relink(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("no unmatched entry at index {0}")]
    NoSuchEntry(usize),
    #[error("{id} is not a candidate for {temp_id}")]
    NotACandidate { temp_id: String, id: String },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncPlan {
    pub creates: Vec<CreateOp>,
    pub updates: Vec<UpdateOp>,
    pub deletes: Vec<DeleteOp>,
    pub type_changes: Vec<TypeChangeOp>,
    pub relinks: Vec<Relink>,
    pub unmatched: Vec<Unmatched>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.operation_count() == 0 && self.relinks.is_empty() && self.unmatched.is_empty()
    }

    /// Number of operations that need the remote store.
    pub fn operation_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len() + self.type_changes.len()
    }

    /// Settles an ambiguous region the caller has confirmed. Candidates nobody
    /// claims any more become deletes.
    pub fn resolve_unmatched(
        &mut self,
        index: usize,
        resolution: Resolution,
    ) -> Result<(), PlanError> {
        let entry = self
            .unmatched
            .get(index)
            .ok_or(PlanError::NoSuchEntry(index))?;
        if let Resolution::Relink(id) = &resolution {
            if !entry.candidates.contains(id) {
                return Err(PlanError::NotACandidate {
                    temp_id: entry.temp_id.clone(),
                    id: id.clone(),
                });
            }
        }

        let entry = self.unmatched.remove(index);
        let kept = match resolution {
            Resolution::Relink(id) => {
                self.relinks.push(Relink {
                    temp_id: entry.temp_id.clone(),
                    id: id.clone(),
                });
                for other in &mut self.unmatched {
                    other.candidates.retain(|candidate| *candidate != id);
                }
                Some(id)
            }
            Resolution::Create => {
                self.push_create(&entry);
                None
            }
        };

        let orphaned: Vec<Unmatched> = self
            .unmatched
            .iter()
            .filter(|other| other.candidates.is_empty())
            .cloned()
            .collect();
        self.unmatched.retain(|other| !other.candidates.is_empty());
        for other in &orphaned {
            self.push_create(other);
        }

        for candidate in entry.candidates {
            if kept.as_ref() == Some(&candidate) {
                continue;
            }
            let still_claimed = self
                .unmatched
                .iter()
                .any(|other| other.candidates.contains(&candidate))
                || self.relinks.iter().any(|relink| relink.id == candidate);
            if !still_claimed && !self.deletes.iter().any(|delete| delete.id == candidate) {
                self.deletes.push(DeleteOp { id: candidate });
            }
        }
        Ok(())
    }

    fn push_create(&mut self, entry: &Unmatched) {
        self.creates.push(CreateOp {
            temp_id: entry.temp_id.clone(),
            kind: entry.kind.clone(),
            content: entry.content.clone(),
            anchor: entry.anchor.clone(),
            position: entry.position,
        });
        self.creates.sort_by_key(|create| create.position);
    }
}

/// Diffs the buffer's blocks against the last synced snapshot.
///
/// Blocks are matched by remote id first. New blocks whose content equals a
/// snapshot block that no longer has a buffer counterpart are matched by content,
/// preferring the candidate that keeps the most id-matched blocks in the same
/// relative order; ties end up in `unmatched` and are neither created nor deleted.
pub fn compute_plan(current: &[Block], synced: &[SyncedBlock]) -> SyncPlan {
    let old_index: HashMap<&str, usize> = synced
        .iter()
        .enumerate()
        .map(|(ix, block)| (block.id.as_str(), ix))
        .collect();

    let mut id_pairs = Vec::new();
    let mut matched_old = HashSet::new();
    let mut fresh = Vec::new();
    for (ix, block) in current.iter().enumerate() {
        match block.id() {
            Some(id) => {
                if let Some(&old_ix) = old_index.get(id) {
                    id_pairs.push((ix, old_ix));
                    matched_old.insert(old_ix);
                }
            }
            None => fresh.push(ix),
        }
    }

    let orphans: Vec<usize> = (0..synced.len())
        .filter(|ix| !matched_old.contains(ix))
        .collect();
    let stability = |new_ix: usize, old_ix: usize| {
        id_pairs
            .iter()
            .filter(|(other_new, other_old)| (*other_new < new_ix) == (*other_old < old_ix))
            .count()
    };

    let mut relinked: HashMap<usize, usize> = HashMap::new();
    let mut pending: Vec<(usize, Vec<usize>)> = Vec::new();
    for &new_ix in &fresh {
        let block = &current[new_ix];
        if plain_text(&block.content).is_empty() {
            continue;
        }
        let candidates: Vec<usize> = orphans
            .iter()
            .copied()
            .filter(|&old_ix| same_content(block, &synced[old_ix]))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        let rivals: Vec<usize> = fresh
            .iter()
            .copied()
            .filter(|&other| {
                current[other].kind == block.kind && current[other].content == block.content
            })
            .collect();
        let best_old = unique_best(&candidates, |old_ix| stability(new_ix, old_ix));
        let mutual = best_old
            .filter(|&old_ix| unique_best(&rivals, |other| stability(other, old_ix)) == Some(new_ix));
        match mutual {
            Some(old_ix) => {
                relinked.insert(new_ix, old_ix);
            }
            None => pending.push((new_ix, candidates)),
        }
    }

    let claimed: HashSet<usize> = relinked.values().copied().collect();
    let mut ambiguous: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut reserved: HashSet<usize> = HashSet::new();
    for (new_ix, candidates) in pending {
        let remaining: Vec<usize> = candidates
            .into_iter()
            .filter(|old_ix| !claimed.contains(old_ix))
            .collect();
        if !remaining.is_empty() {
            reserved.extend(remaining.iter().copied());
            ambiguous.insert(new_ix, remaining);
        }
    }

    let mut plan = SyncPlan::default();
    let mut previous: Option<BlockRef> = None;
    for (ix, block) in current.iter().enumerate() {
        let anchor = previous.clone();
        match block.id() {
            Some(id) => match old_index.get(id) {
                Some(&old_ix) => {
                    let old = &synced[old_ix];
                    if !old.kind.same_semantic_type(&block.kind) {
                        plan.type_changes.push(TypeChangeOp {
                            id: id.to_string(),
                            old_type: old.kind.clone(),
                            new_type: block.kind.clone(),
                            content: block.content.clone(),
                            anchor,
                            position: ix,
                        });
                    } else if old.kind != block.kind || old.content != block.content {
                        plan.updates.push(update_op(id, block));
                    }
                }
                None if block.kind.is_editable() => plan.updates.push(update_op(id, block)),
                None => {}
            },
            None => {
                let temp_id = block.temp_id().unwrap_or_default().to_string();
                if let Some(&old_ix) = relinked.get(&ix) {
                    let id = synced[old_ix].id.clone();
                    plan.relinks.push(Relink {
                        temp_id,
                        id: id.clone(),
                    });
                    previous = Some(BlockRef::Remote(id));
                    continue;
                }
                if let Some(candidates) = ambiguous.remove(&ix) {
                    plan.unmatched.push(Unmatched {
                        temp_id,
                        position: ix,
                        kind: block.kind.clone(),
                        content: block.content.clone(),
                        anchor,
                        candidates: candidates
                            .into_iter()
                            .map(|old_ix| synced[old_ix].id.clone())
                            .collect(),
                    });
                    continue;
                }
                plan.creates.push(CreateOp {
                    temp_id,
                    kind: block.kind.clone(),
                    content: block.content.clone(),
                    anchor,
                    position: ix,
                });
            }
        }
        previous = Some(block.block_ref());
    }

    for old_ix in orphans {
        if claimed.contains(&old_ix) || reserved.contains(&old_ix) {
            continue;
        }
        plan.deletes.push(DeleteOp {
            id: synced[old_ix].id.clone(),
        });
    }

    debug!(
        creates = plan.creates.len(),
        updates = plan.updates.len(),
        deletes = plan.deletes.len(),
        type_changes = plan.type_changes.len(),
        relinks = plan.relinks.len(),
        unmatched = plan.unmatched.len(),
        "computed sync plan"
    );
    plan
}

fn update_op(id: &str, block: &Block) -> UpdateOp {
    UpdateOp {
        id: id.to_string(),
        kind: block.kind.clone(),
        content: block.content.clone(),
    }
}

fn same_content(block: &Block, old: &SyncedBlock) -> bool {
    block.kind == old.kind && block.content == old.content
}

fn unique_best(items: &[usize], score: impl Fn(usize) -> usize) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    let mut tied = false;
    for &item in items {
        let value = score(item);
        match best {
            Some((_, top)) if value == top => tied = true,
            Some((_, top)) if value < top => {}
            _ => {
                best = Some((item, value));
                tied = false;
            }
        }
    }
    if tied {
        None
    } else {
        best.map(|(item, _)| item)
    }
}
