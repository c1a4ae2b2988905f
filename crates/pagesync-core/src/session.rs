use crate::blocks::{plain_text, Block, BlockKind, BlockRef, Page, SyncedBlock, TextRun};
use crate::buffer::Buffer;
use crate::format::Formatter;
use std::ops::Range;

/// Generation-checked index into a [`SessionArena`]. A handle outlives its session
/// harmlessly: once the slot is closed or reused every lookup returns `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

/// Buffer, block mapping and last-synced snapshot for one open page.
#[derive(Debug)]
pub struct Session {
    pub page: Page,
    buffer: Buffer,
    blocks: Vec<Block>,
    synced: Vec<SyncedBlock>,
    load_epoch: u64,
    pub(crate) sync_in_flight: bool,
}

impl Session {
    pub fn new(page: Page) -> Self {
        Self {
            page,
            buffer: Buffer::default(),
            blocks: Vec::new(),
            synced: Vec::new(),
            load_epoch: 0,
            sync_in_flight: false,
        }
    }

    /// Replaces buffer and snapshot with `synced`, rendered through `formatter`.
    pub fn load(&mut self, synced: Vec<SyncedBlock>, formatter: &dyn Formatter) {
        self.buffer.clear();
        self.blocks.clear();
        let mut lines = Vec::new();
        let mut ranges = Vec::with_capacity(synced.len());
        for block in &synced {
            let rendered = formatter.format(&block.kind, &block.content);
            let start = lines.len();
            lines.extend(rendered.iter().cloned());
            ranges.push((start..lines.len(), rendered));
        }
        self.buffer = Buffer::new(lines);
        for (block, (range, rendered)) in synced.iter().zip(ranges) {
            let mut entry = Block::from_synced(block, rendered);
            entry.mark = Some(self.buffer.add_mark(range));
            self.blocks.push(entry);
        }
        self.synced = synced;
        self.load_epoch += 1;
        self.assign_anchors();
    }

    pub fn lines(&self) -> &[String] {
        self.buffer.lines()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn synced(&self) -> &[SyncedBlock] {
        &self.synced
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_in_flight
    }

    /// Bumped by every [`Session::load`]; work started against an older epoch
    /// belongs to a view that has since been replaced.
    pub fn load_epoch(&self) -> u64 {
        self.load_epoch
    }

    /// Ids of synced blocks whose buffer position disagrees with their order in
    /// the snapshot, which mirrors the remote store. Blocks the remote could only
    /// append at the end, or that took over an identity elsewhere on the page,
    /// show up here.
    pub fn misplaced_blocks(&self) -> Vec<String> {
        let local: Vec<&str> = self.blocks.iter().filter_map(Block::id).collect();
        let remote: Vec<&str> = self
            .synced
            .iter()
            .map(|entry| entry.id.as_str())
            .filter(|id| local.contains(id))
            .collect();
        out_of_order(&local, &remote)
    }

    pub fn line_range(&self, block: &Block) -> Option<Range<usize>> {
        block.mark.and_then(|mark| self.buffer.mark_range(mark))
    }

    pub fn block(&self, block_ref: &BlockRef) -> Option<&Block> {
        self.blocks.iter().find(|block| block.block_ref() == *block_ref)
    }

    pub fn block_mut(&mut self, block_ref: &BlockRef) -> Option<&mut Block> {
        self.blocks
            .iter_mut()
            .find(|block| block.block_ref() == *block_ref)
    }

    /// Applies a line edit, restores any non-editable block it touched, then
    /// re-derives blocks from the marks. Returns the ids of restored blocks.
    pub fn apply_edit(
        &mut self,
        start: usize,
        end: usize,
        replacement: Vec<String>,
        formatter: &dyn Formatter,
    ) -> Vec<String> {
        self.buffer.set_lines(start, end, replacement);
        let reverted = self.revert_fixed_blocks();
        self.refresh(formatter);
        reverted
    }

    /// Replaces the whole buffer, diffing against the current lines so unchanged
    /// and edited-in-place blocks keep their identity.
    pub fn set_all_lines(
        &mut self,
        lines: Vec<String>,
        formatter: &dyn Formatter,
    ) -> Vec<String> {
        self.buffer.replace_all(lines);
        let reverted = self.revert_fixed_blocks();
        self.refresh(formatter);
        reverted
    }

    fn revert_fixed_blocks(&mut self) -> Vec<String> {
        let mut reverted = Vec::new();
        let mut order: Vec<usize> = (0..self.blocks.len()).collect();
        order.sort_by_key(|&ix| self.line_range(&self.blocks[ix]).map(|range| range.start));

        for ix in order {
            let block = &self.blocks[ix];
            if block.editable() {
                continue;
            }
            let (Some(mark), Some(original)) = (block.mark, block.original_lines()) else {
                continue;
            };
            let Some(range) = self.buffer.mark_range(mark) else {
                continue;
            };
            if block.matches_content(self.buffer.slice(range.clone())) {
                continue;
            }
            let original = original.to_vec();
            let restored = range.start..range.start + original.len();
            self.buffer.set_lines(range.start, range.end, original);
            self.buffer.set_mark_range(mark, restored);
            if let Some(id) = block.id() {
                reverted.push(id.to_string());
            }
        }
        reverted
    }

    /// Rebuilds the block list from buffer marks: marked regions are re-parsed in
    /// place, unmarked lines become new blocks, emptied editable blocks drop out.
    pub fn refresh(&mut self, formatter: &dyn Formatter) {
        let mut positioned: Vec<(usize, Block)> = Vec::new();

        for mut block in std::mem::take(&mut self.blocks) {
            let Some(mark) = block.mark else {
                continue;
            };
            let range = match self.buffer.mark_range(mark) {
                Some(range) if !range.is_empty() => range,
                _ => {
                    self.buffer.remove_mark(mark);
                    continue;
                }
            };
            if !block.editable() && block.original_lines().is_some() {
                positioned.push((range.start, block));
                continue;
            }
            // Untouched since the last sync: the synced fields stand, whatever the
            // formatter would read back from them.
            if block.matches_content(self.buffer.slice(range.clone())) && block.restore_original() {
                positioned.push((range.start, block));
                continue;
            }

            let mut parsed = formatter
                .parse(self.buffer.slice(range.clone()))
                .into_iter();
            let Some(first) = parsed.next() else {
                self.buffer.remove_mark(mark);
                continue;
            };
            let first_range = range.start + first.lines.start..range.start + first.lines.end;
            self.buffer.set_mark_range(mark, first_range.clone());
            apply_parsed(&mut block, first.kind, first.content);
            positioned.push((first_range.start, block));

            for extra in parsed {
                let extra_range = range.start + extra.lines.start..range.start + extra.lines.end;
                let start = extra_range.start;
                positioned.push((start, self.new_block(extra.kind, extra.content, extra_range)));
            }
        }

        for range in self.buffer.unmarked_ranges() {
            let lines = self.buffer.slice(range.clone()).to_vec();
            for parsed in formatter.parse(&lines) {
                let block_range = range.start + parsed.lines.start..range.start + parsed.lines.end;
                let start = block_range.start;
                positioned.push((start, self.new_block(parsed.kind, parsed.content, block_range)));
            }
        }

        positioned.sort_by_key(|(start, _)| *start);
        self.blocks = positioned.into_iter().map(|(_, block)| block).collect();
        self.assign_anchors();
    }

    fn new_block(&mut self, kind: BlockKind, content: Vec<TextRun>, range: Range<usize>) -> Block {
        let mut block = Block::new_local(kind, content);
        block.mark = Some(self.buffer.add_mark(range));
        block
    }

    fn assign_anchors(&mut self) {
        let mut previous: Option<BlockRef> = None;
        for block in &mut self.blocks {
            block.anchor = previous.clone();
            previous = Some(block.block_ref());
        }
    }

    /// Records a successful create or re-create: the block takes `id` and the
    /// snapshot gains the pushed content right after `after` (or at the end).
    pub(crate) fn commit_created(
        &mut self,
        block_ref: &BlockRef,
        id: &str,
        kind: BlockKind,
        content: Vec<TextRun>,
        after: Option<&str>,
        formatter: &dyn Formatter,
    ) {
        let position = after
            .and_then(|anchor| self.synced.iter().position(|entry| entry.id == anchor))
            .map(|ix| ix + 1)
            .unwrap_or(self.synced.len());
        self.synced.insert(
            position,
            SyncedBlock::new(id, kind.clone(), content.clone()),
        );
        let lines = formatter.format(&kind, &content);
        if let Some(block) = self.block_mut(block_ref) {
            block.resolve_id(id);
            block.mark_synced(kind, content, lines);
        }
        self.assign_anchors();
    }

    pub(crate) fn commit_updated(
        &mut self,
        id: &str,
        kind: BlockKind,
        content: Vec<TextRun>,
        formatter: &dyn Formatter,
    ) {
        match self.synced.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.kind = kind.clone();
                entry.content = content.clone();
            }
            None => self
                .synced
                .push(SyncedBlock::new(id, kind.clone(), content.clone())),
        }
        let lines = formatter.format(&kind, &content);
        if let Some(block) = self.block_mut(&BlockRef::Remote(id.to_string())) {
            block.mark_synced(kind, content, lines);
        }
    }

    pub(crate) fn commit_deleted(&mut self, id: &str) {
        self.synced.retain(|entry| entry.id != id);
    }

    /// Content-matched block: takes over the identity of an unchanged remote block.
    pub(crate) fn commit_relinked(&mut self, temp_id: &str, id: &str, formatter: &dyn Formatter) {
        let Some(entry) = self.synced.iter().find(|entry| entry.id == id).cloned() else {
            return;
        };
        let lines = formatter.format(&entry.kind, &entry.content);
        if let Some(block) = self.block_mut(&BlockRef::Temp(temp_id.to_string())) {
            block.resolve_id(id);
            block.mark_synced(entry.kind, entry.content, lines);
        }
        self.assign_anchors();
    }

    /// The remote copy of `id` is gone and could not be re-created. The block goes
    /// back to being a pending create; returns its new placeholder.
    pub(crate) fn commit_stranded(&mut self, id: &str) -> Option<String> {
        self.synced.retain(|entry| entry.id != id);
        let temp_id = self
            .block_mut(&BlockRef::Remote(id.to_string()))
            .map(Block::detach_remote);
        self.assign_anchors();
        temp_id
    }
}

/// Entries of `local` outside a longest common subsequence with `remote`. On ties
/// the `local` entry is the one reported.
fn out_of_order(local: &[&str], remote: &[&str]) -> Vec<String> {
    let (n, m) = (local.len(), remote.len());
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if local[i] == remote[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut misplaced = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n {
        if j < m && local[i] == remote[j] {
            i += 1;
            j += 1;
        } else if j == m || table[i + 1][j] >= table[i][j + 1] {
            misplaced.push(local[i].to_string());
            i += 1;
        } else {
            j += 1;
        }
    }
    misplaced
}

fn apply_parsed(block: &mut Block, mut kind: BlockKind, content: Vec<TextRun>) {
    if let (Some(original_kind), Some(original_content)) = (
        block.original_kind().cloned(),
        block.original_content().map(<[TextRun]>::to_vec),
    ) {
        kind.inherit_hidden(&original_kind);
        // Line text carries no annotations; keep the synced runs while the text is the same.
        if kind == original_kind && plain_text(&content) == plain_text(&original_content) {
            block.content = original_content;
            block.kind = kind;
            block.set_dirty(false);
            return;
        }
    }
    block.kind = kind;
    block.content = content;
    let dirty = block.content_changed();
    block.set_dirty(dirty);
}

struct Slot {
    generation: u32,
    session: Option<Session>,
}

/// Owner of every open session. Teardown frees the slot and bumps its generation
/// so stale handles stop resolving.
#[derive(Default)]
pub struct SessionArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SessionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, session: Session) -> SessionHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.session = Some(session);
            return SessionHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            session: Some(session),
        });
        SessionHandle {
            index,
            generation: 0,
        }
    }

    pub fn is_active(&self, handle: SessionHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_ref())
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_mut())
    }

    pub fn close(&mut self, handle: SessionHandle) -> Option<Session> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.session.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
