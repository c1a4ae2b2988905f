use std::collections::HashMap;
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkId(u64);

/// Line buffer with marks that follow their lines through edits, in the spirit of
/// editor extmarks. Block line ranges are always read back from here.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    lines: Vec<String>,
    marks: HashMap<MarkId, Range<usize>>,
    next_mark: u64,
}

impl Buffer {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            ..Self::default()
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn slice(&self, range: Range<usize>) -> &[String] {
        let end = range.end.min(self.lines.len());
        let start = range.start.min(end);
        &self.lines[start..end]
    }

    pub fn add_mark(&mut self, range: Range<usize>) -> MarkId {
        let id = MarkId(self.next_mark);
        self.next_mark += 1;
        self.marks.insert(id, range);
        id
    }

    pub fn mark_range(&self, id: MarkId) -> Option<Range<usize>> {
        self.marks.get(&id).cloned()
    }

    pub fn set_mark_range(&mut self, id: MarkId, range: Range<usize>) {
        if let Some(existing) = self.marks.get_mut(&id) {
            *existing = range;
        }
    }

    pub fn remove_mark(&mut self, id: MarkId) {
        self.marks.remove(&id);
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.marks.clear();
    }

    /// Replaces lines `start..end` with `replacement` and moves every mark:
    /// marks before the edit stay, marks after shift, a mark containing the edit
    /// grows or shrinks, a mark swallowed by a wider edit collapses to empty, and
    /// a partially overlapped mark is trimmed to its surviving lines.
    pub fn set_lines(&mut self, start: usize, end: usize, replacement: Vec<String>) {
        let end = end.min(self.lines.len());
        let start = start.min(end);
        let inserted = replacement.len();
        let removed = end - start;
        self.lines.splice(start..end, replacement);

        for range in self.marks.values_mut() {
            *range = shift_range(range.clone(), start, end, inserted, removed);
        }
    }

    /// Replaces the whole content through minimal edits, so marks on lines that
    /// survive or are changed in place keep following them. Changed hunks are
    /// rewritten line by line before any surplus lines are inserted or removed.
    pub fn replace_all(&mut self, lines: Vec<String>) {
        let hunks = diff_lines(&self.lines, &lines);
        for hunk in hunks.into_iter().rev() {
            let paired = hunk.old.len().min(hunk.new.len());
            let tail = hunk.old.start + paired;
            self.set_lines(tail, hunk.old.end, hunk.new[paired..].to_vec());
            for (offset, line) in hunk.new.into_iter().take(paired).enumerate() {
                let ix = hunk.old.start + offset;
                self.set_lines(ix, ix + 1, vec![line]);
            }
        }
    }

    /// Runs of lines that no non-empty mark covers.
    pub fn unmarked_ranges(&self) -> Vec<Range<usize>> {
        let mut covered = vec![false; self.lines.len()];
        for range in self.marks.values() {
            for flag in covered
                .iter_mut()
                .take(range.end.min(self.lines.len()))
                .skip(range.start)
            {
                *flag = true;
            }
        }

        let mut ranges = Vec::new();
        let mut run_start = None;
        for (ix, is_covered) in covered.into_iter().enumerate() {
            match (is_covered, run_start) {
                (false, None) => run_start = Some(ix),
                (true, Some(start)) => {
                    ranges.push(start..ix);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            ranges.push(start..self.lines.len());
        }
        ranges
    }
}

struct Hunk {
    old: Range<usize>,
    new: Vec<String>,
}

/// Longest-common-subsequence line diff. Hunks come back in ascending order with
/// `old` ranges in the coordinates of `old`.
fn diff_lines(old: &[String], new: &[String]) -> Vec<Hunk> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    let (n, m) = (old_mid.len(), new_mid.len());

    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if old_mid[i] == new_mid[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && old_mid[i] == new_mid[j] {
            hunks.extend(current.take());
            i += 1;
            j += 1;
            continue;
        }
        let hunk = current.get_or_insert_with(|| Hunk {
            old: prefix + i..prefix + i,
            new: Vec::new(),
        });
        if j < m && (i == n || table[i][j + 1] >= table[i + 1][j]) {
            hunk.new.push(new_mid[j].clone());
            j += 1;
        } else {
            hunk.old.end += 1;
            i += 1;
        }
    }
    hunks.extend(current);
    hunks
}

fn shift_range(
    mark: Range<usize>,
    start: usize,
    end: usize,
    inserted: usize,
    removed: usize,
) -> Range<usize> {
    let shift = |value: usize| (value + inserted).saturating_sub(removed);
    if mark.end <= start {
        return mark;
    }
    if mark.start >= end {
        return shift(mark.start)..shift(mark.end);
    }
    if mark.start <= start && end <= mark.end {
        return mark.start..shift(mark.end);
    }
    if start <= mark.start && mark.end <= end {
        return start..start;
    }
    if mark.start < start {
        return mark.start..start;
    }
    let new_start = start + inserted;
    new_start..shift(mark.end)
}
