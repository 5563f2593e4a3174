use crate::core::store::DiffSummary;

const CONTEXT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op<'a> {
    Equal(&'a str),
    Removed(&'a str),
    Added(&'a str),
}

/// Line-level unified diff of `current` against `previous` (empty when there
/// is no earlier version).
pub fn line_diff(previous: Option<&str>, current: &str) -> DiffSummary {
    let old: Vec<&str> = previous.unwrap_or("").lines().collect();
    let new: Vec<&str> = current.lines().collect();
    let ops = edit_script(&old, &new);

    let added = ops.iter().filter(|op| matches!(op, Op::Added(_))).count() as i64;
    let removed = ops.iter().filter(|op| matches!(op, Op::Removed(_))).count() as i64;
    let text = if added == 0 && removed == 0 {
        String::new()
    } else {
        render(&ops)
    };

    DiffSummary {
        added,
        removed,
        text,
    }
}

/// Longest-common-subsequence edit script, removals before additions.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Op<'a>> {
    let (n, m) = (old.len(), new.len());
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Equal(old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push(Op::Removed(old[i]));
            i += 1;
        } else {
            ops.push(Op::Added(new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().copied().map(Op::Removed));
    ops.extend(new[j..].iter().copied().map(Op::Added));
    ops
}

fn render(ops: &[Op<'_>]) -> String {
    // Line numbers consumed before each op, for hunk headers.
    let mut old_before = Vec::with_capacity(ops.len() + 1);
    let mut new_before = Vec::with_capacity(ops.len() + 1);
    let (mut o, mut n) = (0usize, 0usize);
    for op in ops {
        old_before.push(o);
        new_before.push(n);
        match op {
            Op::Equal(_) => {
                o += 1;
                n += 1;
            }
            Op::Removed(_) => o += 1,
            Op::Added(_) => n += 1,
        }
    }

    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(_)))
        .map(|(i, _)| i)
        .collect();

    let mut hunks: Vec<(usize, usize)> = Vec::new();
    for &idx in &changes {
        let start = idx.saturating_sub(CONTEXT);
        let end = (idx + CONTEXT + 1).min(ops.len());
        match hunks.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => hunks.push((start, end)),
        }
    }

    let mut out = String::from("--- previous\n+++ current\n");
    for (start, end) in hunks {
        let slice = &ops[start..end];
        let old_count = slice.iter().filter(|op| !matches!(op, Op::Added(_))).count();
        let new_count = slice.iter().filter(|op| !matches!(op, Op::Removed(_))).count();
        let old_start = old_before[start] + usize::from(old_count > 0);
        let new_start = new_before[start] + usize::from(new_count > 0);
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start, old_count, new_start, new_count
        ));
        for op in slice {
            let (prefix, line) = match op {
                Op::Equal(l) => (' ', l),
                Op::Removed(l) => ('-', l),
                Op::Added(l) => ('+', l),
            };
            out.push(prefix);
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
