// src/changeset/diff.rs

//! Line diffs for config file contents
//!
//! Config files travel in changesets as unified diffs against the old
//! contents so local edits can be merged on the client. Diffs are computed
//! with a longest-common-subsequence table over the lines between the
//! common prefix and suffix, and applied strictly: every
//! context and removed line must match.

use crate::error::{Error, Result};

/// Context lines kept around each change
const CONTEXT: usize = 3;

const NO_NEWLINE: &str = "\\ No newline at end of file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal(usize, usize),
    Delete(usize),
    Insert(usize),
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Largest LCS table built before a diff is abandoned
const MAX_DIFF_CELLS: usize = 4_000_000;

/// Edit script from `old` to `new`, or `None` when the lines that differ
/// would need a table larger than [`MAX_DIFF_CELLS`]
fn edit_script(old: &[&str], new: &[&str]) -> Option<Vec<Op>> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let width = new_mid.len() + 1;
    let cells = (old_mid.len() + 1).checked_mul(width)?;
    if cells > MAX_DIFF_CELLS {
        return None;
    }

    // lcs[i * width + j] is the common subsequence length of old_mid[i..]
    // and new_mid[j..]
    let mut lcs = vec![0u32; cells];
    for i in (0..old_mid.len()).rev() {
        for j in (0..new_mid.len()).rev() {
            lcs[i * width + j] = if old_mid[i] == new_mid[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(old.len() + new.len());
    ops.extend((0..prefix).map(|i| Op::Equal(i, i)));
    let (mut i, mut j) = (0, 0);
    while i < old_mid.len() && j < new_mid.len() {
        if old_mid[i] == new_mid[j] {
            ops.push(Op::Equal(prefix + i, prefix + j));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            ops.push(Op::Delete(prefix + i));
            i += 1;
        } else {
            ops.push(Op::Insert(prefix + j));
            j += 1;
        }
    }
    ops.extend((i..old_mid.len()).map(|i| Op::Delete(prefix + i)));
    ops.extend((j..new_mid.len()).map(|j| Op::Insert(prefix + j)));
    let (old_tail, new_tail) = (old.len() - suffix, new.len() - suffix);
    ops.extend((0..suffix).map(|k| Op::Equal(old_tail + k, new_tail + k)));
    Some(ops)
}

fn push_line(out: &mut String, prefix: char, line: &str) {
    out.push(prefix);
    match line.strip_suffix('\n') {
        Some(body) => {
            out.push_str(body);
            out.push('\n');
        }
        None => {
            out.push_str(line);
            out.push('\n');
            out.push_str(NO_NEWLINE);
            out.push('\n');
        }
    }
}

/// Unified diff turning `old` into `new`; empty when they are identical
///
/// Returns `None` when the changed region is too large to diff, in which
/// case callers ship the new contents whole.
pub fn unified_diff(old: &str, new: &str) -> Option<String> {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    let ops = edit_script(&old_lines, &new_lines)?;

    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(..)))
        .map(|(index, _)| index)
        .collect();

    // Group changes whose context would overlap
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &index in &changes {
        let start = index.saturating_sub(CONTEXT);
        let end = (index + CONTEXT + 1).min(ops.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => ranges.push((start, end)),
        }
    }

    let mut out = String::new();
    for (start, end) in ranges {
        let hunk = &ops[start..end];

        // Position of the hunk in each file, counting lines before it
        let (old_pos, new_pos) = ops[..start].iter().fold((0, 0), |(o, n), op| match op {
            Op::Equal(..) => (o + 1, n + 1),
            Op::Delete(_) => (o + 1, n),
            Op::Insert(_) => (o, n + 1),
        });
        let old_len = hunk.iter().filter(|op| !matches!(op, Op::Insert(_))).count();
        let new_len = hunk.iter().filter(|op| !matches!(op, Op::Delete(_))).count();
        let old_start = if old_len == 0 { old_pos } else { old_pos + 1 };
        let new_start = if new_len == 0 { new_pos } else { new_pos + 1 };

        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start, old_len, new_start, new_len
        ));
        for op in hunk {
            match *op {
                Op::Equal(i, _) => push_line(&mut out, ' ', old_lines[i]),
                Op::Delete(i) => push_line(&mut out, '-', old_lines[i]),
                Op::Insert(j) => push_line(&mut out, '+', new_lines[j]),
            }
        }
    }
    Some(out)
}

struct Hunk {
    old_start: usize,
    old_len: usize,
    lines: Vec<(char, String)>,
}

fn parse_range(text: &str) -> Result<(usize, usize)> {
    let bad = || Error::Patch(format!("malformed hunk range: {}", text));
    let (start, len) = text.split_once(',').unwrap_or((text, "1"));
    Ok((
        start.parse().map_err(|_| bad())?,
        len.parse().map_err(|_| bad())?,
    ))
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();

    for line in diff.lines() {
        if let Some(header) = line.strip_prefix("@@ -") {
            let ranges = header
                .strip_suffix(" @@")
                .ok_or_else(|| Error::Patch(format!("malformed hunk header: {}", line)))?;
            let (old_range, _) = ranges
                .split_once(" +")
                .ok_or_else(|| Error::Patch(format!("malformed hunk header: {}", line)))?;
            let (old_start, old_len) = parse_range(old_range)?;
            hunks.push(Hunk {
                old_start,
                old_len,
                lines: Vec::new(),
            });
            continue;
        }

        let hunk = hunks
            .last_mut()
            .ok_or_else(|| Error::Patch("diff line outside a hunk".to_string()))?;

        if line == NO_NEWLINE {
            if let Some((_, text)) = hunk.lines.last_mut() {
                text.pop();
            }
            continue;
        }

        let mut chars = line.chars();
        match chars.next() {
            Some(kind @ (' ' | '-' | '+')) => {
                hunk.lines.push((kind, format!("{}\n", chars.as_str())));
            }
            _ => return Err(Error::Patch(format!("unexpected diff line: {:?}", line))),
        }
    }

    Ok(hunks)
}

/// Apply a diff produced by [`unified_diff`] to `old`
///
/// # Errors
///
/// * `Error::Patch` if the diff is malformed or does not match `old`
pub fn apply_diff(old: &str, diff: &str) -> Result<String> {
    let old_lines = split_lines(old);
    let mut out = String::with_capacity(old.len());
    let mut cursor = 0;

    for hunk in parse_hunks(diff)? {
        let mut pos = if hunk.old_len == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if pos < cursor || pos > old_lines.len() {
            return Err(Error::Patch(format!(
                "hunk at line {} is out of order",
                hunk.old_start
            )));
        }

        old_lines[cursor..pos].iter().for_each(|line| out.push_str(line));

        for (kind, text) in &hunk.lines {
            if *kind == '+' {
                out.push_str(text);
                continue;
            }
            if old_lines.get(pos) != Some(&text.as_str()) {
                return Err(Error::Patch(format!(
                    "hunk does not match at line {}",
                    pos + 1
                )));
            }
            if *kind == ' ' {
                out.push_str(text);
            }
            pos += 1;
        }
        cursor = pos;
    }

    old_lines[cursor..].iter().for_each(|line| out.push_str(line));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "one\ntwo\nthree\nfour\nfive\nsix\nseven\neight\nnine\nten\n";

    #[test]
    fn test_identical_is_empty() {
        assert_eq!(unified_diff(OLD, OLD).unwrap(), "");
        assert_eq!(apply_diff(OLD, "").unwrap(), OLD);
    }

    #[test]
    fn test_single_change() {
        let new = OLD.replace("five\n", "FIVE\n");
        let diff = unified_diff(OLD, &new).unwrap();
        assert_eq!(
            diff,
            "@@ -2,7 +2,7 @@\n two\n three\n four\n-five\n+FIVE\n six\n seven\n eight\n"
        );
        assert_eq!(apply_diff(OLD, &diff).unwrap(), new);
    }

    #[test]
    fn test_separate_hunks() {
        let new = OLD.replace("one\n", "").replace("ten\n", "ten\neleven\n");
        let diff = unified_diff(OLD, &new).unwrap();
        assert_eq!(diff.matches("@@ -").count(), 2);
        assert_eq!(apply_diff(OLD, &diff).unwrap(), new);
    }

    #[test]
    fn test_from_and_to_empty() {
        let diff = unified_diff("", "a\nb\n").unwrap();
        assert_eq!(diff, "@@ -0,0 +1,2 @@\n+a\n+b\n");
        assert_eq!(apply_diff("", &diff).unwrap(), "a\nb\n");

        let diff = unified_diff("a\nb\n", "").unwrap();
        assert_eq!(apply_diff("a\nb\n", &diff).unwrap(), "");
    }

    #[test]
    fn test_missing_final_newline() {
        let old = "alpha\nbeta";
        let new = "alpha\nbeta\ngamma";
        let diff = unified_diff(old, new).unwrap();
        assert!(diff.contains(NO_NEWLINE));
        assert_eq!(apply_diff(old, &diff).unwrap(), new);
        assert_eq!(apply_diff(new, &unified_diff(new, old).unwrap()).unwrap(), old);
    }

    #[test]
    fn test_mismatch_is_rejected() {
        let new = OLD.replace("five\n", "FIVE\n");
        let diff = unified_diff(OLD, &new).unwrap();
        let other = OLD.replace("four\n", "4\n");
        assert!(matches!(apply_diff(&other, &diff), Err(Error::Patch(_))));
        assert!(matches!(apply_diff(OLD, "garbage\n"), Err(Error::Patch(_))));
    }

    #[test]
    fn test_large_files_with_small_edit() {
        let old: String = (0..20_000).map(|i| format!("key{}=value\n", i)).collect();
        let new = old.replace("key10000=value\n", "key10000=changed\n");
        let diff = unified_diff(&old, &new).unwrap();
        assert_eq!(diff.matches("@@ -").count(), 1);
        assert!(diff.starts_with("@@ -9998,7 +9998,7 @@\n"));
        assert_eq!(apply_diff(&old, &diff).unwrap(), new);
    }

    #[test]
    fn test_large_rewrite_is_not_diffed() {
        let old: String = (0..20_000).map(|i| format!("old{}\n", i)).collect();
        let new: String = (0..20_000).map(|i| format!("new{}\n", i)).collect();
        assert_eq!(unified_diff(&old, &new), None);

        let small_old: String = (0..1_000).map(|i| format!("old{}\n", i)).collect();
        let small_new: String = (0..1_000).map(|i| format!("new{}\n", i)).collect();
        let diff = unified_diff(&small_old, &small_new).unwrap();
        assert_eq!(apply_diff(&small_old, &diff).unwrap(), small_new);
    }
}
