// ABOUTME: Line-based search and replace used by the agent edit tool
// ABOUTME: Tries exact, whitespace-normalized and fuzzy matching in turn and renders a unified diff

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use thiserror::Error;

/// Minimum average per-line similarity for a fuzzy match.
const FUZZY_THRESHOLD: f64 = 0.8;
/// How far past the expected end a fuzzy match may stretch.
const FUZZY_SLACK: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("Text to replace is empty")]
    EmptyPattern,
    #[error("Old and new content are identical")]
    Unchanged,
    #[error("Could not find a suitable match for the old content")]
    NoMatch,
    #[error("Found {0} matches but replace_all is false; add context or enable replace_all")]
    Ambiguous(usize),
}

/// Which matching pass located the replaced lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Normalized,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub content: String,
    pub strategy: MatchStrategy,
    pub replacements: usize,
}

/// Inclusive line range of one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineMatch {
    start: usize,
    end: usize,
}

fn normalize(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn line_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = normalize(a).chars().collect();
    let b: Vec<char> = normalize(b).chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let same = a.iter().zip(&b).filter(|(x, y)| x == y).count();
    same as f64 / longest as f64
}

fn sequence_similarity(file: &[&str], old: &[&str], start: usize) -> f64 {
    let total: f64 = old
        .iter()
        .enumerate()
        .filter_map(|(i, line)| file.get(start + i).map(|f| line_similarity(f, line)))
        .sum();
    total / old.len() as f64
}

fn windows_matching(
    file: &[&str],
    old: &[&str],
    same: impl Fn(&str, &str) -> bool,
) -> Vec<LineMatch> {
    if old.len() > file.len() {
        return Vec::new();
    }
    (0..=file.len() - old.len())
        .filter(|&start| old.iter().enumerate().all(|(j, line)| same(file[start + j], line)))
        .map(|start| LineMatch {
            start,
            end: start + old.len() - 1,
        })
        .collect()
}

fn fuzzy_matches(file: &[&str], old: &[&str]) -> Vec<LineMatch> {
    // First and last lines anchor the match, so a single line cannot be fuzzy
    if old.len() < 2 {
        return Vec::new();
    }
    let first = normalize(old[0]);
    let last = normalize(old[old.len() - 1]);

    let mut matches = Vec::new();
    for start in 0..file.len() {
        if normalize(file[start]) != first {
            continue;
        }
        let limit = file.len().min(start + old.len() + FUZZY_SLACK);
        for end in (start + old.len() - 1)..limit {
            if normalize(file[end]) == last
                && sequence_similarity(file, old, start) >= FUZZY_THRESHOLD
            {
                matches.push(LineMatch { start, end });
            }
        }
    }
    matches
}

/// Keep matches in order, dropping any that overlap an earlier one.
fn disjoint(matches: Vec<LineMatch>) -> Vec<LineMatch> {
    let mut kept: Vec<LineMatch> = Vec::new();
    for m in matches {
        if kept.last().map_or(true, |prev| m.start > prev.end) {
            kept.push(m);
        }
    }
    kept
}

/// Replace the lines matching `old` with `new`.
///
/// Each strategy is tried only if the previous one found nothing. More than one
/// match is an error unless `replace_all` is set.
pub fn smart_replace(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<Replacement, EditError> {
    if old.is_empty() {
        return Err(EditError::EmptyPattern);
    }
    if old == new {
        return Err(EditError::Unchanged);
    }

    let file: Vec<&str> = content.split('\n').collect();
    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();

    let passes: [(MatchStrategy, Vec<LineMatch>); 3] = [
        (
            MatchStrategy::Exact,
            windows_matching(&file, &old_lines, |a, b| a == b),
        ),
        (
            MatchStrategy::Normalized,
            windows_matching(&file, &old_lines, |a, b| normalize(a) == normalize(b)),
        ),
        (MatchStrategy::Fuzzy, fuzzy_matches(&file, &old_lines)),
    ];
    let (strategy, matches) = passes
        .into_iter()
        .map(|(strategy, matches)| (strategy, disjoint(matches)))
        .find(|(_, matches)| !matches.is_empty())
        .ok_or(EditError::NoMatch)?;

    if matches.len() > 1 && !replace_all {
        return Err(EditError::Ambiguous(matches.len()));
    }

    let mut result: Vec<&str> = Vec::with_capacity(file.len());
    let mut cursor = 0;
    for m in &matches {
        result.extend_from_slice(&file[cursor..m.start]);
        result.extend_from_slice(&new_lines);
        cursor = m.end + 1;
    }
    result.extend_from_slice(&file[cursor..]);

    Ok(Replacement {
        content: result.join("\n"),
        strategy,
        replacements: matches.len(),
    })
}

/// Unified diff of one file before and after an edit.
pub fn unified_diff(path: &str, before: &str, after: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string()
}
