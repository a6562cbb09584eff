//! Rule-based merge conflict resolution.
//!
//! Deliberately narrow: five rules, at most five files. A conflict region
//! either matches one of the whitespace / superset / import-union shapes
//! below or the whole merge is handed back to a human. Broader automation
//! is where subtle corruption hides.

use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// Resolution gives up once a merge touches more than this many files.
pub const MAX_AUTO_RESOLVE_FILES: usize = 5;

const MARKER_OURS: &str = "<<<<<<<";
const MARKER_SPLIT: &str = "=======";
const MARKER_THEIRS: &str = ">>>>>>>";

/// Reported when a merge cannot be completed automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub files: Vec<String>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_resolution: Option<String>,
}

/// Outcome of attempting to auto-resolve every conflicted file of a merge.
#[derive(Debug)]
pub enum ResolutionOutcome {
    /// Every region of every file resolved; contents ready to write back.
    Resolved(Vec<ResolvedFile>),
    /// At least one region (or the file-count cap) needs a human.
    Manual(ConflictInfo),
}

#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub path: String,
    pub content: String,
}

/// Resolve a whole merge given `(path, conflicted text)` pairs. All files
/// must resolve or none are used; a half-resolved merge commit is worse
/// than a reported conflict.
pub fn resolve_all(files: &[(String, String)]) -> ResolutionOutcome {
    let paths: Vec<String> = files.iter().map(|(p, _)| p.clone()).collect();

    if files.len() > MAX_AUTO_RESOLVE_FILES {
        return ResolutionOutcome::Manual(ConflictInfo {
            files: paths,
            description: format!(
                "{} files conflict, above the auto-resolve cap of {MAX_AUTO_RESOLVE_FILES}",
                files.len()
            ),
            suggested_resolution: None,
        });
    }

    let mut resolved = Vec::with_capacity(files.len());
    for (path, text) in files {
        match resolve_file(text) {
            Some(content) => resolved.push(ResolvedFile {
                path: path.clone(),
                content,
            }),
            None => {
                return ResolutionOutcome::Manual(ConflictInfo {
                    files: paths,
                    description: format!("conflict in '{path}' is outside the safe resolution rules"),
                    suggested_resolution: first_region_diff(text),
                });
            }
        }
    }
    ResolutionOutcome::Resolved(resolved)
}

/// Resolve one file's conflict markers. `None` means manual.
pub fn resolve_file(text: &str) -> Option<String> {
    let segments = parse_segments(text)?;
    let mut out: Vec<String> = Vec::new();
    for segment in segments {
        match segment {
            Segment::Plain(lines) => out.extend(lines),
            Segment::Conflict { ours, theirs } => {
                out.extend(resolve_region(&ours, &theirs)?);
            }
        }
    }
    let mut joined = out.join("\n");
    if text.ends_with('\n') && !joined.ends_with('\n') {
        joined.push('\n');
    }
    Some(joined)
}

enum Segment {
    Plain(Vec<String>),
    Conflict { ours: Vec<String>, theirs: Vec<String> },
}

/// Split a file into plain runs and conflict regions. Unbalanced or nested
/// markers make the file unresolvable.
fn parse_segments(text: &str) -> Option<Vec<Segment>> {
    #[derive(PartialEq)]
    enum State {
        Plain,
        Ours,
        Theirs,
    }

    let mut segments = Vec::new();
    let mut plain: Vec<String> = Vec::new();
    let mut ours: Vec<String> = Vec::new();
    let mut theirs: Vec<String> = Vec::new();
    let mut state = State::Plain;

    for line in text.lines() {
        if line.starts_with(MARKER_OURS) {
            if state != State::Plain {
                return None;
            }
            segments.push(Segment::Plain(std::mem::take(&mut plain)));
            state = State::Ours;
        } else if line.starts_with(MARKER_SPLIT) && state == State::Ours {
            state = State::Theirs;
        } else if line.starts_with(MARKER_THEIRS) {
            if state != State::Theirs {
                return None;
            }
            segments.push(Segment::Conflict {
                ours: std::mem::take(&mut ours),
                theirs: std::mem::take(&mut theirs),
            });
            state = State::Plain;
        } else {
            match state {
                State::Plain => plain.push(line.to_string()),
                State::Ours => ours.push(line.to_string()),
                State::Theirs => theirs.push(line.to_string()),
            }
        }
    }

    if state != State::Plain {
        return None;
    }
    segments.push(Segment::Plain(plain));
    Some(segments)
}

/// Apply the resolution rules to one region, first match wins:
/// 1. sides equal ignoring all whitespace -> ours
/// 2. one side blank -> the other
/// 3. theirs is a line-wise superset of ours -> ours + new-only their lines
/// 4. both sides are import blocks -> deduped, sorted union
/// 5. otherwise -> manual (`None`)
fn resolve_region(ours: &[String], theirs: &[String]) -> Option<Vec<String>> {
    // Rule 1: identical modulo whitespace.
    let squash = |lines: &[String]| -> String {
        lines
            .iter()
            .flat_map(|l| l.chars())
            .filter(|c| !c.is_whitespace())
            .collect()
    };
    if squash(ours) == squash(theirs) {
        return Some(ours.to_vec());
    }

    // Rule 2: one side is empty or whitespace-only.
    let blank = |lines: &[String]| lines.iter().all(|l| l.trim().is_empty());
    if blank(ours) {
        return Some(theirs.to_vec());
    }
    if blank(theirs) {
        return Some(ours.to_vec());
    }

    // Rule 3: theirs contains every line of ours (trimmed); append the
    // lines only theirs has, in their order.
    let trimmed: Vec<&str> = ours.iter().map(|l| l.trim()).collect();
    let their_trimmed: Vec<&str> = theirs.iter().map(|l| l.trim()).collect();
    if trimmed
        .iter()
        .filter(|l| !l.is_empty())
        .all(|l| their_trimmed.contains(l))
    {
        let mut merged = ours.to_vec();
        for line in theirs {
            if !trimmed.contains(&line.trim()) {
                merged.push(line.clone());
            }
        }
        return Some(merged);
    }

    // Rule 4: both sides are pure import blocks; union them.
    let import_like =
        |lines: &[String]| lines.iter().all(|l| l.trim().is_empty() || is_import_line(l));
    if import_like(ours) && import_like(theirs) {
        let mut union: Vec<String> = Vec::new();
        for line in ours.iter().chain(theirs.iter()) {
            let t = line.trim();
            if t.is_empty() {
                continue;
            }
            if !union.iter().any(|u: &String| u.trim() == t) {
                union.push(line.clone());
            }
        }
        union.sort_by(|a, b| a.trim().cmp(b.trim()));
        return Some(union);
    }

    None
}

fn is_import_line(line: &str) -> bool {
    line.trim_start().starts_with("import ")
}

/// Unified diff of the first manual region, for the conflict report.
fn first_region_diff(text: &str) -> Option<String> {
    let segments = parse_segments(text)?;
    for segment in segments {
        if let Segment::Conflict { ours, theirs } = segment {
            if resolve_region(&ours, &theirs).is_none() {
                let ours = ours.join("\n");
                let theirs = theirs.join("\n");
                let diff = TextDiff::from_lines(&ours, &theirs)
                    .unified_diff()
                    .header("ours", "theirs")
                    .to_string();
                return Some(diff);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
