//! Protected-region comparison of the working copy against expected starter content.
//!
//! Files named in the effective manifest are protected, except for spans
//! between game-area marker lines. Divergence in a protected span is drift;
//! divergence anywhere else only touches the game area.

use serde::{Deserialize, Serialize};

use crate::core::types::{ConflictVerdict, LocalObservation};

pub const DEFAULT_BEGIN_MARKER: &str = "quest:game-area:begin";
pub const DEFAULT_END_MARKER: &str = "quest:game-area:end";

/// How whitespace differences inside protected regions are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitespacePolicy {
    /// Any byte difference counts.
    Exact,
    /// Ignore trailing whitespace, CRLF vs LF, and trailing blank lines.
    #[default]
    Trailing,
    /// Ignore all whitespace and blank lines.
    All,
}

/// Comparison settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPolicy {
    pub whitespace: WhitespacePolicy,
    pub begin_marker: String,
    pub end_marker: String,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            whitespace: WhitespacePolicy::default(),
            begin_marker: DEFAULT_BEGIN_MARKER.to_string(),
            end_marker: DEFAULT_END_MARKER.to_string(),
        }
    }
}

/// Expected vs actual content of one protected path. `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileComparison {
    pub path: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// Verdict plus the paths that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub verdict: ConflictVerdict,
    /// Paths whose protected regions diverged (sorted).
    pub drifted_paths: Vec<String>,
    /// Protected paths whose game areas diverged (sorted).
    pub game_area_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Divergence {
    None,
    GameArea,
    Protected,
}

/// Classify the learner's edits.
///
/// Any protected divergence yields `Drifted`. Otherwise game-area divergence,
/// uncommitted changes or unpushed commits yield `GameAreaOnly`. Only a
/// working copy identical to the expected state is `Clean`.
pub fn classify(
    files: &[FileComparison],
    local: &LocalObservation,
    policy: &ConflictPolicy,
) -> ConflictReport {
    let mut drifted_paths = Vec::new();
    let mut game_area_paths = Vec::new();

    for file in files {
        match compare_file(file, policy) {
            Divergence::None => {}
            Divergence::GameArea => game_area_paths.push(file.path.clone()),
            Divergence::Protected => drifted_paths.push(file.path.clone()),
        }
    }
    drifted_paths.sort();
    game_area_paths.sort();

    let verdict = if !drifted_paths.is_empty() {
        ConflictVerdict::Drifted
    } else if !game_area_paths.is_empty() || local.dirty || local.ahead > 0 {
        ConflictVerdict::GameAreaOnly
    } else {
        ConflictVerdict::Clean
    };

    ConflictReport {
        verdict,
        drifted_paths,
        game_area_paths,
    }
}

fn compare_file(file: &FileComparison, policy: &ConflictPolicy) -> Divergence {
    let (expected, actual) = match (&file.expected, &file.actual) {
        (None, None) => return Divergence::None,
        (Some(_), None) | (None, Some(_)) => return Divergence::Protected,
        (Some(expected), Some(actual)) => (expected, actual),
    };

    let expected = Regions::split(expected, policy);
    let actual = Regions::split(actual, policy);

    // Removing, adding or unbalancing markers redraws the protected boundary.
    if actual.unbalanced || actual.game.len() != expected.game.len() {
        return Divergence::Protected;
    }

    let ws = policy.whitespace;
    let last = expected.protected.len() - 1;
    let protected_differs = expected
        .protected
        .iter()
        .zip(&actual.protected)
        .enumerate()
        .any(|(i, (e, a))| normalize(e, ws, i == last) != normalize(a, ws, i == last));
    if protected_differs {
        return Divergence::Protected;
    }

    let game_differs = expected
        .game
        .iter()
        .zip(&actual.game)
        .any(|(e, a)| normalize(e, ws, false) != normalize(a, ws, false));
    if game_differs {
        Divergence::GameArea
    } else {
        Divergence::None
    }
}

/// `expected` with its game areas replaced by the ones in `current`.
///
/// Used when protected content is rewritten, so the learner's game-area code
/// survives. Falls back to `expected` unchanged when the two files do not
/// have the same game-area layout.
pub fn carry_game_areas(expected: &str, current: &str, policy: &ConflictPolicy) -> String {
    let target = Regions::split(expected, policy);
    let source = Regions::split(current, policy);
    if target.unbalanced
        || source.unbalanced
        || target.game.is_empty()
        || target.game.len() != source.game.len()
    {
        return expected.to_string();
    }

    let mut out = String::with_capacity(expected.len().max(current.len()));
    for (protected, game) in target.protected.iter().zip(&source.game) {
        out.push_str(protected);
        out.push_str(game);
    }
    if let Some(tail) = target.protected.last() {
        out.push_str(tail);
    }
    // `split` terminates every line, including the one after the final newline.
    out.pop();
    out
}

/// File content split at game-area markers.
///
/// `protected` always has exactly `game.len() + 1` segments. Marker lines are
/// kept in the protected segments so editing them counts as drift.
#[derive(Debug)]
struct Regions {
    protected: Vec<String>,
    game: Vec<String>,
    unbalanced: bool,
}

impl Regions {
    fn split(text: &str, policy: &ConflictPolicy) -> Self {
        let mut protected = vec![String::new()];
        let mut game: Vec<String> = Vec::new();
        let mut inside = false;
        let mut unbalanced = false;

        for line in text.split('\n') {
            let begins = line.contains(&policy.begin_marker);
            let ends = line.contains(&policy.end_marker);

            if !inside && begins {
                push_line(protected.last_mut(), line);
                game.push(String::new());
                inside = true;
                continue;
            }
            if inside && ends {
                protected.push(String::new());
                push_line(protected.last_mut(), line);
                inside = false;
                continue;
            }
            if (inside && begins) || (!inside && ends) {
                unbalanced = true;
            }

            let target = if inside {
                game.last_mut()
            } else {
                protected.last_mut()
            };
            push_line(target, line);
        }

        if inside {
            // An unterminated game area still closes the region list.
            unbalanced = true;
            protected.push(String::new());
        }

        Self {
            protected,
            game,
            unbalanced,
        }
    }
}

fn push_line(segment: Option<&mut String>, line: &str) {
    if let Some(segment) = segment {
        segment.push_str(line);
        segment.push('\n');
    }
}

/// `at_eof` marks the segment that ends the file; only there are trailing
/// blank lines ignored.
fn normalize(segment: &str, policy: WhitespacePolicy, at_eof: bool) -> String {
    match policy {
        WhitespacePolicy::Exact => segment.to_string(),
        WhitespacePolicy::Trailing => {
            let mut lines: Vec<&str> = segment.split('\n').map(str::trim_end).collect();
            if at_eof {
                while lines.last().is_some_and(|line| line.is_empty()) {
                    lines.pop();
                }
            }
            lines.join("\n")
        }
        WhitespacePolicy::All => segment
            .split('\n')
            .map(|line| line.chars().filter(|c| !c.is_whitespace()).collect::<String>())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
