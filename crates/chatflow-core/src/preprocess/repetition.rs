//! Anti-repetition analysis of recent assistant turns.

use std::time::Duration;

use similar::{ChangeTag, TextDiff};

/// Similarity ratio above which two turns count as repetitive.
pub const SIMILARITY_THRESHOLD: f32 = 0.4;

/// Number of trailing assistant turns compared.
pub const COMPARED_TURNS: usize = 4;

/// Shortest shared run reported as a repeated phrase, in chars.
pub const MIN_PHRASE_CHARS: usize = 5;

const MAX_PHRASES: usize = 8;
const DIFF_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepetitionReport {
    /// Some pair of turns exceeded [`SIMILARITY_THRESHOLD`].
    pub strong_truncation: bool,
    /// Literal shared substrings, longest first, none contained in another.
    pub phrases: Vec<String>,
}

impl RepetitionReport {
    pub fn is_clean(&self) -> bool {
        !self.strong_truncation && self.phrases.is_empty()
    }
}

/// Compare the last [`COMPARED_TURNS`] of `turns` pairwise.
pub fn analyze<S: AsRef<str>>(turns: &[S]) -> RepetitionReport {
    let start = turns.len().saturating_sub(COMPARED_TURNS);
    let recent: Vec<&str> = turns[start..].iter().map(AsRef::as_ref).collect();

    let mut report = RepetitionReport::default();
    let mut runs = Vec::new();
    for (i, a) in recent.iter().enumerate() {
        for b in &recent[i + 1..] {
            let diff = TextDiff::configure()
                .timeout(DIFF_TIMEOUT)
                .diff_chars(*a, *b);
            if diff.ratio() > SIMILARITY_THRESHOLD {
                report.strong_truncation = true;
            }
            collect_equal_runs(&diff, &mut runs);
        }
    }

    runs.sort_by(|x: &String, y: &String| {
        y.chars().count().cmp(&x.chars().count()).then_with(|| x.cmp(y))
    });
    for run in runs {
        if report.phrases.len() == MAX_PHRASES {
            break;
        }
        if !report.phrases.iter().any(|kept| kept.contains(run.as_str())) {
            report.phrases.push(run);
        }
    }
    report
}

fn collect_equal_runs<'a>(diff: &TextDiff<'a, 'a, 'a, str>, runs: &mut Vec<String>) {
    let mut current = String::new();
    for change in diff.iter_all_changes() {
        if change.tag() == ChangeTag::Equal {
            current.push_str(&change.to_string_lossy());
        } else {
            push_run(&mut current, runs);
        }
    }
    push_run(&mut current, runs);
}

fn push_run(current: &mut String, runs: &mut Vec<String>) {
    let trimmed = current.trim();
    if trimmed.chars().count() >= MIN_PHRASE_CHARS {
        runs.push(trimmed.to_string());
    }
    current.clear();
}

/// Hint text steering the model away from the reported phrases.
pub fn hint(report: &RepetitionReport) -> Option<String> {
    if report.is_clean() {
        return None;
    }
    let mut hint =
        String::from("Your recent replies were repetitive. Take the conversation in a new direction.");
    if !report.phrases.is_empty() {
        let quoted: Vec<String> = report.phrases.iter().map(|p| format!("\"{p}\"")).collect();
        hint.push_str(" Do not reuse these phrases: ");
        hint.push_str(&quoted.join(", "));
        hint.push('.');
    }
    Some(hint)
}
