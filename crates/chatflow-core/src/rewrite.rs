//! Text substitution for assistant output, whole-string and streaming.
//!
//! All rules compile into one alternation so a single left-to-right pass
//! applies them; replacements are literal text. [`StreamRewrite`] keeps the
//! raw buffer of one response and re-substitutes it on every delta, emitting
//! only text that can no longer change. Concatenating its deltas yields
//! exactly `apply(whole_text)` for any chunking, as long as regex rules
//! match at most `regex_max_span` characters.

use std::sync::Arc;

use chatflow_types::config::{RewriteConfig, RewriteRule};
use chatflow_types::error::RewriteError;
use regex::{Captures, Regex};

/// Compiled substitution rules.
#[derive(Debug, Clone, Default)]
pub struct Rewriter {
    regex: Option<Regex>,
    group_names: Vec<String>,
    replacements: Vec<String>,
    /// Characters at the end of the buffer that may still change.
    holdback: usize,
}

impl Rewriter {
    /// A rewriter that leaves text untouched.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RewriteConfig) -> Result<Self, RewriteError> {
        Self::new(&config.rules, config.regex_max_span)
    }

    pub fn new(rules: &[RewriteRule], regex_max_span: usize) -> Result<Self, RewriteError> {
        let mut alternatives = Vec::with_capacity(rules.len());
        let mut group_names = Vec::with_capacity(rules.len());
        let mut replacements = Vec::with_capacity(rules.len());
        let mut holdback = 0;

        for rule in rules {
            if rule.pattern.is_empty() {
                tracing::warn!("Skipping rewrite rule with empty pattern");
                continue;
            }

            let body = if rule.regex {
                Regex::new(&rule.pattern).map_err(|e| RewriteError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    message: e.to_string(),
                })?;
                holdback = holdback.max(regex_max_span);
                rule.pattern.clone()
            } else {
                holdback = holdback.max(rule.pattern.chars().count());
                regex::escape(&rule.pattern)
            };
            let flags = if rule.case_insensitive { "i" } else { "" };
            let name = format!("r{}", group_names.len());
            alternatives.push(format!("(?P<{name}>(?{flags}:{body}))"));
            group_names.push(name);
            replacements.push(rule.replacement.clone());
        }

        if alternatives.is_empty() {
            return Ok(Self::empty());
        }

        let combined = alternatives.join("|");
        let regex = Regex::new(&combined).map_err(|e| RewriteError::InvalidPattern {
            pattern: combined.clone(),
            message: e.to_string(),
        })?;

        Ok(Self {
            regex: Some(regex),
            group_names,
            replacements,
            holdback,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.regex.is_none()
    }

    /// Substitute every rule match in `text`.
    pub fn apply(&self, text: &str) -> String {
        match &self.regex {
            None => text.to_string(),
            Some(regex) => regex
                .replace_all(text, |caps: &Captures<'_>| self.replacement_for(caps).to_string())
                .into_owned(),
        }
    }

    fn replacement_for(&self, caps: &Captures<'_>) -> &str {
        self.group_names
            .iter()
            .position(|name| caps.name(name).is_some())
            .map(|i| self.replacements[i].as_str())
            .unwrap_or_default()
    }

    /// Substituted text of `raw` that no further input can change.
    fn stable_prefix(&self, raw: &str) -> String {
        let Some(regex) = &self.regex else {
            return raw.to_string();
        };
        let boundary = raw
            .char_indices()
            .rev()
            .nth(self.holdback.saturating_sub(1))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let mut out = String::with_capacity(raw.len());
        let mut last = 0;
        for caps in regex.captures_iter(raw) {
            let Some(m) = caps.get(0) else { continue };
            if m.start() >= boundary {
                break;
            }
            out.push_str(&raw[last..m.start()]);
            out.push_str(self.replacement_for(&caps));
            last = m.end();
        }
        if last < boundary {
            out.push_str(&raw[last..boundary]);
        }
        out
    }
}

/// Output of feeding one delta to a [`StreamRewrite`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteStep {
    /// Newly stable text, if any.
    pub delta: Option<String>,
    /// Substituted text of everything received so far.
    pub full: String,
}

/// Per-request streaming state.
#[derive(Debug, Clone)]
pub struct StreamRewrite {
    rewriter: Arc<Rewriter>,
    raw: String,
    emitted: String,
}

impl StreamRewrite {
    pub fn new(rewriter: Arc<Rewriter>) -> Self {
        Self {
            rewriter,
            raw: String::new(),
            emitted: String::new(),
        }
    }

    /// Append a raw chunk and return what to forward downstream.
    pub fn push(&mut self, chunk: &str) -> RewriteStep {
        self.raw.push_str(chunk);
        let stable = self.rewriter.stable_prefix(&self.raw);
        RewriteStep {
            delta: self.advance(stable),
            full: self.rewriter.apply(&self.raw),
        }
    }

    /// The stream ended: release the held-back tail.
    pub fn finish(&mut self) -> RewriteStep {
        let full = self.rewriter.apply(&self.raw);
        RewriteStep {
            delta: self.advance(full.clone()),
            full,
        }
    }

    fn advance(&mut self, stable: String) -> Option<String> {
        if stable.len() <= self.emitted.len() {
            return None;
        }
        match stable.strip_prefix(self.emitted.as_str()) {
            Some(suffix) => {
                let delta = suffix.to_string();
                self.emitted = stable;
                Some(delta)
            }
            None => {
                tracing::warn!(
                    emitted = self.emitted.len(),
                    "Rewritten text diverged from emitted prefix, withholding delta"
                );
                None
            }
        }
    }

    /// Everything received so far, unsubstituted.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Everything forwarded so far through the delta channel.
    pub fn emitted(&self) -> &str {
        &self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter(rules: &[RewriteRule]) -> Arc<Rewriter> {
        Arc::new(Rewriter::new(rules, 16).unwrap())
    }

    fn stream_in_chunks(rewriter: &Arc<Rewriter>, text: &str, size: usize) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut stream = StreamRewrite::new(Arc::clone(rewriter));
        let mut out = String::new();
        for chunk in chars.chunks(size) {
            let chunk: String = chunk.iter().collect();
            let step = stream.push(&chunk);
            assert_eq!(step.full, rewriter.apply(stream.raw()));
            if let Some(delta) = step.delta {
                out.push_str(&delta);
            }
            assert_eq!(out, stream.emitted());
        }
        if let Some(delta) = stream.finish().delta {
            out.push_str(&delta);
        }
        out
    }

    #[test]
    fn test_literal_rule() {
        let rw = rewriter(&[RewriteRule::literal("As an AI", "I")]);
        assert_eq!(rw.apply("As an AI model, As an AI"), "I model, I");
    }

    #[test]
    fn test_case_insensitive_rule() {
        let mut rule = RewriteRule::literal("colour", "color");
        rule.case_insensitive = true;
        let rw = rewriter(&[rule]);
        assert_eq!(rw.apply("Colour and COLOUR"), "color and color");
    }

    #[test]
    fn test_regex_rule() {
        let rw = rewriter(&[RewriteRule::regex(r"\d{3}-\d{4}", "[phone]")]);
        assert_eq!(rw.apply("call 555-1234 now"), "call [phone] now");
    }

    #[test]
    fn test_replacement_is_literal() {
        let rw = rewriter(&[RewriteRule::regex(r"(\w+)@example\.com", "$1 at example")]);
        assert_eq!(rw.apply("bob@example.com"), "$1 at example");
    }

    #[test]
    fn test_earlier_rule_wins_at_same_position() {
        let rw = rewriter(&[
            RewriteRule::literal("foo", "A"),
            RewriteRule::literal("foobar", "B"),
        ]);
        assert_eq!(rw.apply("foobar"), "Abar");
    }

    #[test]
    fn test_invalid_regex_reports_pattern() {
        let err = Rewriter::new(&[RewriteRule::regex("(unclosed", "")], 16).unwrap_err();
        match err {
            RewriteError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "(unclosed"),
        }
    }

    #[test]
    fn test_empty_rules_pass_through() {
        let rw = Arc::new(Rewriter::empty());
        assert!(rw.is_empty());
        let mut stream = StreamRewrite::new(Arc::clone(&rw));
        assert_eq!(stream.push("hel").delta.as_deref(), Some("hel"));
        assert_eq!(stream.push("lo").delta.as_deref(), Some("lo"));
        assert_eq!(stream.finish().delta, None);
    }

    #[test]
    fn test_match_split_across_chunks() {
        let rw = rewriter(&[RewriteRule::literal("As an AI", "I")]);
        let mut stream = StreamRewrite::new(Arc::clone(&rw));

        let step = stream.push("As a");
        assert_eq!(step.delta, None);
        assert_eq!(step.full, "As a");

        let step = stream.push("n AI model");
        assert_eq!(step.delta.as_deref(), Some("I"));
        assert_eq!(step.full, "I model");

        let step = stream.finish();
        assert_eq!(step.delta.as_deref(), Some(" model"));
        assert_eq!(stream.emitted(), "I model");
    }

    #[test]
    fn test_any_chunking_matches_whole_substitution() {
        let rw = rewriter(&[
            RewriteRule::literal("As an AI", "I"),
            RewriteRule::literal("delve", "dig"),
            RewriteRule::regex(r"\d{3}-\d{4}", "[phone]"),
        ]);
        let text = "As an AI, I will delve into 555-1234. As an AI... délve? delve!";
        let expected = rw.apply(text);
        for size in 1..=text.chars().count() {
            assert_eq!(stream_in_chunks(&rw, text, size), expected, "chunk size {size}");
        }
    }

    #[test]
    fn test_two_way_splits_match_whole_substitution() {
        let rw = rewriter(&[RewriteRule::literal("abc", "X"), RewriteRule::literal("bcd", "Y")]);
        let text = "zabcdabcbcdz";
        let expected = rw.apply(text);
        for split in 0..=text.len() {
            let mut stream = StreamRewrite::new(Arc::clone(&rw));
            let mut out = String::new();
            for chunk in [&text[..split], &text[split..]] {
                if let Some(delta) = stream.push(chunk).delta {
                    out.push_str(&delta);
                }
            }
            if let Some(delta) = stream.finish().delta {
                out.push_str(&delta);
            }
            assert_eq!(out, expected, "split at {split}");
        }
    }

    #[test]
    fn test_multibyte_text_is_split_on_char_boundaries() {
        let rw = rewriter(&[RewriteRule::literal("日本", "Japan")]);
        let text = "こんにちは日本語の世界日本";
        assert_eq!(stream_in_chunks(&rw, text, 1), rw.apply(text));
        assert_eq!(stream_in_chunks(&rw, text, 3), rw.apply(text));
    }
}
