//! "Did you mean" suggestions for mistyped flags, subcommands and commands
//!
//! Each simulated tool registers its vocabulary once; lookups compare the
//! lower-cased input to every candidate by Levenshtein distance.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Outcome of validating one token against a vocabulary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub input: String,
    /// Closest candidates, best first, at most three
    pub suggestions: Vec<String>,
    /// 1.0 for an exact match, 0.0 when nothing is close
    pub confidence: f64,
    pub exact_match: bool,
}

impl MatchResult {
    fn unmatched(input: &str) -> Self {
        Self {
            input: input.to_string(),
            suggestions: Vec::new(),
            confidence: 0.0,
            exact_match: false,
        }
    }

    /// Suggestion sentence, if there is anything to suggest
    pub fn message(&self) -> Option<String> {
        match self.suggestions.as_slice() {
            [] => None,
            [only] => Some(format!("Did you mean '{}'?", only)),
            many => {
                let quoted: Vec<String> = many.iter().map(|s| format!("'{}'", s)).collect();
                Some(format!("Did you mean one of: {}?", quoted.join(", ")))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Vocabulary {
    flags: BTreeSet<String>,
    subcommands: BTreeSet<String>,
}

/// Per-tool registry of known flags and subcommands
#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    max_distance: usize,
    tools: HashMap<String, Vocabulary>,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new(3)
    }
}

impl FuzzyMatcher {
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            tools: HashMap::new(),
        }
    }

    /// Register flags (as typed, e.g. `--version` or `-i`) for a tool
    pub fn register_flags<I, S>(&mut self, tool: &str, flags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let vocab = self.tools.entry(tool.to_string()).or_default();
        vocab.flags.extend(flags.into_iter().map(Into::into));
    }

    /// Register subcommand names for a tool
    pub fn register_subcommands<I, S>(&mut self, tool: &str, subcommands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let vocab = self.tools.entry(tool.to_string()).or_default();
        vocab
            .subcommands
            .extend(subcommands.into_iter().map(Into::into));
    }

    pub fn is_registered(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    pub fn validate_flag(&self, tool: &str, flag: &str) -> MatchResult {
        match self.tools.get(tool) {
            Some(vocab) => self.closest(flag, vocab.flags.iter().map(String::as_str)),
            None => MatchResult::unmatched(flag),
        }
    }

    pub fn validate_subcommand(&self, tool: &str, subcommand: &str) -> MatchResult {
        match self.tools.get(tool) {
            Some(vocab) => self.closest(subcommand, vocab.subcommands.iter().map(String::as_str)),
            None => MatchResult::unmatched(subcommand),
        }
    }

    /// Match against an ad-hoc candidate list, e.g. registered tool names
    pub fn closest<'a, I>(&self, input: &str, candidates: I) -> MatchResult
    where
        I: IntoIterator<Item = &'a str>,
    {
        let needle = input.to_lowercase();
        let input_len = needle.chars().count();
        let threshold = self.max_distance.min((input_len / 2).max(2));

        let mut scored: Vec<(usize, &str)> = Vec::new();
        for candidate in candidates {
            let distance = levenshtein(&needle, &candidate.to_lowercase());
            if distance == 0 {
                return MatchResult {
                    input: input.to_string(),
                    suggestions: Vec::new(),
                    confidence: 1.0,
                    exact_match: true,
                };
            }
            if distance <= threshold {
                scored.push((distance, candidate));
            }
        }

        scored.sort();
        scored.truncate(3);

        let confidence = match scored.first() {
            Some((distance, best)) => {
                let longest = input_len.max(best.chars().count()).max(1);
                1.0 - *distance as f64 / longest as f64
            }
            None => 0.0,
        };

        MatchResult {
            input: input.to_string(),
            suggestions: scored.into_iter().map(|(_, c)| c.to_string()).collect(),
            confidence,
            exact_match: false,
        }
    }
}

/// Compute Levenshtein (edit) distance between two strings
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
