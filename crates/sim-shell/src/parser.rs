//! Command-line tokenizer and parser
//!
//! Turns a raw line such as `nvidia-smi -q -i 0` into a [`ParsedCommand`].
//! Parsing never fails: an empty or whitespace-only line produces a command
//! whose `base_command` is empty.
//!
//! A token starting with a single dash is always one flag, so `-mig` is the
//! flag `mig` and never the bundle `-m -i -g`. Several simulated tools use
//! multi-letter short flags (`-lgip`, `-pl`, `-mig`), so POSIX bundling is
//! intentionally not supported.

use serde::Serialize;
use std::collections::BTreeMap;

/// Value bound to a flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FlagValue {
    /// Flag given without a value
    Switch,
    /// Flag given with `--name=value` or followed by a non-flag token
    Value(String),
}

impl FlagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Switch => None,
            FlagValue::Value(v) => Some(v),
        }
    }
}

/// Structured result of parsing one command line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedCommand {
    /// First token, e.g. `nvidia-smi`
    pub base_command: String,
    /// Leading non-flag tokens before the first flag
    pub subcommands: Vec<String>,
    /// Flags keyed by name without leading dashes
    pub flags: BTreeMap<String, FlagValue>,
    /// Remaining non-flag tokens
    pub positional_args: Vec<String>,
    /// Every token after the base command, unquoted
    pub raw_args: Vec<String>,
    /// Original text
    pub raw: String,
}

impl ParsedCommand {
    pub fn is_empty(&self) -> bool {
        self.base_command.is_empty()
    }

    /// Whether any of the given flag names is present
    pub fn has_flag(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.flags.contains_key(*n))
    }

    /// Value of the first of the given flags that carries one
    pub fn flag_value(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|n| self.flags.get(*n))
            .find_map(FlagValue::as_str)
    }

    pub fn subcommand(&self, index: usize) -> Option<&str> {
        self.subcommands.get(index).map(String::as_str)
    }

    /// Subcommands followed by positional arguments
    pub fn operands(&self) -> impl Iterator<Item = &str> {
        self.subcommands
            .iter()
            .chain(self.positional_args.iter())
            .map(String::as_str)
    }

    /// The flag as the user typed it, e.g. `--query-gpu` or `-i`
    pub fn flag_token(&self, name: &str) -> String {
        self.raw_args
            .iter()
            .find(|t| {
                let bare = t.trim_start_matches('-');
                t.starts_with('-') && (bare == name || bare.starts_with(&format!("{}=", name)))
            })
            .map(|t| t.split('=').next().unwrap_or(t).to_string())
            .unwrap_or_else(|| {
                if name.chars().count() == 1 {
                    format!("-{}", name)
                } else {
                    format!("--{}", name)
                }
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Normal,
    SingleQuote,
    DoubleQuote,
    Escape { resume: ResumeState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeState {
    Normal,
    DoubleQuote,
}

/// Split a line into shell-style words.
///
/// Quotes group whitespace; a backslash escapes `"`, `'` and `\` and is kept
/// literally before any other character. Single quotes disable escapes.
/// An unterminated quote runs to the end of the line.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut state = LexState::Normal;

    for c in line.chars() {
        // An escape before an ordinary character keeps the backslash and
        // hands the character back to the state it interrupted.
        if let LexState::Escape { resume } = state {
            state = match resume {
                ResumeState::Normal => LexState::Normal,
                ResumeState::DoubleQuote => LexState::DoubleQuote,
            };
            if matches!(c, '"' | '\'' | '\\') {
                current.push(c);
                continue;
            }
            current.push('\\');
        }

        match state {
            LexState::Normal => match c {
                '\'' => {
                    state = LexState::SingleQuote;
                    in_token = true;
                }
                '"' => {
                    state = LexState::DoubleQuote;
                    in_token = true;
                }
                '\\' => {
                    state = LexState::Escape {
                        resume: ResumeState::Normal,
                    };
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
            LexState::SingleQuote => match c {
                '\'' => state = LexState::Normal,
                c => current.push(c),
            },
            LexState::DoubleQuote => match c {
                '"' => state = LexState::Normal,
                '\\' => {
                    state = LexState::Escape {
                        resume: ResumeState::DoubleQuote,
                    }
                }
                c => current.push(c),
            },
            LexState::Escape { .. } => unreachable!("escape handled above"),
        }
    }

    if let LexState::Escape { .. } = state {
        current.push('\\');
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Whether a token is an integer such as `0`, `42` or `-1`
pub fn is_numeric(token: &str) -> bool {
    let digits = token.strip_prefix('-').unwrap_or(token);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_flag_shaped(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-') && !is_numeric(token)
}

/// Parse a command line into a [`ParsedCommand`]
pub fn parse(line: &str) -> ParsedCommand {
    let tokens = tokenize(line);
    let Some((base, rest)) = tokens.split_first() else {
        return ParsedCommand {
            raw: line.to_string(),
            ..ParsedCommand::default()
        };
    };

    let mut parsed = ParsedCommand {
        base_command: base.clone(),
        raw_args: rest.to_vec(),
        raw: line.to_string(),
        ..ParsedCommand::default()
    };

    let mut flags_enabled = true;
    let mut collecting_subcommands = true;
    let mut i = 0;

    while i < rest.len() {
        let token = &rest[i];

        if flags_enabled && token == "--" {
            flags_enabled = false;
            collecting_subcommands = false;
            i += 1;
            continue;
        }

        if flags_enabled && is_flag_shaped(token) {
            collecting_subcommands = false;
            let (name, inline_value) = match token.strip_prefix("--") {
                Some(long) => match long.split_once('=') {
                    Some((name, value)) => (name.to_string(), Some(value.to_string())),
                    None => (long.to_string(), None),
                },
                None => (token[1..].to_string(), None),
            };

            let value = match inline_value {
                Some(v) => {
                    i += 1;
                    FlagValue::Value(v)
                }
                None => match rest.get(i + 1) {
                    Some(next) if !is_flag_shaped(next) => {
                        i += 2;
                        FlagValue::Value(next.clone())
                    }
                    _ => {
                        i += 1;
                        FlagValue::Switch
                    }
                },
            };
            parsed.flags.insert(name, value);
            continue;
        }

        if collecting_subcommands && !is_numeric(token) {
            parsed.subcommands.push(token.clone());
        } else {
            collecting_subcommands = false;
            parsed.positional_args.push(token.clone());
        }
        i += 1;
    }

    parsed
}
