//! # sim-shell
//!
//! Shell front end for clustersim: tokenizing and parsing command lines,
//! "did you mean" suggestions, and the text filters that follow a `|`.

pub mod fuzzy;
pub mod parser;
pub mod pipe;

pub use fuzzy::{levenshtein, FuzzyMatcher, MatchResult};
pub use parser::{is_numeric, parse, tokenize, FlagValue, ParsedCommand};
pub use pipe::{apply_pipe_filters, split_pipeline, strip_ansi, PipeFilter};
