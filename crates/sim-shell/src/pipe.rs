//! Shell-pipe post-processing of simulated command output
//!
//! `nvidia-smi -q | grep -i temp | head -n 3` runs the simulator on the first
//! segment and threads its output through the remaining filters. Each filter
//! is a pure text transform. Unknown filter commands pass text through.

use crate::parser::{is_numeric, tokenize};
use regex::RegexBuilder;
use tracing::debug;

/// Split a line on `|` characters that are outside quotes
pub fn split_pipeline(line: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match (c, quote) {
            ('\\', q) if q != Some('\'') => {
                current.push(c);
                escaped = true;
            }
            ('\'' | '"', None) => {
                quote = Some(c);
                current.push(c);
            }
            (c, Some(q)) if c == q => {
                quote = None;
                current.push(c);
            }
            ('|', None) => segments.push(std::mem::take(&mut current)),
            (c, _) => current.push(c),
        }
    }
    segments.push(current);
    segments.into_iter().map(|s| s.trim().to_string()).collect()
}

/// Run `output` through every filter after the first segment of `full_line`
pub fn apply_pipe_filters(output: &str, full_line: &str) -> String {
    split_pipeline(full_line)
        .iter()
        .skip(1)
        .filter(|segment| !segment.is_empty())
        .map(|segment| PipeFilter::parse(segment))
        .fold(output.to_string(), |text, filter| filter.apply(&text))
}

/// Remove ANSI SGR escape sequences
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// A field selection for `cut`: 1-based, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl FieldRange {
    fn contains(&self, field: usize) -> bool {
        field >= self.start && self.end.map_or(true, |end| field <= end)
    }

    fn parse_list(spec: &str) -> Vec<FieldRange> {
        spec.split(',')
            .filter_map(|part| match part.split_once('-') {
                Some((a, b)) => {
                    let start = if a.is_empty() { 1 } else { a.parse().ok()? };
                    let end = if b.is_empty() { None } else { Some(b.parse().ok()?) };
                    Some(FieldRange { start, end })
                }
                None => {
                    let n = part.parse().ok()?;
                    Some(FieldRange {
                        start: n,
                        end: Some(n),
                    })
                }
            })
            .collect()
    }
}

/// Reference to a column in an awk `print` statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwkField {
    /// `$0`
    Line,
    /// `$N`, 1-based
    Column(usize),
    /// `$NF`
    Last,
}

/// A supported filter command
#[derive(Debug, Clone, PartialEq)]
pub enum PipeFilter {
    Grep {
        pattern: String,
        ignore_case: bool,
        invert: bool,
        extended: bool,
    },
    Head(usize),
    Tail(usize),
    /// `tail -n +N`: everything from line N on
    TailFrom(usize),
    Wc {
        lines: bool,
        words: bool,
        chars: bool,
    },
    Sort {
        reverse: bool,
        numeric: bool,
        unique: bool,
    },
    Uniq {
        count: bool,
    },
    Cut {
        delimiter: char,
        fields: Vec<FieldRange>,
    },
    Awk {
        separator: Option<String>,
        fields: Vec<AwkField>,
    },
    Cat,
    /// Anything unrecognised; output passes through unchanged
    Passthrough(String),
}

/// Short options of a filter such as `-rn`, split into their letters
fn option_letters(tokens: &[String]) -> Vec<char> {
    tokens
        .iter()
        .filter(|t| t.starts_with('-') && t.len() > 1 && !is_numeric(t))
        .flat_map(|t| t[1..].chars().collect::<Vec<_>>())
        .collect()
}

/// Line count for `head`/`tail`. The flag is set for `+N`, which counts
/// from the start of the input.
fn line_count_arg(args: &[String]) -> (usize, bool) {
    let count = |v: &str| match v.strip_prefix('+') {
        Some(rest) if is_numeric(rest) => rest.parse::<usize>().ok().map(|n| (n, true)),
        None if is_numeric(v) => v.parse::<usize>().ok().map(|n| (n, false)),
        _ => None,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-n" {
            if let Some(n) = iter.next().and_then(|v| count(v)) {
                return n;
            }
        } else if let Some(n) = arg.strip_prefix("-n").and_then(count) {
            return n;
        } else if let Some(n) = arg.strip_prefix("--lines=").and_then(count) {
            return n;
        } else if let Some(n) = arg.strip_prefix('-').filter(|v| is_numeric(v)).and_then(|v| v.parse().ok()) {
            return (n, false);
        }
    }
    (10, false)
}

/// Value of an option given either as `-dX` or `-d X`
fn option_value(args: &[String], option: &str) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == option {
            return iter.next().cloned();
        }
        if let Some(rest) = arg.strip_prefix(option) {
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

fn parse_awk_program(program: &str) -> Option<Vec<AwkField>> {
    let body = program.trim().strip_prefix('{')?.strip_suffix('}')?.trim();
    let args = body.strip_prefix("print")?.trim();
    if args.is_empty() {
        return Some(vec![AwkField::Line]);
    }
    args.split(',')
        .map(|field| {
            let name = field.trim().strip_prefix('$')?;
            match name {
                "0" => Some(AwkField::Line),
                "NF" => Some(AwkField::Last),
                n => n.parse().ok().map(AwkField::Column),
            }
        })
        .collect()
}

impl PipeFilter {
    /// Parse one pipeline segment such as `grep -i xid`
    pub fn parse(segment: &str) -> Self {
        let tokens = tokenize(segment);
        let Some((command, args)) = tokens.split_first() else {
            return PipeFilter::Cat;
        };
        let letters = option_letters(args);
        let has = |c: char| letters.contains(&c);

        match command.as_str() {
            "grep" | "egrep" => {
                let pattern = args
                    .iter()
                    .find(|a| !a.starts_with('-') || a.len() == 1)
                    .cloned()
                    .unwrap_or_default();
                PipeFilter::Grep {
                    pattern,
                    ignore_case: has('i'),
                    invert: has('v'),
                    extended: has('E') || command == "egrep",
                }
            }
            // GNU head reads `+N` as plain N
            "head" => PipeFilter::Head(line_count_arg(args).0),
            "tail" => match line_count_arg(args) {
                (n, true) => PipeFilter::TailFrom(n),
                (n, false) => PipeFilter::Tail(n),
            },
            "wc" => {
                let any = has('l') || has('w') || has('c') || has('m');
                PipeFilter::Wc {
                    lines: !any || has('l'),
                    words: !any || has('w'),
                    chars: !any || has('c') || has('m'),
                }
            }
            "sort" => PipeFilter::Sort {
                reverse: has('r'),
                numeric: has('n'),
                unique: has('u'),
            },
            "uniq" => PipeFilter::Uniq { count: has('c') },
            "cut" => {
                let delimiter = option_value(args, "-d")
                    .and_then(|d| d.chars().next())
                    .unwrap_or('\t');
                let fields = option_value(args, "-f")
                    .map(|f| FieldRange::parse_list(&f))
                    .unwrap_or_default();
                PipeFilter::Cut { delimiter, fields }
            }
            "awk" => {
                let separator = option_value(args, "-F");
                let program = args
                    .iter()
                    .find(|a| a.trim_start().starts_with('{'))
                    .and_then(|p| parse_awk_program(p));
                match program {
                    Some(fields) => PipeFilter::Awk { separator, fields },
                    None => {
                        debug!("Unsupported awk program in pipeline: {}", segment);
                        PipeFilter::Passthrough(segment.to_string())
                    }
                }
            }
            "cat" => PipeFilter::Cat,
            other => {
                debug!("Unknown pipe filter '{}', passing output through", other);
                PipeFilter::Passthrough(segment.to_string())
            }
        }
    }

    /// Apply the filter to a block of text
    pub fn apply(&self, input: &str) -> String {
        let lines: Vec<&str> = input.lines().collect();
        match self {
            PipeFilter::Grep {
                pattern,
                ignore_case,
                invert,
                extended,
            } => grep(&lines, pattern, *ignore_case, *invert, *extended),
            PipeFilter::Head(n) => lines.iter().take(*n).copied().collect::<Vec<_>>().join("\n"),
            PipeFilter::Tail(n) => {
                let skip = lines.len().saturating_sub(*n);
                lines[skip..].join("\n")
            }
            PipeFilter::TailFrom(n) => lines
                .iter()
                .skip(n.saturating_sub(1))
                .copied()
                .collect::<Vec<_>>()
                .join("\n"),
            PipeFilter::Wc {
                lines: l,
                words: w,
                chars: c,
            } => {
                let mut counts = Vec::new();
                if *l {
                    counts.push(lines.len());
                }
                if *w {
                    counts.push(lines.iter().map(|line| line.split_whitespace().count()).sum());
                }
                if *c {
                    counts.push(lines.iter().map(|line| line.len() + 1).sum());
                }
                match counts.as_slice() {
                    [single] => single.to_string(),
                    many => many
                        .iter()
                        .map(|n| format!("{:>7}", n))
                        .collect::<Vec<_>>()
                        .join(" "),
                }
            }
            PipeFilter::Sort {
                reverse,
                numeric,
                unique,
            } => {
                let mut sorted: Vec<&str> = lines.clone();
                if *numeric {
                    sorted.sort_by(|a, b| {
                        leading_number(a)
                            .partial_cmp(&leading_number(b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.cmp(b))
                    });
                } else {
                    sorted.sort();
                }
                if *reverse {
                    sorted.reverse();
                }
                if *unique {
                    sorted.dedup();
                }
                sorted.join("\n")
            }
            PipeFilter::Uniq { count } => {
                let mut groups: Vec<(usize, &str)> = Vec::new();
                for line in &lines {
                    match groups.last_mut() {
                        Some((n, last)) if last == line => *n += 1,
                        _ => groups.push((1, line)),
                    }
                }
                groups
                    .into_iter()
                    .map(|(n, line)| {
                        if *count {
                            format!("{:>7} {}", n, line)
                        } else {
                            line.to_string()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            PipeFilter::Cut { delimiter, fields } => lines
                .iter()
                .map(|line| {
                    if !line.contains(*delimiter) {
                        return line.to_string();
                    }
                    line.split(*delimiter)
                        .enumerate()
                        .filter(|(i, _)| fields.iter().any(|r| r.contains(i + 1)))
                        .map(|(_, f)| f)
                        .collect::<Vec<_>>()
                        .join(&delimiter.to_string())
                })
                .collect::<Vec<_>>()
                .join("\n"),
            PipeFilter::Awk { separator, fields } => lines
                .iter()
                .map(|line| {
                    let columns: Vec<&str> = match separator {
                        Some(sep) => line.split(sep.as_str()).collect(),
                        None => line.split_whitespace().collect(),
                    };
                    fields
                        .iter()
                        .map(|field| match field {
                            AwkField::Line => line.to_string(),
                            AwkField::Last => columns.last().copied().unwrap_or("").to_string(),
                            AwkField::Column(n) => n
                                .checked_sub(1)
                                .and_then(|i| columns.get(i))
                                .copied()
                                .unwrap_or("")
                                .to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
                .join("\n"),
            PipeFilter::Cat | PipeFilter::Passthrough(_) => input.to_string(),
        }
    }
}

fn leading_number(line: &str) -> f64 {
    let trimmed = line.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && *c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().unwrap_or(0.0)
}

fn grep(lines: &[&str], pattern: &str, ignore_case: bool, invert: bool, extended: bool) -> String {
    let matcher: Box<dyn Fn(&str) -> bool> = if extended {
        match RegexBuilder::new(pattern).case_insensitive(ignore_case).build() {
            Ok(re) => Box::new(move |line: &str| re.is_match(line)),
            Err(e) => {
                debug!("Invalid grep -E pattern '{}': {}", pattern, e);
                literal_matcher(pattern, ignore_case)
            }
        }
    } else {
        literal_matcher(pattern, ignore_case)
    };

    lines
        .iter()
        .filter(|line| matcher(&strip_ansi(line)) != invert)
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

/// Basic grep: literal text, with `\|` separating alternatives
fn literal_matcher(pattern: &str, ignore_case: bool) -> Box<dyn Fn(&str) -> bool> {
    let alternatives: Vec<String> = pattern
        .split("\\|")
        .map(|p| if ignore_case { p.to_lowercase() } else { p.to_string() })
        .collect();
    Box::new(move |line: &str| {
        let haystack = if ignore_case {
            line.to_lowercase()
        } else {
            line.to_string()
        };
        alternatives.iter().any(|p| haystack.contains(p.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "alpha 3\nBeta 1\ngamma 2\nbeta 10";

    #[test]
    fn test_split_pipeline_respects_quotes() {
        let segments = split_pipeline(r#"dmesg | grep "a|b" | wc -l"#);
        assert_eq!(segments, vec!["dmesg", r#"grep "a|b""#, "wc -l"]);
    }

    #[test]
    fn test_no_pipe_returns_output_unchanged() {
        assert_eq!(apply_pipe_filters(LOG, "nvidia-smi"), LOG);
    }

    #[test]
    fn test_grep_variants() {
        assert_eq!(apply_pipe_filters(LOG, "x | grep beta"), "beta 10");
        assert_eq!(apply_pipe_filters(LOG, "x | grep -i beta"), "Beta 1\nbeta 10");
        assert_eq!(
            apply_pipe_filters(LOG, "x | grep -v -i beta"),
            "alpha 3\ngamma 2"
        );
        assert_eq!(
            apply_pipe_filters(LOG, "x | grep -E '^(alpha|gamma)'"),
            "alpha 3\ngamma 2"
        );
        assert_eq!(
            apply_pipe_filters(LOG, r"x | grep 'alpha\|gamma'"),
            "alpha 3\ngamma 2"
        );
    }

    #[test]
    fn test_grep_ignores_ansi_codes() {
        let colored = "\u{1b}[31mFAIL\u{1b}[0m gpu0\nPASS gpu1";
        assert_eq!(
            apply_pipe_filters(colored, "x | grep 'FAIL gpu0'"),
            "\u{1b}[31mFAIL\u{1b}[0m gpu0"
        );
    }

    #[test]
    fn test_head_and_tail() {
        assert_eq!(apply_pipe_filters(LOG, "x | head -n 2"), "alpha 3\nBeta 1");
        assert_eq!(apply_pipe_filters(LOG, "x | head -1"), "alpha 3");
        assert_eq!(apply_pipe_filters(LOG, "x | tail -n 1"), "beta 10");
        assert_eq!(apply_pipe_filters(LOG, "x | tail -2"), "gamma 2\nbeta 10");
    }

    #[test]
    fn test_plus_line_counts() {
        assert_eq!(apply_pipe_filters(LOG, "x | tail -n +3"), "gamma 2\nbeta 10");
        assert_eq!(apply_pipe_filters(LOG, "x | tail -n +0"), LOG);
        assert_eq!(apply_pipe_filters(LOG, "x | tail --lines=+4"), "beta 10");
        assert_eq!(apply_pipe_filters(LOG, "x | tail -n +9"), "");
        assert_eq!(apply_pipe_filters(LOG, "x | head -n +1"), "alpha 3");
        assert_eq!(PipeFilter::parse("tail -n +2"), PipeFilter::TailFrom(2));
    }

    #[test]
    fn test_wc() {
        assert_eq!(apply_pipe_filters(LOG, "x | wc -l"), "4");
        assert_eq!(apply_pipe_filters("a b\nc", "x | wc -w"), "3");
        assert_eq!(
            apply_pipe_filters("a b\nc", "x | wc"),
            "      2       3       6"
        );
    }

    #[test]
    fn test_sort_uniq_count() {
        let result = apply_pipe_filters("a\nb\na", "x | sort | uniq -c");
        assert_eq!(result, "      2 a\n      1 b");
    }

    #[test]
    fn test_uniq_is_adjacent_only() {
        assert_eq!(apply_pipe_filters("a\nb\na", "x | uniq"), "a\nb\na");
    }

    #[test]
    fn test_sort_numeric_reverse_unique() {
        assert_eq!(apply_pipe_filters("10\n9\n100", "x | sort -n"), "9\n10\n100");
        assert_eq!(apply_pipe_filters("10\n9\n100", "x | sort -rn"), "100\n10\n9");
        assert_eq!(apply_pipe_filters("b\na\nb", "x | sort -u"), "a\nb");
    }

    #[test]
    fn test_cut() {
        let csv = "0, 45, 300\n1, 92, 310";
        assert_eq!(apply_pipe_filters(csv, "x | cut -d, -f2"), " 45\n 92");
        assert_eq!(
            apply_pipe_filters(csv, "x | cut -d ',' -f 1,3"),
            "0, 300\n1, 310"
        );
        assert_eq!(apply_pipe_filters("a:b:c:d", "x | cut -d: -f2-"), "b:c:d");
        assert_eq!(apply_pipe_filters("no delimiter", "x | cut -d: -f2"), "no delimiter");
    }

    #[test]
    fn test_awk_print() {
        assert_eq!(apply_pipe_filters(LOG, "x | awk '{print $2}'"), "3\n1\n2\n10");
        assert_eq!(
            apply_pipe_filters("a b c", "x | awk '{print $3, $1}'"),
            "c a"
        );
        assert_eq!(apply_pipe_filters("a,b", "x | awk -F, '{print $NF}'"), "b");
    }

    #[test]
    fn test_unknown_filter_passes_through() {
        assert_eq!(apply_pipe_filters(LOG, "x | less"), LOG);
        assert_eq!(apply_pipe_filters(LOG, "x | cat"), LOG);
    }

    #[test]
    fn test_chained_filters() {
        let result = apply_pipe_filters(LOG, "x | grep -i beta | awk '{print $2}' | sort -n");
        assert_eq!(result, "1\n10");
    }
}
