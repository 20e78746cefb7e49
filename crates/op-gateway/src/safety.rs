//! Destructive-intent heuristics
//!
//! Two coarse layers: a pattern match on capability names and a
//! substring scan over serialized call arguments. False positives are
//! accepted; `allow_destructive` switches both off.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Verbs that mark a capability as destructive when they appear as a word
/// in its bare name (`delete_record`, `dropTable`, `purge-cache`, ...)
const DESTRUCTIVE_VERBS: &[&str] = &[
    "delete", "remove", "drop", "purge", "destroy", "truncate", "wipe", "erase", "deprovision",
];

/// Substrings in serialized arguments that signal destructive intent
const DESTRUCTIVE_ARGUMENT_PATTERNS: &[&str] = &[
    "drop table",
    "drop database",
    "drop schema",
    "truncate table",
    "delete from",
    "alter table",
    "rm -rf",
    "remove-item",
    "format-volume",
    "\"delete\"",
    "\"purge\"",
];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let verbs = DESTRUCTIVE_VERBS.join("|");
        Regex::new(&format!(r"(?:^|_)(?:{verbs})(?:_|$)")).expect("destructive verb pattern is valid")
    })
}

/// True if a bare capability name looks like a destructive operation
pub fn is_destructive_name(bare_name: &str) -> bool {
    name_pattern().is_match(&split_words(bare_name).join("_"))
}

/// Split `fooBar_baz-qux` into lowercase words
fn split_words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == '.' || ch.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// First destructive pattern found in the serialized arguments, if any
pub fn destructive_argument(args: &Value) -> Option<&'static str> {
    let serialized = args.to_string().to_lowercase();
    DESTRUCTIVE_ARGUMENT_PATTERNS
        .iter()
        .copied()
        .find(|pattern| serialized.contains(pattern))
}
