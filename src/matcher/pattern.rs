//! Match template extraction and matching.

use std::fmt;

use crate::crypto::{Address, ADDRESS_HEX_LEN};

/// Number of literal characters taken from the start of the target.
pub const PREFIX_LEN: usize = 6;

/// Number of literal characters taken from the end of the target.
pub const SUFFIX_LEN: usize = 4;

/// Wildcard marker understood by the search engine.
pub const WILDCARD: char = 'X';

/// Builds the 40-character search template for a target value.
///
/// The optional `0x` prefix is dropped and the value lowercased. The first
/// six and last four characters are kept, the thirty in between become
/// [`WILDCARD`]. Input shorter than ten characters yields a malformed
/// template; callers validate length before getting here.
pub fn extract_pattern(target: &str) -> String {
    let lowered = target.to_lowercase();
    let cleaned = lowered.strip_prefix("0x").unwrap_or(&lowered);
    let chars: Vec<char> = cleaned.chars().collect();

    let head_end = PREFIX_LEN.min(chars.len());
    let tail_start = chars.len().saturating_sub(SUFFIX_LEN);
    let middle_len = ADDRESS_HEX_LEN - PREFIX_LEN - SUFFIX_LEN;

    let mut template = String::with_capacity(ADDRESS_HEX_LEN);
    template.extend(&chars[..head_end]);
    template.extend(std::iter::repeat(WILDCARD).take(middle_len));
    template.extend(&chars[tail_start..]);
    template
}

/// Errors from parsing a template received over the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Template must be {expected} characters, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("Template contains invalid character {0:?}")]
    BadCharacter(char),
}

/// Result of a pattern match operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// Full match found
    Match,
    /// No match
    NoMatch,
}

impl MatchResult {
    #[inline]
    pub fn is_match(self) -> bool {
        matches!(self, MatchResult::Match)
    }
}

/// A validated 40-character template: lowercase hex literals and wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPattern {
    template: String,
}

impl MatchPattern {
    /// Parses a template, accepting upper-case hex literals.
    pub fn new(template: &str) -> Result<Self, PatternError> {
        let len = template.chars().count();
        if len != ADDRESS_HEX_LEN {
            return Err(PatternError::BadLength {
                expected: ADDRESS_HEX_LEN,
                actual: len,
            });
        }

        let mut normalized = String::with_capacity(ADDRESS_HEX_LEN);
        for c in template.chars() {
            match c {
                WILDCARD => normalized.push(WILDCARD),
                c if c.is_ascii_hexdigit() => normalized.push(c.to_ascii_lowercase()),
                other => return Err(PatternError::BadCharacter(other)),
            }
        }

        Ok(Self {
            template: normalized,
        })
    }

    /// Returns the template string.
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Matches an address against the template.
    #[inline]
    pub fn matches(&self, address: &Address) -> MatchResult {
        let addr_hex = address.to_hex();
        let matched = self
            .template
            .bytes()
            .zip(addr_hex.bytes())
            .all(|(t, a)| t == WILDCARD as u8 || t == a);

        if matched {
            MatchResult::Match
        } else {
            MatchResult::NoMatch
        }
    }

    /// Number of literal (non-wildcard) nibbles.
    pub fn literal_nibbles(&self) -> usize {
        self.template.chars().filter(|&c| c != WILDCARD).count()
    }

    /// Returns the estimated difficulty (number of attempts to find a match).
    ///
    /// Each literal nibble has 16 possible values, so the expected attempts
    /// are `16^n`.
    pub fn estimated_difficulty(&self) -> u64 {
        16u64.saturating_pow(self.literal_nibbles() as u32)
    }

    /// Returns a human-readable difficulty estimate.
    pub fn difficulty_description(&self) -> String {
        let diff = self.estimated_difficulty();
        match diff {
            0..=1_000 => "Very Easy (< 1 second)".into(),
            1_001..=100_000 => "Easy (seconds)".into(),
            100_001..=10_000_000 => "Medium (minutes)".into(),
            10_000_001..=1_000_000_000 => "Hard (hours)".into(),
            _ => "Very Hard (GPU required)".into(),
        }
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}
