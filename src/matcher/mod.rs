//! Match templates for Ethereum addresses.
//!
//! A template is 40 characters: literal lowercase hex nibbles that must
//! appear in the address at the same position, and `X` wildcards.

mod pattern;

pub use pattern::{
    extract_pattern, MatchPattern, MatchResult, PatternError, PREFIX_LEN, SUFFIX_LEN, WILDCARD,
};
