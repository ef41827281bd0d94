//! # Postal Key Value Object
//!
//! Canonical, fixed-width lookup keys. Raw tokens coming out of spreadsheets
//! are messy (`501.0`, ` 00501 `, `501-`), so everything goes through
//! [`normalize`] before it reaches the scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width every key is left-padded to
pub const KEY_WIDTH: usize = 5;

/// Canonical lookup key: digits only, at least [`KEY_WIDTH`] wide
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Normalizes a raw token; `None` means the token carries no digits and must be dropped.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonicalizes a raw token into a key string (empty string = drop).
///
/// 1. strip a trailing `.0`/`.00` suffix left behind by numeric coercion
/// 2. drop every non-digit character
/// 3. left-pad to [`KEY_WIDTH`] with zeros
///
/// Idempotent: `normalize(&normalize(x)) == normalize(x)`.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let trimmed = strip_float_suffix(raw.trim());
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return String::new();
    }
    format!("{digits:0>KEY_WIDTH$}")
}

/// Normalizes a whole column, dropping tokens that yield no key.
pub fn normalize_all<I, S>(raw: I) -> Vec<Key>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter().filter_map(|token| Key::parse(token.as_ref())).collect()
}

fn strip_float_suffix(token: &str) -> &str {
    match token.rsplit_once('.') {
        Some((head, tail))
            if !head.is_empty() && !tail.is_empty() && tail.chars().all(|c| c == '0') =>
        {
            head
        }
        _ => token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("00501", "00501")]
    #[case("501", "00501")]
    #[case("0501", "00501")]
    #[case("501.0", "00501")]
    #[case("90210.00", "90210")]
    #[case(" 90210 ", "90210")]
    #[case("90210-1234", "902101234")]
    #[case("zip: 123", "00123")]
    #[case("", "")]
    #[case("ZIPCODE", "")]
    fn normalizes_raw_tokens(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize(raw), expected);
    }

    #[test]
    fn parse_drops_noise() {
        assert!(Key::parse("n/a").is_none());
        assert_eq!(Key::parse("7.0").map(|k| k.to_string()), Some("00007".to_string()));
    }

    #[test]
    fn normalize_all_keeps_order_and_duplicates() {
        let keys = normalize_all(["501", "header", "90210", "501.0"]);
        let keys: Vec<&str> = keys.iter().map(Key::as_str).collect();
        assert_eq!(keys, vec!["00501", "90210", "00501"]);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(raw in ".{0,16}") {
            let once = normalize(&raw);
            prop_assert_eq!(normalize(&once), once.clone());
        }

        #[test]
        fn normalized_keys_are_digits_and_wide_enough(raw in "[0-9]{1,9}(\\.0)?") {
            let key = normalize(&raw);
            prop_assert!(key.len() >= KEY_WIDTH);
            prop_assert!(key.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
