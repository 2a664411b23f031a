//! Text utilities

/// Lowercase and split into alphanumeric runs.
///
/// Every character outside `[a-z0-9]` (after lowercasing) acts as a separator,
/// which is how ROUGE scorers tokenize before n-gram counting.
pub fn alphanumeric_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split text into non-empty, trimmed lines
pub fn split_lines(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphanumeric_tokens() {
        assert_eq!(
            alphanumeric_tokens("Wind-power output: 12.5 GW!"),
            vec!["wind", "power", "output", "12", "5", "gw"]
        );
        assert!(alphanumeric_tokens("...").is_empty());
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines("a b\n\n  c  \n"), vec!["a b", "c"]);
    }
}
