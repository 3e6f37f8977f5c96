use std::collections::HashSet;

/// Two descriptions at or above this word-set similarity count as duplicates.
pub const DUPLICATE_THRESHOLD: f64 = 0.8;

/// Lower-cased whitespace-separated words of `text`.
pub fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Jaccard similarity of the word sets of `a` and `b`.
///
/// Returns 0.0 when either side has no words.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let left = word_set(a);
    let right = word_set(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let overlap = left.intersection(&right).count();
    let union = left.union(&right).count();
    overlap as f64 / union as f64
}

/// Whether `a` and `b` are near-duplicates.
pub fn is_similar(a: &str, b: &str) -> bool {
    jaccard(a, b) >= DUPLICATE_THRESHOLD
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_is_one() {
        let score = jaccard("Fix UI issue: layout broken", "fix ui ISSUE: layout broken");
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(jaccard("", "anything"), 0.0);
    }

    #[test]
    fn test_threshold_boundary() {
        // 4 shared words out of 5 distinct = 0.8
        assert!(is_similar("a b c d", "a b c d e"));
        // 3 shared out of 5 distinct = 0.6
        assert!(!is_similar("a b c x", "a b c d e"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
