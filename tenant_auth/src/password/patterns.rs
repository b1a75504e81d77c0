//! Weak-pattern detection over three-character windows.

/// Keyboard rows checked for adjacency runs, in both directions
pub const KEYBOARD_ROWS: [&str; 4] = ["1234567890", "qwertyuiop", "asdfghjkl", "zxcvbnm"];

/// Kind of weak pattern found in a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakPattern {
    /// Same character three times
    Repeat,
    /// Ascending or descending digits or letters
    Sequence,
    /// Adjacent keys on one keyboard row
    KeyboardRun,
}

/// Every weak pattern matched by a sliding window of three characters
///
/// Input is compared case-insensitively.
pub fn find_weak_patterns(password: &str) -> Vec<WeakPattern> {
    let chars: Vec<char> = password.to_lowercase().chars().collect();

    chars
        .windows(3)
        .filter_map(|w| {
            if w[0] == w[1] && w[1] == w[2] {
                Some(WeakPattern::Repeat)
            } else if is_sequence(w) {
                Some(WeakPattern::Sequence)
            } else if is_keyboard_run(w) {
                Some(WeakPattern::KeyboardRun)
            } else {
                None
            }
        })
        .collect()
}

fn is_sequence(w: &[char]) -> bool {
    let same_class = w.iter().all(char::is_ascii_digit) || w.iter().all(char::is_ascii_lowercase);
    if !same_class {
        return false;
    }
    let (a, b, c) = (w[0] as i32, w[1] as i32, w[2] as i32);
    (b - a == 1 && c - b == 1) || (a - b == 1 && b - c == 1)
}

fn is_keyboard_run(w: &[char]) -> bool {
    let window: String = w.iter().collect();
    let reversed: String = w.iter().rev().collect();
    KEYBOARD_ROWS
        .iter()
        .any(|row| row.contains(&window) || row.contains(&reversed))
}

/// Length of the longest run of one repeated character
pub fn longest_run(password: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;

    for c in password.chars() {
        if Some(c) == previous {
            current += 1;
        } else {
            current = 1;
            previous = Some(c);
        }
        longest = longest.max(current);
    }

    longest
}

/// Highest share of the password taken by a single character
pub fn max_char_share(password: &str) -> f64 {
    let total = password.chars().count();
    if total == 0 {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    for c in password.chars() {
        *counts.entry(c).or_insert(0usize) += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    max as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_each_pattern() {
        assert_eq!(find_weak_patterns("aaa"), vec![WeakPattern::Repeat]);
        assert_eq!(find_weak_patterns("789"), vec![WeakPattern::Sequence]);
        assert_eq!(find_weak_patterns("CBA"), vec![WeakPattern::Sequence]);
        assert_eq!(find_weak_patterns("sdf"), vec![WeakPattern::KeyboardRun]);
        assert_eq!(find_weak_patterns("mnb"), vec![WeakPattern::KeyboardRun]);
    }

    #[test]
    fn test_mixed_classes_are_not_sequences() {
        assert!(find_weak_patterns("9ab").is_empty());
        assert!(find_weak_patterns("T0u").is_empty());
    }

    #[test]
    fn test_counts_every_window() {
        assert_eq!(find_weak_patterns("abcd").len(), 2);
        assert_eq!(find_weak_patterns("qwerty").len(), 4);
    }

    #[test]
    fn test_longest_run() {
        assert_eq!(longest_run(""), 0);
        assert_eq!(longest_run("abc"), 1);
        assert_eq!(longest_run("abbbbc"), 4);
    }

    #[test]
    fn test_max_char_share() {
        assert_eq!(max_char_share(""), 0.0);
        assert!((max_char_share("aab") - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
