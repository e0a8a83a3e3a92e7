// Natural ("human") ordering of file names.
//
// `playlist2.txt` sorts before `playlist10.txt`: digit runs compare as integers,
// everything else compares as plain text. Every place that cares about segment
// sequence (entry pointer, eviction order, counter recovery) sorts through here.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run<'a> {
    Text(&'a str),
    Digits(&'a str),
}

/// Split into alternating text/digit runs, always starting with a (possibly
/// empty) text run so that runs at the same position have the same kind.
fn runs(s: &str) -> Vec<Run<'_>> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut in_digits = false;

    for (i, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        if is_digit != in_digits {
            out.push(if in_digits {
                Run::Digits(&s[start..i])
            } else {
                Run::Text(&s[start..i])
            });
            start = i;
            in_digits = is_digit;
        }
    }
    out.push(if in_digits {
        Run::Digits(&s[start..])
    } else {
        Run::Text(&s[start..])
    });
    out
}

/// Compare two digit runs by numeric value without parsing, so arbitrarily long
/// runs never overflow.
fn cmp_digits(a: &str, b: &str) -> Ordering {
    let ta = a.trim_start_matches('0');
    let tb = b.trim_start_matches('0');
    ta.len()
        .cmp(&tb.len())
        .then_with(|| ta.cmp(tb))
        // Same value: fewer leading zeros first, keeps the order total.
        .then_with(|| a.len().cmp(&b.len()))
}

pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let left = runs(a);
    let right = runs(b);

    for (x, y) in left.iter().zip(right.iter()) {
        let ord = match (x, y) {
            (Run::Digits(x), Run::Digits(y)) => cmp_digits(x, y),
            (Run::Text(x), Run::Text(y)) => x.cmp(y),
            (Run::Digits(_), Run::Text(_)) => Ordering::Less,
            (Run::Text(_), Run::Digits(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

pub fn sort_natural<S: AsRef<str>>(items: &mut [S]) {
    items.sort_by(|a, b| natural_cmp(a.as_ref(), b.as_ref()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playlists_sort_numerically() {
        let mut names = vec!["playlist10.txt", "playlist2.txt", "playlist1.txt"];
        sort_natural(&mut names);
        assert_eq!(names, vec!["playlist1.txt", "playlist2.txt", "playlist10.txt"]);
    }

    #[test]
    fn test_already_ordered_input_is_stable() {
        let mut names = vec!["playlist1.txt", "playlist2.txt", "playlist10.txt"];
        sort_natural(&mut names);
        assert_eq!(names, vec!["playlist1.txt", "playlist2.txt", "playlist10.txt"]);
    }

    #[test]
    fn test_text_runs_compare_as_text() {
        assert_eq!(natural_cmp("playlist3.txt", "segment1.flv"), Ordering::Less);
        assert_eq!(natural_cmp("a", "b"), Ordering::Less);
        assert_eq!(natural_cmp("same9", "same9"), Ordering::Equal);
    }

    #[test]
    fn test_leading_digits_and_prefixes() {
        assert_eq!(natural_cmp("2x", "10x"), Ordering::Less);
        assert_eq!(natural_cmp("file", "file1"), Ordering::Less);
        assert_eq!(natural_cmp("file01", "file1"), Ordering::Greater);
        assert_eq!(natural_cmp("file01", "file2"), Ordering::Less);
    }

    #[test]
    fn test_huge_numbers_do_not_overflow() {
        let big = "segment123456789012345678901234567890.flv";
        let bigger = "segment923456789012345678901234567890.flv";
        assert_eq!(natural_cmp(big, bigger), Ordering::Less);
        assert_eq!(natural_cmp("segment9.flv", big), Ordering::Less);
    }
}
