//! Byte-wise glob matching used by `KEYS` and `SCAN`.
//!
//! `*` matches any (possibly empty) run of bytes, `?` matches exactly one
//! byte, everything else matches literally. Implemented iteratively with
//! two backtrack pointers rather than recursion, so pathological patterns
//! like `a*a*a*a*b` against a long run of `a`s run in linear amortized time
//! instead of blowing the stack or going exponential.

/// Returns `true` if `pattern` matches `key` under the glob rules above.
pub fn matches(pattern: &[u8], key: &[u8]) -> bool {
    // `*` alone, or any pattern ending in `*` with no further `*`/`?` to
    // worry about, short-circuits once the literal prefix has matched.
    if pattern == b"*" {
        return true;
    }

    let (mut pi, mut ki) = (0usize, 0usize);
    let (mut star_idx, mut star_k) = (None::<usize>, 0usize);

    while ki < key.len() {
        if pi < pattern.len() && (pattern[pi] == b'?' || pattern[pi] == key[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < pattern.len() && pattern[pi] == b'*' {
            star_idx = Some(pi);
            star_k = ki;
            pi += 1;
        } else if let Some(si) = star_idx {
            pi = si + 1;
            star_k += 1;
            ki = star_k;
        } else {
            return false;
        }
    }

    while pi < pattern.len() && pattern[pi] == b'*' {
        pi += 1;
    }

    pi == pattern.len()
}

/// Returns `true` if every byte of `pattern` before its first `*` is a
/// literal prefix, letting callers fast-path `KEYS prefix*` without running
/// the full matcher over every key in the map.
pub fn literal_prefix(pattern: &[u8]) -> Option<&[u8]> {
    if pattern.len() >= 1 && pattern[pattern.len() - 1] == b'*' && !pattern[..pattern.len() - 1].contains(&b'*') && !pattern.contains(&b'?') {
        Some(&pattern[..pattern.len() - 1])
    } else {
        None
    }
}
