//! Redis-style glob matching for pattern subscriptions.
//!
//! Supported syntax: `*` (any sequence), `?` (any single byte), `[abc]`
//! character classes with `[^abc]` negation and `[a-z]` ranges, and `\`
//! escaping. Matching is byte-wise and case-sensitive.

/// Returns `true` if `channel` matches the glob `pattern`.
#[must_use]
pub fn matches(pattern: &str, channel: &str) -> bool {
    match_bytes(pattern.as_bytes(), channel.as_bytes())
}

fn match_bytes(p: &[u8], s: &[u8]) -> bool {
    let mut pi = 0;
    let mut si = 0;

    while pi < p.len() {
        match p[pi] {
            b'*' => {
                // Collapse consecutive stars
                while pi + 1 < p.len() && p[pi + 1] == b'*' {
                    pi += 1;
                }
                if pi + 1 == p.len() {
                    return true;
                }
                let mut k = si;
                loop {
                    if match_bytes(&p[pi + 1..], &s[k..]) {
                        return true;
                    }
                    if k == s.len() {
                        return false;
                    }
                    k += 1;
                }
            }
            b'?' => {
                if si == s.len() {
                    return false;
                }
                pi += 1;
                si += 1;
            }
            b'[' => {
                if si == s.len() {
                    return false;
                }
                pi += 1;
                let negate = pi < p.len() && p[pi] == b'^';
                if negate {
                    pi += 1;
                }
                let mut found = false;
                while pi < p.len() && p[pi] != b']' {
                    if p[pi] == b'\\' && pi + 1 < p.len() {
                        pi += 1;
                        if p[pi] == s[si] {
                            found = true;
                        }
                        pi += 1;
                    } else if pi + 2 < p.len() && p[pi + 1] == b'-' && p[pi + 2] != b']' {
                        let (lo, hi) = if p[pi] <= p[pi + 2] {
                            (p[pi], p[pi + 2])
                        } else {
                            (p[pi + 2], p[pi])
                        };
                        if (lo..=hi).contains(&s[si]) {
                            found = true;
                        }
                        pi += 3;
                    } else {
                        if p[pi] == s[si] {
                            found = true;
                        }
                        pi += 1;
                    }
                }
                if pi < p.len() {
                    pi += 1; // consume ']'
                }
                if found == negate {
                    return false;
                }
                si += 1;
            }
            b'\\' if pi + 1 < p.len() => {
                if si == s.len() || s[si] != p[pi + 1] {
                    return false;
                }
                pi += 2;
                si += 1;
            }
            literal => {
                if si == s.len() || s[si] != literal {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    si == s.len()
}
