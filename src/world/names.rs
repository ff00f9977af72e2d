//! IRC name arbitration — turning remote display names into IRC-legal,
//! collision-free nicks and channel names.

use std::collections::HashMap;

/// The reserved nick of the gateway pseudo-user.
pub const GATEWAY_NICK: &str = "X";

/// RFC 1459 case folding: ASCII lowercase plus the equivalences
/// `[`↔`{`, `]`↔`}`, `\`↔`|`, `^`↔`~`.
pub fn fold(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'A'..='Z' => c.to_ascii_lowercase(),
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '^' => '~',
            other => other,
        })
        .collect()
}

/// Case-folded equality.
pub fn irc_eq(a: &str, b: &str) -> bool {
    fold(a) == fold(b)
}

/// Replace bytes that are illegal in an IRC name with `_`.
/// An empty result becomes the fallback base `_`.
pub fn sanitize(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '#' | ' ' | ',' | '<' | '>' | '!' | '\0' | '\r' | '\n' | ':' => '_',
            other => other,
        })
        .collect();
    if sanitized.is_empty() {
        "_".to_owned()
    } else {
        sanitized
    }
}

/// Pick an IRC-legal name for `proposed` that is free in `taken` (a map
/// keyed by folded names) and never the reserved gateway nick.
///
/// The sanitised base is used as-is when free; otherwise decimal suffixes
/// `1,2,3,…` are appended until a free name is found. Deterministic given
/// the map contents.
pub fn arbitrate<V>(proposed: &str, taken: &HashMap<String, V>) -> String {
    let base = sanitize(proposed);
    let reserved = fold(GATEWAY_NICK);

    let mut candidate = base.clone();
    let mut suffix = 0u64;
    loop {
        let folded = fold(&candidate);
        if folded != reserved && !taken.contains_key(&folded) {
            return candidate;
        }
        suffix += 1;
        candidate = format!("{base}{suffix}");
    }
}
