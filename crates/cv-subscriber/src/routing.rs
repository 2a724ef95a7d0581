//! Routing-key matching with AMQP topic wildcards.
//!
//! Patterns are dot-separated token sequences; `*` matches exactly one
//! token, `#` matches zero or more. Note the deliberate deviation from
//! strict AMQP semantics: a non-empty pattern never matches an empty key
//! tail, so `"change.user.#"` does NOT match `"change.user"`. Existing
//! bindings rely on this.

const STAR: &str = "*";
const HASH: &str = "#";
const SEPARATOR: char = '.';

/// Whether `pattern` matches the delivered routing `key`.
pub fn match_key(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split(SEPARATOR).collect();
    let key: Vec<&str> = key.split(SEPARATOR).collect();
    match_tokens(&pattern, &key)
}

fn match_tokens(pattern: &[&str], key: &[&str]) -> bool {
    let Some((first, rest)) = pattern.split_first() else {
        return key.is_empty();
    };
    if key.is_empty() {
        return false;
    }

    match *first {
        STAR => match_tokens(rest, &key[1..]),
        HASH => match_hash(rest, &key[1..]),
        literal => literal == key[0] && match_tokens(rest, &key[1..]),
    }
}

// Backtrack from the longest possible `#` span down to a single token.
fn match_hash(pattern: &[&str], key: &[&str]) -> bool {
    (0..=key.len())
        .rev()
        .any(|start| match_tokens(pattern, &key[start..]))
}

#[cfg(test)]
mod tests {
    use super::match_key;

    #[test]
    fn positive_cases() {
        let cases = [
            ("change.user", "change.user"),
            ("*.user", "change.user"),
            ("*.user.*", "change.user.uss"),
            ("change.#", "change.user"),
            ("change.#", "change.user.uss"),
            ("#.user.#", "change.user.uss"),
            ("change.#.uss", "change.user.420.uss"),
            ("*.user.#", "change.user.uss"),
            ("#.user.*", "change.user.uss"),
            ("change.#.uss.*", "change.user.420.uss.host1"),
        ];
        for (pattern, key) in cases {
            assert!(
                match_key(pattern, key),
                "expected pattern({pattern}) to match routing key({key})"
            );
        }
    }

    #[test]
    fn negative_cases() {
        let cases = [
            ("change.user", "delete.user"),
            ("change.user", "change.user.uss"),
            ("change.user.*", "change.user"),
            // Trailing `#` against a shorter key: kept negative, see module docs.
            ("change.user.#", "change.user"),
        ];
        for (pattern, key) in cases {
            assert!(
                !match_key(pattern, key),
                "expected pattern({pattern}) to not match routing key({key})"
            );
        }
    }

    #[test]
    fn matching_is_idempotent() {
        for _ in 0..3 {
            assert!(match_key("change.#.uss.*", "change.user.420.uss.host1"));
            assert!(!match_key("change.user.#", "change.user"));
        }
    }
}
