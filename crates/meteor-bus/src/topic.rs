//! Topic binding key matching.

/// Check whether a routing key matches a topic binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#`
/// matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && match_words(rest, tail),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(topic_matches("request", "request"));
        assert!(!topic_matches("request", "requests"));
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(topic_matches("register.*", "register.login"));
        assert!(!topic_matches("register.*", "register"));
        assert!(!topic_matches("register.*", "register.login.extra"));
    }

    #[test]
    fn test_hash_matches_any_suffix() {
        assert!(topic_matches("setJob.*.#", "setJob.alice.j1"));
        assert!(topic_matches("setJob.*.#", "setJob.alice.j1.part"));
        assert!(topic_matches("setJob.*.#", "setJob.alice"));
        assert!(!topic_matches("setJob.*.#", "setJob"));
        assert!(!topic_matches("setJob.*.#", "getJob.alice.j1"));
    }

    #[test]
    fn test_lone_hash_matches_everything() {
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("#", "a"));
    }
}
