/// Match a dotted routing key against a subscription pattern.
///
/// `*` matches exactly one segment; `#` matches zero or more trailing (or
/// interior) segments. Segments are split on `.`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn matches(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            if pattern.len() == 1 {
                return true;
            }
            // Try consuming zero or more segments of `key` for the `#` and
            // recurse on the remaining pattern.
            for i in 0..=key.len() {
                if matches(&pattern[1..], &key[i..]) {
                    return true;
                }
            }
            false
        }
        Some(&"*") => {
            !key.is_empty() && matches(&pattern[1..], &key[1..])
        }
        Some(segment) => {
            matches!(key.first(), Some(k) if k == segment) && matches(&pattern[1..], &key[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("autonomous.task.submitted", "autonomous.task.submitted"));
        assert!(!topic_matches("autonomous.task.submitted", "autonomous.task.completed"));
    }

    #[test]
    fn star_matches_single_segment() {
        assert!(topic_matches("continuous.task.*", "continuous.task.echo-agent"));
        assert!(!topic_matches("continuous.task.*", "continuous.task.echo-agent.extra"));
        assert!(!topic_matches("continuous.task.*", "continuous.task"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(topic_matches("autonomous.#", "autonomous.task.submitted"));
        assert!(topic_matches("autonomous.#", "autonomous"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#", ""));
    }

    #[test]
    fn hash_in_middle() {
        assert!(topic_matches("scoped.#.done", "scoped.a.b.c.done"));
        assert!(topic_matches("scoped.#.done", "scoped.done"));
        assert!(!topic_matches("scoped.#.done", "scoped.done.extra"));
    }
}
