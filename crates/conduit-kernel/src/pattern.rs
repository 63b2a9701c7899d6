//! Shell-style glob matching over whole strings.
//!
//! Only `*` (any run of characters, possibly empty) and `?` (exactly one
//! character) are special. There is no escaping and no character classes, and
//! `/` is an ordinary character.

/// `true` when `text` matches `pattern` from start to end.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` seen and the text index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ti));
                pi += 1;
            }
            Some('?') => {
                pi += 1;
                ti += 1;
            }
            Some(c) if *c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match backtrack {
                // Let the last star swallow one more character.
                Some((star, at)) => {
                    pi = star + 1;
                    ti = at + 1;
                    backtrack = Some((star, at + 1));
                }
                None => return false,
            },
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(glob_match("alsa", "alsa"));
        assert!(!glob_match("alsa", "alsa_output"));
        assert!(!glob_match("alsa_output", "alsa"));
    }

    #[test]
    fn trailing_star() {
        assert!(glob_match("foo-*", "foo-bar"));
        assert!(glob_match("foo-*", "foo-"));
        assert!(!glob_match("foo-*", "bar-foo"));
    }

    #[test]
    fn leading_and_inner_stars() {
        assert!(glob_match("*.monitor", "alsa_output.pci.monitor"));
        assert!(glob_match("alsa_*.pci*", "alsa_output.pci-0000"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn question_mark_consumes_one_char() {
        assert!(glob_match("hw:?", "hw:0"));
        assert!(!glob_match("hw:?", "hw:"));
        assert!(!glob_match("hw:?", "hw:10"));
    }

    #[test]
    fn star_matches_empty_and_slashes() {
        assert!(glob_match("*", ""));
        assert!(glob_match("**", "a/b/c"));
        assert!(glob_match("Audio/*", "Audio/Sink"));
    }

    #[test]
    fn empty_pattern_matches_only_empty_text() {
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn multibyte_characters_count_as_one() {
        assert!(glob_match("caf?", "café"));
    }
}
